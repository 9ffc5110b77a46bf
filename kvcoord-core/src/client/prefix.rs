//! Namespacing wrapper: every key goes through `prefix + key`

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Client, Transform};
use crate::error::{KvError, KvResult};
use crate::watch::{WatchEvent, WatchHandler};

/// Client scoped to a key prefix
#[derive(Clone)]
pub struct PrefixClient<T> {
    inner: T,
    prefix: String,
}

impl<T: Client> PrefixClient<T> {
    pub fn new(inner: T, prefix: impl Into<String>) -> Self {
        PrefixClient { inner, prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// Strips the namespace from keys before handing events on
struct StripPrefix<H> {
    prefix: String,
    handler: H,
}

impl<V, H> WatchHandler<V> for StripPrefix<H>
where
    H: WatchHandler<V>,
{
    fn on_event(&mut self, mut event: WatchEvent<V>) -> bool {
        match event.key.strip_prefix(self.prefix.as_str()) {
            Some(stripped) => {
                event.key = stripped.to_string();
                self.handler.on_event(event)
            }
            None => {
                warn!(key = %event.key, prefix = %self.prefix, "Watch event outside namespace");
                true
            }
        }
    }
}

#[async_trait]
impl<T: Client> Client for PrefixClient<T> {
    type Value = T::Value;

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> KvResult<Vec<String>> {
        let keys = self.inner.list(cancel, &self.full_key(prefix)).await?;
        keys.into_iter()
            .map(|key| match key.strip_prefix(self.prefix.as_str()) {
                Some(stripped) => Ok(stripped.to_string()),
                None => Err(KvError::UnexpectedResponse(format!(
                    "key {} is missing prefix {}",
                    key, self.prefix
                ))),
            })
            .collect()
    }

    async fn get(&self, cancel: &CancellationToken, key: &str) -> KvResult<Option<T::Value>> {
        self.inner.get(cancel, &self.full_key(key)).await
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> KvResult<()> {
        self.inner.delete(cancel, &self.full_key(key)).await
    }

    async fn cas<X>(&self, cancel: &CancellationToken, key: &str, transform: X) -> KvResult<()>
    where
        X: Transform<Self::Value>,
    {
        self.inner.cas(cancel, &self.full_key(key), transform).await
    }

    async fn watch_key<H>(&self, cancel: &CancellationToken, key: &str, handler: H)
    where
        H: WatchHandler<Self::Value>,
    {
        let handler = StripPrefix { prefix: self.prefix.clone(), handler };
        self.inner.watch_key(cancel, &self.full_key(key), handler).await
    }

    async fn watch_prefix<H>(&self, cancel: &CancellationToken, prefix: &str, handler: H)
    where
        H: WatchHandler<Self::Value>,
    {
        let handler = StripPrefix { prefix: self.prefix.clone(), handler };
        self.inner.watch_prefix(cancel, &self.full_key(prefix), handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{KvClient, TransformResult};
    use crate::codec::StringCodec;
    use crate::config::ClientConfig;
    use crate::store::{KvStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn scoped(store: &MemoryStore) -> PrefixClient<KvClient<MemoryStore, StringCodec>> {
        let inner =
            KvClient::new(Arc::new(store.clone()), StringCodec, ClientConfig::default()).unwrap();
        PrefixClient::new(inner, "tenant-a/")
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let store = MemoryStore::new();
        let client = scoped(&store);
        let cancel = CancellationToken::new();

        let set = |_: Option<String>| -> TransformResult<String> { Ok(Some("on".to_string())) };
        client.cas(&cancel, "flags/x", set).await.unwrap();
        store.put("tenant-b/flags/y", "off").unwrap();

        assert!(store.get("tenant-a/flags/x").await.unwrap().is_some());
        assert_eq!(client.get(&cancel, "flags/x").await.unwrap(), Some("on".to_string()));
        assert_eq!(client.get(&cancel, "flags/y").await.unwrap(), None);
        assert_eq!(client.list(&cancel, "flags/").await.unwrap(), vec!["flags/x"]);

        client.delete(&cancel, "flags/x").await.unwrap();
        assert!(client.list(&cancel, "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_prefix_strips_namespace() {
        let store = MemoryStore::new();
        let client = scoped(&store);
        let cancel = CancellationToken::new();

        let watcher = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                let mut keys = Vec::new();
                client
                    .watch_prefix(&cancel, "flags/", |event: WatchEvent<String>| {
                        keys.push(event.key);
                        keys.len() < 2
                    })
                    .await;
                keys
            }
        });

        while store.watcher_count().unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        store.put("tenant-b/flags/x", "ignored").unwrap();
        store.put("tenant-a/flags/x", "1").unwrap();
        store.put("tenant-a/flags/y", "2").unwrap();

        let keys = tokio::time::timeout(Duration::from_secs(5), watcher).await.unwrap().unwrap();
        assert_eq!(keys, vec!["flags/x", "flags/y"]);
    }
}
