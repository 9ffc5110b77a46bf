/*
    Client - high-level CAS and watch operations over a KvStore

    Responsibilities:
    `client` exposes the operations callers use instead of raw store calls:
    - list / get / delete, decoding values through a Codec
    - cas: read, transform, conditionally write, retry on contention
    - watch_key / watch_prefix: long-lived reconnecting subscriptions

    Variants:
    - `KvClient`     base CAS, fixed attempt budget, no delay between attempts
    - `LeaseClient`  lease-aware CAS, renews leases and skips unchanged writes
    - `PrefixClient` namespaces any client under a key prefix

    `create_client` assembles the usual stack: lease-aware client over a
    store, wrapped in a `PrefixClient`.

    Every store call is raced against the caller's cancellation token, so a
    fired token aborts in-flight requests.
*/

mod kv_client;
mod lease_client;
mod prefix;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::config::{ClientConfig, ConfigError};
use crate::error::{KvError, KvResult, TransformError};
use crate::lease_cache::LeaseCache;
use crate::metrics;
use crate::store::{KvStore, StoreError};
use crate::watch::WatchHandler;

pub use kv_client::KvClient;
pub use lease_client::LeaseClient;
pub use prefix::PrefixClient;

/// Return type of a transform
pub type TransformResult<V> = Result<Option<V>, TransformError>;

/// Computes the value a CAS call should write
///
/// Receives the current decoded value (`None` if the key is absent) and
/// returns the value to write, `Ok(None)` to leave the key as it is, or a
/// [`TransformError`] saying whether another attempt may succeed.
pub trait Transform<V>: Send {
    fn apply(&mut self, current: Option<V>) -> TransformResult<V>;
}

impl<V, F> Transform<V> for F
where
    F: FnMut(Option<V>) -> TransformResult<V> + Send,
{
    fn apply(&mut self, current: Option<V>) -> TransformResult<V> {
        self(current)
    }
}

/// High-level key-value client
#[async_trait]
pub trait Client: Send + Sync {
    /// Decoded value type
    type Value: Send + 'static;

    /// Keys under `prefix`, prefix included
    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> KvResult<Vec<String>>;

    /// Decoded value under `key`; `None` if absent
    async fn get(&self, cancel: &CancellationToken, key: &str) -> KvResult<Option<Self::Value>>;

    /// Delete `key`; absent keys are not an error
    async fn delete(&self, cancel: &CancellationToken, key: &str) -> KvResult<()>;

    /// Compare-and-swap `key` through `transform`
    ///
    /// Only one of several concurrent callers commits per observed revision;
    /// the others re-read and re-apply their transform.
    async fn cas<T>(&self, cancel: &CancellationToken, key: &str, transform: T) -> KvResult<()>
    where
        T: Transform<Self::Value>;

    /// Call `handler` on every change to `key` until it returns `false` or
    /// `cancel` fires
    async fn watch_key<H>(&self, cancel: &CancellationToken, key: &str, handler: H)
    where
        H: WatchHandler<Self::Value>;

    /// Call `handler` on every change under `prefix` until it returns `false`
    /// or `cancel` fires
    async fn watch_prefix<H>(&self, cancel: &CancellationToken, prefix: &str, handler: H)
    where
        H: WatchHandler<Self::Value>;
}

/// Build a lease-aware client over `store`, scoped under `prefix`
///
/// An empty prefix leaves keys untouched. Fails if `config` does not validate.
pub fn create_client<S, C>(
    store: Arc<S>,
    codec: C,
    prefix: &str,
    config: ClientConfig,
) -> Result<PrefixClient<LeaseClient<S, C>>, ConfigError>
where
    S: KvStore,
    C: Codec,
{
    let inner = KvClient::new(store, codec, config)?;
    let client = LeaseClient::new(inner, Arc::new(LeaseCache::new()));
    Ok(PrefixClient::new(client, prefix))
}

/// How a successful CAS call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CasOutcome {
    /// A new value was written
    Committed,
    /// Lease renewed and content identical; nothing written
    Unchanged,
    /// Transform returned `None`
    NoOp,
}

/// Result of a single CAS attempt that did not fail terminally
pub(crate) enum Attempt {
    Done(CasOutcome),
    /// Try again; carries the transient error, or `None` after a lost comparison
    Retry(Option<KvError>),
}

/// Run a store call, giving up as soon as `cancel` fires
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> KvResult<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KvError::Cancelled),
        result = call => result.map_err(KvError::from),
    }
}

/// Record the outcome of a CAS call
pub(crate) fn record_cas(result: &KvResult<CasOutcome>, started: Instant) {
    let label = match result {
        Ok(CasOutcome::Committed) => "committed",
        Ok(CasOutcome::Unchanged) => "unchanged",
        Ok(CasOutcome::NoOp) => "noop",
        Err(KvError::Cancelled) => "cancelled",
        Err(KvError::RetriesExhausted { .. }) => "exhausted",
        Err(KvError::Transform { .. }) => "aborted",
        Err(_) => "failed",
    };
    metrics::cas_result(label, started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let token = CancellationToken::new();
        let value = cancellable(&token, async { Ok::<_, StoreError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = cancellable(&token, async {
            Err::<(), _>(StoreError::Unavailable("down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KvError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_cancellable_aborts_pending_call() {
        let token = CancellationToken::new();
        token.cancel();

        let err = cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KvError::Cancelled));
    }

    #[tokio::test]
    async fn test_create_client_scopes_keys() {
        use crate::codec::StringCodec;
        use crate::store::MemoryStore;

        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let set = |_: Option<String>| -> TransformResult<String> { Ok(Some("up".to_string())) };

        let scoped =
            create_client(Arc::new(store.clone()), StringCodec, "svc/", ClientConfig::default())
                .unwrap();
        scoped.cas(&cancel, "a", set).await.unwrap();
        assert!(store.get("svc/a").await.unwrap().is_some());

        let bare = create_client(Arc::new(store.clone()), StringCodec, "", ClientConfig::default())
            .unwrap();
        assert_eq!(bare.get(&cancel, "svc/a").await.unwrap(), Some("up".to_string()));
        assert_eq!(bare.list(&cancel, "").await.unwrap(), vec!["svc/a"]);

        let invalid = ClientConfig::default().with_max_retries(0);
        assert!(create_client(Arc::new(store), StringCodec, "svc/", invalid).is_err());
    }

    #[test]
    fn test_closure_is_transform() {
        let mut calls = 0;
        let mut transform = |current: Option<u32>| -> TransformResult<u32> {
            calls += 1;
            Ok(Some(current.unwrap_or(0) + 1))
        };
        assert_eq!(Transform::apply(&mut transform, Some(1)).unwrap(), Some(2));
        assert_eq!(Transform::apply(&mut transform, None).unwrap(), Some(1));
        drop(transform);
        assert_eq!(calls, 2);
    }
}
