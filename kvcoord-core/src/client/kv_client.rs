//! Base client: CAS with a fixed attempt budget and no delay between attempts

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{cancellable, record_cas, Attempt, CasOutcome, Client, Transform};
use crate::codec::Codec;
use crate::config::{ClientConfig, ConfigError};
use crate::error::{KvError, KvResult};
use crate::metrics;
use crate::store::{KeyValue, KvStore, WatchScope, ABSENT_REVISION};
use crate::watch::{run_watch, WatchHandler};

/// What a transform asked for, already encoded
pub(crate) enum Proposal {
    /// Transform returned `None`
    Keep,
    /// Retryable transform failure
    Retry(KvError),
    /// Encoded bytes to write
    Write(Vec<u8>),
}

/// Client over a `KvStore` and a `Codec`
pub struct KvClient<S, C> {
    store: Arc<S>,
    codec: Arc<C>,
    config: ClientConfig,
}

impl<S, C> Clone for KvClient<S, C> {
    fn clone(&self) -> Self {
        KvClient {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
            config: self.config.clone(),
        }
    }
}

impl<S, C> KvClient<S, C>
where
    S: KvStore,
    C: Codec,
{
    /// Create a client; fails if `config` does not validate
    pub fn new(store: Arc<S>, codec: C, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(KvClient { store, codec: Arc::new(codec), config })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Read `key`, racing the call against `cancel`
    pub(crate) async fn read(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> KvResult<Option<KeyValue>> {
        cancellable(cancel, self.store.get(key)).await
    }

    /// Decode the stored value, run the transform and encode its output
    ///
    /// Codec failures and non-retryable transform errors are returned as
    /// `Err`; everything else is a `Proposal`.
    pub(crate) fn propose<T>(
        &self,
        key: &str,
        current: Option<&KeyValue>,
        transform: &mut T,
    ) -> KvResult<Proposal>
    where
        T: Transform<C::Value>,
    {
        let decoded = match current {
            Some(kv) => Some(self.codec.unmarshal(&kv.value)?),
            None => None,
        };

        match transform.apply(decoded) {
            Ok(Some(next)) => Ok(Proposal::Write(self.codec.marshal(&next)?)),
            Ok(None) => Ok(Proposal::Keep),
            Err(e) if e.is_retryable() => Ok(Proposal::Retry(e.into_kv_error(key))),
            Err(e) => Err(e.into_kv_error(key)),
        }
    }

    async fn attempt<T>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        transform: &mut T,
    ) -> KvResult<Attempt>
    where
        T: Transform<C::Value>,
    {
        let current = match self.read(cancel, key).await {
            Ok(current) => current,
            Err(KvError::Cancelled) => return Err(KvError::Cancelled),
            Err(e) => return Ok(Attempt::Retry(Some(e))),
        };
        let revision = current.as_ref().map_or(ABSENT_REVISION, |kv| kv.revision);

        let bytes = match self.propose(key, current.as_ref(), transform)? {
            Proposal::Write(bytes) => bytes,
            Proposal::Keep => return Ok(Attempt::Done(CasOutcome::NoOp)),
            Proposal::Retry(e) => return Ok(Attempt::Retry(Some(e))),
        };

        match cancellable(cancel, self.store.conditional_put(key, bytes, revision, None)).await {
            Ok(true) => Ok(Attempt::Done(CasOutcome::Committed)),
            Ok(false) => {
                metrics::cas_conflict();
                Ok(Attempt::Retry(None))
            }
            Err(KvError::Cancelled) => Err(KvError::Cancelled),
            Err(e) => Ok(Attempt::Retry(Some(e))),
        }
    }

    async fn run_cas<T>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        mut transform: T,
    ) -> KvResult<CasOutcome>
    where
        T: Transform<C::Value>,
    {
        let attempts = self.config.max_retries;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(KvError::Cancelled);
            }
            metrics::cas_attempt("base");

            match self.attempt(cancel, key, &mut transform).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Retry(None) => {
                    debug!(key, attempt, "CAS lost to a concurrent write, retrying");
                }
                Attempt::Retry(Some(e)) => {
                    warn!(key, attempt, error = %e, "CAS attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| KvError::RetriesExhausted {
            key: key.to_string(),
            attempts,
        }))
    }
}

#[async_trait]
impl<S, C> Client for KvClient<S, C>
where
    S: KvStore,
    C: Codec,
{
    type Value = C::Value;

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> KvResult<Vec<String>> {
        cancellable(cancel, self.store.list_keys(prefix)).await
    }

    async fn get(&self, cancel: &CancellationToken, key: &str) -> KvResult<Option<C::Value>> {
        match self.read(cancel, key).await? {
            Some(kv) => Ok(Some(self.codec.unmarshal(&kv.value)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> KvResult<()> {
        cancellable(cancel, self.store.delete(key)).await
    }

    async fn cas<T>(&self, cancel: &CancellationToken, key: &str, transform: T) -> KvResult<()>
    where
        T: Transform<Self::Value>,
    {
        let started = Instant::now();
        let mut result = self.run_cas(cancel, key, transform).await;
        if result.is_err() && cancel.is_cancelled() {
            result = Err(KvError::Cancelled);
        }
        record_cas(&result, started);
        result.map(|_| ())
    }

    async fn watch_key<H>(&self, cancel: &CancellationToken, key: &str, handler: H)
    where
        H: WatchHandler<Self::Value>,
    {
        let scope = WatchScope::Key(key.to_string());
        run_watch(&*self.store, &*self.codec, &self.config.watch_backoff, cancel, scope, handler)
            .await
    }

    async fn watch_prefix<H>(&self, cancel: &CancellationToken, prefix: &str, handler: H)
    where
        H: WatchHandler<Self::Value>,
    {
        let scope = WatchScope::Prefix(prefix.to_string());
        run_watch(&*self.store, &*self.codec, &self.config.watch_backoff, cancel, scope, handler)
            .await
    }
}
