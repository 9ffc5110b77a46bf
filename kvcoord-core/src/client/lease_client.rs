//! Lease-aware client
//!
//! CAS attempts renew the lease the key is registered under before reading,
//! and skip the conditional write when the renewed key already holds the
//! content the transform produced. Attempts are paced by a [`Backoff`] built
//! from `ClientConfig::cas_backoff`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::kv_client::Proposal;
use super::{cancellable, record_cas, Attempt, CasOutcome, Client, KvClient, Transform};
use crate::backoff::Backoff;
use crate::codec::Codec;
use crate::error::{KvError, KvResult};
use crate::lease_cache::{ContentHash, LeaseCache};
use crate::metrics;
use crate::store::{KvStore, LeaseId, StoreError, ABSENT_REVISION};
use crate::watch::WatchHandler;

enum Renewal {
    Alive,
    NotFound,
    Failed(KvError),
}

/// `KvClient` plus a shared lease/hash cache
pub struct LeaseClient<S, C> {
    inner: KvClient<S, C>,
    cache: Arc<LeaseCache>,
}

impl<S, C> Clone for LeaseClient<S, C> {
    fn clone(&self) -> Self {
        LeaseClient { inner: self.inner.clone(), cache: Arc::clone(&self.cache) }
    }
}

impl<S, C> LeaseClient<S, C>
where
    S: KvStore,
    C: Codec,
{
    pub fn new(inner: KvClient<S, C>, cache: Arc<LeaseCache>) -> Self {
        LeaseClient { inner, cache }
    }

    pub fn cache(&self) -> &Arc<LeaseCache> {
        &self.cache
    }

    pub fn inner(&self) -> &KvClient<S, C> {
        &self.inner
    }

    async fn renew(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lease: LeaseId,
    ) -> KvResult<Renewal> {
        debug!(key, lease = %lease, "Renewing lease");

        match cancellable(cancel, self.inner.store().renew_lease(lease)).await {
            Ok(()) => {
                metrics::lease_operation("renew", "ok");
                Ok(Renewal::Alive)
            }
            Err(KvError::Store(StoreError::LeaseNotFound(_))) => {
                metrics::lease_operation("renew", "not_found");
                debug!(key, lease = %lease, "Lease not found, will re-register");
                self.cache.forget_lease(key);
                Ok(Renewal::NotFound)
            }
            Err(KvError::Cancelled) => Err(KvError::Cancelled),
            Err(e) => {
                metrics::lease_operation("renew", "error");
                Ok(Renewal::Failed(e))
            }
        }
    }

    /// Fresh lease for the next write, if a TTL is configured
    async fn grant(&self, cancel: &CancellationToken) -> KvResult<Option<LeaseId>> {
        let Some(ttl) = self.inner.config().lease_ttl else {
            return Ok(None);
        };

        let result = cancellable(cancel, self.inner.store().grant_lease(ttl)).await;
        match &result {
            Ok(_) => metrics::lease_operation("grant", "ok"),
            Err(KvError::Cancelled) => {}
            Err(_) => metrics::lease_operation("grant", "error"),
        }
        result.map(Some)
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
        let cached = self.cache.lease(key);
        let mut renewed = None;

        if let Some(lease) = cached {
            match self.renew(cancel, key, lease).await? {
                Renewal::Alive => renewed = Some(lease),
                Renewal::NotFound => {}
                Renewal::Failed(e) => return Ok(Attempt::Retry(Some(e))),
            }
        }

        let current = match self.inner.read(cancel, key).await {
            Ok(current) => current,
            Err(KvError::Cancelled) => return Err(KvError::Cancelled),
            Err(e) => return Ok(Attempt::Retry(Some(e))),
        };
        let revision = current.as_ref().map_or(ABSENT_REVISION, |kv| kv.revision);
        let stored_lease = current.as_ref().and_then(|kv| kv.lease);

        // Adopt the lease the key is already registered under, unless it is
        // the one that just failed to renew.
        if let (None, Some(kv)) = (renewed, current.as_ref()) {
            if let Some(lease) = kv.lease.filter(|l| Some(*l) != cached) {
                match self.renew(cancel, key, lease).await? {
                    Renewal::Alive => {
                        debug!(key, lease = %lease, "Adopted lease from stored entry");
                        self.cache.adopt(key, lease, ContentHash::of(&kv.value));
                        renewed = Some(lease);
                    }
                    Renewal::NotFound => {}
                    Renewal::Failed(e) => return Ok(Attempt::Retry(Some(e))),
                }
            }
        }

        let bytes = match self.inner.propose(key, current.as_ref(), transform)? {
            Proposal::Write(bytes) => bytes,
            Proposal::Keep => return Ok(Attempt::Done(CasOutcome::NoOp)),
            Proposal::Retry(e) => return Ok(Attempt::Retry(Some(e))),
        };
        let hash = ContentHash::of(&bytes);

        if let Some(lease) = renewed {
            let cached_hash = self.cache.get(key).and_then(|e| e.hash);
            if cached_hash == Some(hash) && stored_lease == Some(lease) {
                info!(key, lease = %lease, %hash, "Content unchanged, skipping write");
                return Ok(Attempt::Done(CasOutcome::Unchanged));
            }
        }

        let lease = match self.grant(cancel).await {
            Ok(Some(granted)) => {
                debug!(key, lease = %granted, "Registering with fresh lease");
                Some(granted)
            }
            Ok(None) => renewed,
            Err(KvError::Cancelled) => return Err(KvError::Cancelled),
            Err(e) => return Ok(Attempt::Retry(Some(e))),
        };

        let put = self.inner.store().conditional_put(key, bytes, revision, lease);
        match cancellable(cancel, put).await {
            Ok(true) => {
                self.cache.record(key, lease, hash);
                Ok(Attempt::Done(CasOutcome::Committed))
            }
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
        let config = self.inner.config();
        let mut backoff = Backoff::new(
            cancel.clone(),
            config.cas_backoff.clone().with_max_retries(config.max_retries),
        );
        let mut attempts = 0;
        let mut last_error = None;

        while backoff.ongoing() {
            attempts += 1;
            metrics::cas_attempt("lease");

            match self.attempt(cancel, key, &mut transform).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Retry(None) => {
                    debug!(key, attempt = attempts, "CAS lost to a concurrent write, backing off");
                }
                Attempt::Retry(Some(e)) => {
                    warn!(key, attempt = attempts, error = %e, "CAS attempt failed, backing off");
                    last_error = Some(e);
                }
            }

            backoff.wait().await;
        }

        if cancel.is_cancelled() {
            return Err(KvError::Cancelled);
        }
        Err(last_error.unwrap_or_else(|| KvError::RetriesExhausted {
            key: key.to_string(),
            attempts,
        }))
    }
}

#[async_trait]
impl<S, C> Client for LeaseClient<S, C>
where
    S: KvStore,
    C: Codec,
{
    type Value = C::Value;

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> KvResult<Vec<String>> {
        self.inner.list(cancel, prefix).await
    }

    async fn get(&self, cancel: &CancellationToken, key: &str) -> KvResult<Option<C::Value>> {
        self.inner.get(cancel, key).await
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> KvResult<()> {
        self.inner.delete(cancel, key).await
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
        self.inner.watch_key(cancel, key, handler).await
    }

    async fn watch_prefix<H>(&self, cancel: &CancellationToken, prefix: &str, handler: H)
    where
        H: WatchHandler<Self::Value>,
    {
        self.inner.watch_prefix(cancel, prefix, handler).await
    }
}
