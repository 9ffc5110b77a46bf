/*
    MemoryStore - in-process revision-versioned key-value store

    Responsibilities:
    `memory.rs` implements `KvStore` entirely in memory. It is the backend for
    tests, the CLI demos and single-process deployments.
    It handles:
    - a global revision counter stamped on every write and delete
    - atomic compare-revision-then-put
    - leases with TTL; expired leases delete their keys (checked lazily on
      every call, so paused tokio time drives expiry deterministically)
    - key and prefix watch streams fed from unbounded channels

    Test hooks:
    - `disconnect_watchers` breaks every open stream with an error
    - `close_watchers` ends every open stream as if the store hung up
    - `fail_next` queues an error for the next call of a given operation
    - `stall` makes calls of a given operation hang until dropped
    - `queue_competing_write` simulates a writer racing ahead of the next
      conditional put on a key
    - `set_always_conflict` makes every conditional put lose
    - `stats` counts reads, puts, lease traffic and opened watches
*/

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::{
    EventKind, KeyValue, KvStore, LeaseId, StoreError, StoreEvent, WatchScope, WatchStream,
    ABSENT_REVISION,
};

/// Store operations that can have failures injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    GetPrefix,
    ListKeys,
    Delete,
    ConditionalPut,
    GrantLease,
    RenewLease,
    Watch,
}

/// Call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Point and prefix reads
    pub reads: u64,
    /// Conditional puts attempted
    pub conditional_puts: u64,
    /// Conditional puts whose comparison held
    pub committed_puts: u64,
    pub lease_grants: u64,
    pub lease_renewals: u64,
    pub watches_opened: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: BTreeSet<String>,
}

type WatchSender = mpsc::UnboundedSender<Result<Vec<StoreEvent>, StoreError>>;

struct Watcher {
    scope: WatchScope,
    tx: WatchSender,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
    revision: i64,
    next_lease: i64,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    competing_writes: HashMap<String, VecDeque<Vec<u8>>>,
    always_conflict: bool,
    stalled: HashSet<StoreOp>,
    stats: StoreStats,
}

impl State {
    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?op, error = %err, "Injected store failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!(lease = %id, "Lease expired");
            self.remove_lease(id);
        }
    }

    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };

        let mut events = Vec::new();
        for key in lease.keys {
            if self.entries.remove(&key).is_some() {
                self.revision += 1;
                events.push(StoreEvent {
                    kind: EventKind::Delete,
                    key,
                    value: Vec::new(),
                    revision: self.revision,
                });
            }
        }
        self.notify(events);
        true
    }

    fn detach(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.remove(key);
            }
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
        let previous = self.entries.get(key).and_then(|e| e.lease);
        if previous != lease {
            self.detach(key, previous);
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        self.revision += 1;
        self.entries.insert(
            key.to_string(),
            Entry { value: value.clone(), revision: self.revision, lease },
        );
        self.notify(vec![StoreEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value,
            revision: self.revision,
        }]);
    }

    fn notify(&mut self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            let matching: Vec<StoreEvent> =
                events.iter().filter(|e| watcher.scope.matches(&e.key)).cloned().collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(matching)).is_ok()
        });
    }

    fn key_value(key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            revision: entry.revision,
            lease: entry.lease,
        }
    }
}

/// In-memory `KvStore`
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("Failed to acquire store lock: {}", e)))?;
        state.expire_leases(Instant::now());
        Ok(state)
    }

    /// Current store revision
    pub fn revision(&self) -> Result<i64, StoreError> {
        Ok(self.lock()?.revision)
    }

    /// Number of watch streams still open
    pub fn watcher_count(&self) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        state.watchers.retain(|w| !w.tx.is_closed());
        Ok(state.watchers.len())
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self.lock()?.stats.clone())
    }

    /// Unconditionally write a key, bypassing the revision check
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        state.put(key, value.into(), None);
        Ok(state.revision)
    }

    /// Break every open watch stream with an error
    pub fn disconnect_watchers(&self) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let watchers = std::mem::take(&mut state.watchers);
        let count = watchers.len();
        for watcher in watchers {
            let _ = watcher.tx.send(Err(StoreError::Watch("connection reset".to_string())));
        }
        debug!(count, "Disconnected watchers");
        Ok(count)
    }

    /// End every open watch stream cleanly, without an error item
    pub fn close_watchers(&self) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let count = state.watchers.len();
        state.watchers.clear();
        debug!(count, "Closed watchers");
        Ok(count)
    }

    /// Make every call of `op` hang without returning, or release it again
    ///
    /// Calls already hanging stay pending until their future is dropped.
    pub fn stall(&self, op: StoreOp, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if enabled {
            state.stalled.insert(op);
        } else {
            state.stalled.remove(&op);
        }
        Ok(())
    }

    async fn hold_if_stalled(&self, op: StoreOp) -> Result<(), StoreError> {
        let stalled = self.lock()?.stalled.contains(&op);
        if stalled {
            trace!(?op, "Store call stalled");
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    /// Queue an error for the next call of `op`
    pub fn fail_next(&self, op: StoreOp, err: StoreError) -> Result<(), StoreError> {
        self.lock()?.failures.entry(op).or_default().push_back(err);
        Ok(())
    }

    /// Apply `value` to `key` right before the next conditional put on it
    pub fn queue_competing_write(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StoreError> {
        self.lock()?
            .competing_writes
            .entry(key.to_string())
            .or_default()
            .push_back(value.into());
        Ok(())
    }

    /// Make every conditional put lose its comparison
    pub fn set_always_conflict(&self, enabled: bool) -> Result<(), StoreError> {
        self.lock()?.always_conflict = enabled;
        Ok(())
    }

    /// Revoke a lease, deleting its keys
    pub fn revoke_lease(&self, lease: LeaseId) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove_lease(lease))
    }

    /// Remaining time to live of a lease
    pub fn lease_ttl(&self, lease: LeaseId) -> Result<Option<Duration>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .leases
            .get(&lease)
            .map(|l| l.expires_at.saturating_duration_since(Instant::now())))
    }
}

fn lease_deadline(ttl: Duration) -> Result<Instant, StoreError> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| StoreError::InvalidRequest(format!("lease TTL {:?} is out of range", ttl)))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        self.hold_if_stalled(StoreOp::Get).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::Get)?;
        state.stats.reads += 1;
        Ok(state.entries.get(key).map(|e| State::key_value(key, e)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.hold_if_stalled(StoreOp::GetPrefix).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::GetPrefix)?;
        state.stats.reads += 1;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| State::key_value(k, e))
            .collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.hold_if_stalled(StoreOp::ListKeys).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::ListKeys)?;
        state.stats.reads += 1;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.hold_if_stalled(StoreOp::Delete).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::Delete)?;

        if let Some(entry) = state.entries.remove(key) {
            state.detach(key, entry.lease);
            state.revision += 1;
            let revision = state.revision;
            state.notify(vec![StoreEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                revision,
            }]);
        }
        Ok(())
    }

    async fn conditional_put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        self.hold_if_stalled(StoreOp::ConditionalPut).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::ConditionalPut)?;
        state.stats.conditional_puts += 1;

        if let Some(competing) =
            state.competing_writes.get_mut(key).and_then(VecDeque::pop_front)
        {
            let competing_lease = state.entries.get(key).and_then(|e| e.lease);
            state.put(key, competing, competing_lease);
        }

        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let current = state.entries.get(key).map_or(ABSENT_REVISION, |e| e.revision);
        if state.always_conflict || current != expected_revision {
            trace!(key, expected_revision, current, "Conditional put lost comparison");
            return Ok(false);
        }

        state.put(key, value, lease);
        state.stats.committed_puts += 1;
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidRequest("lease TTL must be positive".to_string()));
        }
        self.hold_if_stalled(StoreOp::GrantLease).await?;

        let mut state = self.lock()?;
        state.take_failure(StoreOp::GrantLease)?;
        let expires_at = lease_deadline(ttl)?;
        state.stats.lease_grants += 1;
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);
        state.leases.insert(id, Lease { ttl, expires_at, keys: BTreeSet::new() });
        Ok(id)
    }

    async fn renew_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.hold_if_stalled(StoreOp::RenewLease).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::RenewLease)?;
        state.stats.lease_renewals += 1;

        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = lease_deadline(l.ttl)?;
                Ok(())
            }
            None => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn watch(&self, scope: WatchScope) -> Result<WatchStream, StoreError> {
        self.hold_if_stalled(StoreOp::Watch).await?;
        let mut state = self.lock()?;
        state.take_failure(StoreOp::Watch)?;
        state.stats.watches_opened += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        debug!(%scope, "Watch stream opened");
        state.watchers.push(Watcher { scope, tx });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
