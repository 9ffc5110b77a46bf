/*
    Store - the revision-versioned key-value store the client coordinates over

    Responsibilities:
    `store` defines the capabilities the client needs from a distributed store:
    - point reads returning the value and its revision
    - prefix reads and key-only listing
    - best-effort deletes
    - conditional puts guarded by the revision observed at read time
    - lease grant/renew for TTL-bound keys
    - watch streams over a key or a prefix

    Replication and consensus are the store's business. Everything here is
    the contract the CAS engine and the watch loop are written against.

    Delete notifications are explicit: every `StoreEvent` carries an
    `EventKind`. A store that cannot distinguish a delete from an empty put
    must report it as a `Put` with an empty payload; the watch loop then drops
    it as undecodable.
*/

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;

/// Revision reported for keys that do not exist
pub const ABSENT_REVISION: i64 = 0;

/// Server-issued lease identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Errors reported by a store client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the request
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The lease expired or was revoked
    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    /// A watch stream broke
    #[error("watch stream error: {0}")]
    Watch(String),

    /// The request was malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A stored entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last write to this key
    pub revision: i64,
    /// Lease the key is attached to, if any
    pub lease: Option<LeaseId>,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub key: String,
    /// New payload; empty for deletes
    pub value: Vec<u8>,
    /// Store revision at which the change happened
    pub revision: i64,
}

/// What a watch stream covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchScope {
    Key(String),
    Prefix(String),
}

impl WatchScope {
    /// Check if a key falls inside this scope
    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchScope::Key(k) => k == key,
            WatchScope::Prefix(p) => key.starts_with(p.as_str()),
        }
    }

    /// The key or prefix this scope is rooted at
    pub fn root(&self) -> &str {
        match self {
            WatchScope::Key(k) | WatchScope::Prefix(k) => k,
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::Key(k) => write!(f, "key:{}", k),
            WatchScope::Prefix(p) => write!(f, "prefix:{}", p),
        }
    }
}

/// Stream of change batches; an `Err` item means the stream is broken
pub type WatchStream = BoxStream<'static, Result<Vec<StoreEvent>, StoreError>>;

/// Client-side view of a revision-versioned key-value store
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a key; `None` if absent
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Read every entry under a prefix, ordered by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// List keys under a prefix without their values
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Put `value` only if the key's revision still equals `expected_revision`
    ///
    /// Returns `Ok(false)` when the comparison failed. The check and the write
    /// are atomic on the store side.
    async fn conditional_put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError>;

    /// Grant a lease that expires after `ttl` unless renewed
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Renew a lease once; `StoreError::LeaseNotFound` if it is gone
    async fn renew_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Open a watch stream over a key or prefix
    async fn watch(&self, scope: WatchScope) -> Result<WatchStream, StoreError>;
}
