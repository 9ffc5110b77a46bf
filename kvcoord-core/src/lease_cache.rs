//! Per-key cache of the last lease and content hash written by this process
//!
//! The lease-aware client consults it to renew the right lease and to skip
//! writes whose content has not changed. It is an optimization only: two
//! writers on the same key are serialized by the store's conditional put,
//! never by this cache. Entries live for the lifetime of the cache; if the
//! store expires a lease without us noticing, the next renewal reports
//! `LeaseNotFound` and the entry's lease is dropped.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::store::LeaseId;

/// Deterministic hash of an encoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a payload
    pub fn of(bytes: &[u8]) -> Self {
        ContentHash(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// What the cache knows about one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseEntry {
    pub lease: Option<LeaseId>,
    pub hash: Option<ContentHash>,
}

/// Mutex-guarded map of key -> (lease, hash)
#[derive(Debug, Default)]
pub struct LeaseCache {
    entries: Mutex<HashMap<String, LeaseEntry>>,
}

impl LeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<LeaseEntry> {
        self.entries.lock().get(key).copied()
    }

    /// Lease cached for a key
    pub fn lease(&self, key: &str) -> Option<LeaseId> {
        self.get(key).and_then(|e| e.lease)
    }

    /// Record a successful write
    pub fn record(&self, key: &str, lease: Option<LeaseId>, hash: ContentHash) {
        self.entries
            .lock()
            .insert(key.to_string(), LeaseEntry { lease, hash: Some(hash) });
    }

    /// Record a lease adopted from the store without writing
    ///
    /// `stored` is the hash of the payload currently under the key, which
    /// replaces whatever this process last wrote.
    pub fn adopt(&self, key: &str, lease: LeaseId, stored: ContentHash) {
        self.record(key, Some(lease), stored);
    }

    /// Drop the cached lease for a key, keeping its hash
    pub fn forget_lease(&self, key: &str) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.lease = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
