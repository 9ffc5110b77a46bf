//! Client-side coordination over a revision-versioned key-value store
//!
//! - compare-and-swap updates with bounded retry ([`client::KvClient`]), and a
//!   lease-aware variant that renews leases and skips unchanged writes
//!   ([`client::LeaseClient`])
//! - reconnecting key and prefix watches ([`watch`])
//! - an in-memory store for tests and single-process use ([`store::MemoryStore`])

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod lease_cache;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod store;
pub mod watch;

pub use backoff::{Backoff, BackoffConfig, BackoffError};
pub use client::{
    create_client, Client, KvClient, LeaseClient, PrefixClient, Transform, TransformResult,
};
pub use codec::{Codec, CodecError, JsonCodec, StringCodec};
pub use config::{ClientConfig, Config, ConfigError};
pub use error::{KvError, KvResult, TransformError};
pub use lease_cache::{ContentHash, LeaseCache};
pub use logging::{init_logging, LogLevel};
pub use shutdown::ShutdownCoordinator;
pub use store::{EventKind, KeyValue, KvStore, LeaseId, MemoryStore, StoreError, WatchScope};
pub use watch::{WatchEvent, WatchHandler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = ClientConfig::default();
        let _ = MemoryStore::new();
    }
}
