//! Shared helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kvcoord_core::{
    BackoffConfig, ClientConfig, JsonCodec, KvClient, LeaseCache, LeaseClient, MemoryStore,
    StringCodec, TransformResult,
};

/// Client settings with millisecond backoffs
pub fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_cas_backoff(BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(8)))
        .with_watch_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
}

pub fn counter_client(
    store: &MemoryStore,
    config: ClientConfig,
) -> KvClient<MemoryStore, JsonCodec<u64>> {
    KvClient::new(Arc::new(store.clone()), JsonCodec::new(), config).unwrap()
}

pub fn string_client(
    store: &MemoryStore,
    config: ClientConfig,
) -> KvClient<MemoryStore, StringCodec> {
    KvClient::new(Arc::new(store.clone()), StringCodec, config).unwrap()
}

pub fn lease_client(
    store: &MemoryStore,
    config: ClientConfig,
) -> LeaseClient<MemoryStore, StringCodec> {
    LeaseClient::new(string_client(store, config), Arc::new(LeaseCache::new()))
}

pub fn increment(current: Option<u64>) -> TransformResult<u64> {
    Ok(Some(current.unwrap_or(0) + 1))
}

pub fn set_to(
    value: &'static str,
) -> impl FnMut(Option<String>) -> TransformResult<String> + Send {
    move |_| Ok(Some(value.to_string()))
}

/// Poll until the store reports `count` open watch streams
pub async fn wait_for_watchers(store: &MemoryStore, count: usize) {
    for _ in 0..1000 {
        if store.watcher_count().unwrap() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {} watchers", count);
}
