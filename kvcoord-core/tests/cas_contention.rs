//! CAS behaviour under contention and failure
//!
//! Run with: cargo test --test cas_contention

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{counter_client, fast_config, increment, string_client};
use kvcoord_core::store::memory::StoreOp;
use kvcoord_core::{
    Client, JsonCodec, KvError, KvStore, LeaseCache, LeaseClient, MemoryStore, StoreError,
    TransformError, TransformResult,
};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_lose_nothing() {
    let store = MemoryStore::new();
    let client = counter_client(&store, fast_config().with_max_retries(10_000));
    let cancel = CancellationToken::new();

    let mut handles = vec![];
    for _ in 0..16 {
        let client = client.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                client.cas(&cancel, "ctr", increment).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.get(&cancel, "ctr").await.unwrap(), Some(400));
    let stats = store.stats().unwrap();
    assert_eq!(stats.committed_puts, 400);
    assert!(stats.conditional_puts >= 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_client_increments_lose_nothing() {
    let store = MemoryStore::new();
    let inner = counter_client(&store, fast_config().with_max_retries(500));
    let client = LeaseClient::new(inner, Arc::new(LeaseCache::new()));
    let cancel = CancellationToken::new();

    let mut handles = vec![];
    for _ in 0..8 {
        let client = client.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                client.cas(&cancel, "ctr", increment).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.get(&cancel, "ctr").await.unwrap(), Some(80));
}

#[tokio::test]
async fn test_contended_write_rereads_and_succeeds() {
    let store = MemoryStore::new();
    for v in 1..=3u64 {
        store.put("ctr", v.to_string()).unwrap();
    }
    assert_eq!(store.get("ctr").await.unwrap().unwrap().revision, 3);
    store.queue_competing_write("ctr", "10").unwrap();

    let client = counter_client(&store, fast_config().with_max_retries(3));
    let mut observed = Vec::new();
    let record = |current: Option<u64>| -> TransformResult<u64> {
        observed.push(current);
        increment(current)
    };
    client.cas(&CancellationToken::new(), "ctr", record).await.unwrap();

    assert_eq!(observed, vec![Some(3), Some(10)]);
    let kv = store.get("ctr").await.unwrap().unwrap();
    assert_eq!(kv.revision, 5);
    assert_eq!(client.get(&CancellationToken::new(), "ctr").await.unwrap(), Some(11));
}

#[tokio::test]
async fn test_every_write_conflicting_exhausts_budget() {
    let store = MemoryStore::new();
    store.set_always_conflict(true).unwrap();
    let client = counter_client(&store, fast_config().with_max_retries(3));

    let err = client.cas(&CancellationToken::new(), "ctr", increment).await.unwrap_err();
    match err {
        KvError::RetriesExhausted { key, attempts } => {
            assert_eq!(key, "ctr");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(store.stats().unwrap().conditional_puts, 3);
}

#[tokio::test]
async fn test_last_store_error_is_returned() {
    let store = MemoryStore::new();
    store.set_always_conflict(true).unwrap();
    store
        .fail_next(StoreOp::ConditionalPut, StoreError::Unavailable("leader lost".to_string()))
        .unwrap();
    let client = counter_client(&store, fast_config().with_max_retries(3));

    let err = client.cas(&CancellationToken::new(), "ctr", increment).await.unwrap_err();
    assert!(matches!(err, KvError::Store(StoreError::Unavailable(ref m)) if m == "leader lost"));
}

#[tokio::test]
async fn test_terminal_transform_error_stops_immediately() {
    let store = MemoryStore::new();
    let client = string_client(&store, fast_config().with_max_retries(10));
    let mut calls = 0;

    let reject = |_: Option<String>| -> TransformResult<String> {
        calls += 1;
        Err(TransformError::abort("schema mismatch"))
    };
    let err = client.cas(&CancellationToken::new(), "cfg", reject).await.unwrap_err();

    assert_eq!(calls, 1);
    assert_eq!(err.to_string(), "transform failed for cfg: schema mismatch");
    assert_eq!(store.stats().unwrap().conditional_puts, 0);
}

#[tokio::test]
async fn test_retryable_transform_error_recovers() {
    let store = MemoryStore::new();
    let client = string_client(&store, fast_config().with_max_retries(5));
    let mut calls = 0;

    let flaky = |_: Option<String>| -> TransformResult<String> {
        calls += 1;
        if calls < 3 {
            return Err(TransformError::retry("dependency not ready"));
        }
        Ok(Some("ready".to_string()))
    };
    client.cas(&CancellationToken::new(), "cfg", flaky).await.unwrap();

    assert_eq!(calls, 3);
    let stored = client.get(&CancellationToken::new(), "cfg").await.unwrap();
    assert_eq!(stored, Some("ready".to_string()));
}

#[tokio::test]
async fn test_cancellation_wins_over_exhaustion() {
    let store = MemoryStore::new();
    store.set_always_conflict(true).unwrap();
    let client = counter_client(&store, fast_config().with_max_retries(3));
    let cancel = CancellationToken::new();

    // Cancel from inside the transform on the last attempt
    let mut calls = 0;
    let cancel_late = {
        let cancel = cancel.clone();
        move |current: Option<u64>| -> TransformResult<u64> {
            calls += 1;
            if calls == 3 {
                cancel.cancel();
            }
            increment(current)
        }
    };

    let err = client.cas(&cancel, "ctr", cancel_late).await.unwrap_err();
    assert!(matches!(err, KvError::Cancelled));
}

#[tokio::test]
async fn test_undecodable_value_is_terminal() {
    let store = MemoryStore::new();
    store.put("ctr", "not a number").unwrap();
    let client = counter_client(&store, fast_config());

    let err = client.cas(&CancellationToken::new(), "ctr", increment).await.unwrap_err();
    assert!(matches!(err, KvError::Codec(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_json_struct_values() {
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Ring {
        tokens: Vec<u32>,
        owner: String,
    }

    let store = MemoryStore::new();
    let client = kvcoord_core::KvClient::new(
        Arc::new(store.clone()),
        JsonCodec::<Ring>::new(),
        fast_config(),
    )
    .unwrap();
    let cancel = CancellationToken::new();

    for token in [7, 3, 11] {
        let add = move |current: Option<Ring>| -> TransformResult<Ring> {
            let mut ring =
                current.unwrap_or(Ring { tokens: Vec::new(), owner: "ingester-1".to_string() });
            ring.tokens.push(token);
            ring.tokens.sort_unstable();
            Ok(Some(ring))
        };
        client.cas(&cancel, "ring", add).await.unwrap();
    }

    let ring = client.get(&cancel, "ring").await.unwrap().unwrap();
    assert_eq!(ring.tokens, vec![3, 7, 11]);
    assert_eq!(ring.owner, "ingester-1");
}

#[tokio::test]
async fn test_read_failures_are_retried() {
    let store = MemoryStore::new();
    for _ in 0..2 {
        store.fail_next(StoreOp::Get, StoreError::Unavailable("timeout".to_string())).unwrap();
    }
    let client = counter_client(&store, fast_config().with_max_retries(3));

    tokio::time::timeout(
        Duration::from_secs(5),
        client.cas(&CancellationToken::new(), "ctr", increment),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.get(&CancellationToken::new(), "ctr").await.unwrap(), Some(1));
}
