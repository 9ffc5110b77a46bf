//! Reconnecting watch subscriptions
//!
//! A watch loop keeps a store watch stream open over a key or prefix and
//! feeds decoded events to a handler:
//!
//! ```text
//!   Idle ──open──▶ Streaming ──batch──▶ Streaming   (backoff reset, events delivered)
//!                     │
//!                  error/end
//!                     ▼
//!                  Backoff ──wait, ongoing──▶ Streaming   (fresh stream, no resume)
//!                     │
//!                 !ongoing ──▶ Stopped ◀── handler returned false
//! ```
//!
//! Delivery is at-most-once across reconnects: changes made while no stream
//! is open are not replayed.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::codec::Codec;
use crate::metrics;
use crate::store::{EventKind, KvStore, StoreEvent, WatchScope};

/// A decoded change notification
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<V> {
    pub key: String,
    /// Decoded value; always `None` for deletes
    pub value: Option<V>,
    pub kind: EventKind,
    /// Store revision of the change
    pub revision: i64,
}

impl<V> WatchEvent<V> {
    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }
}

/// Receives watch events; returning `false` stops the watch
pub trait WatchHandler<V>: Send {
    fn on_event(&mut self, event: WatchEvent<V>) -> bool;
}

impl<V, F> WatchHandler<V> for F
where
    F: FnMut(WatchEvent<V>) -> bool + Send,
{
    fn on_event(&mut self, event: WatchEvent<V>) -> bool {
        self(event)
    }
}

/// Run a watch over `scope` until the handler stops it, `cancel` fires, or
/// the reconnect budget in `config` runs out
pub async fn run_watch<S, C, H>(
    store: &S,
    codec: &C,
    config: &BackoffConfig,
    cancel: &CancellationToken,
    scope: WatchScope,
    mut handler: H,
) where
    S: KvStore + ?Sized,
    C: Codec,
    H: WatchHandler<C::Value>,
{
    // Cancelling the child never touches the caller's token; the guard tears
    // the child down however this function exits.
    let watch_cancel = cancel.child_token();
    let _guard = watch_cancel.clone().drop_guard();
    let mut backoff = Backoff::new(watch_cancel.clone(), config.clone());
    let mut opened_before = false;

    'outer: while backoff.ongoing() {
        if opened_before {
            metrics::watch_reconnect();
        }

        let opened = tokio::select! {
            biased;
            _ = watch_cancel.cancelled() => break 'outer,
            opened = store.watch(scope.clone()) => opened,
        };
        opened_before = true;

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%scope, error = %e, retries = backoff.num_retries(), "Failed to open watch stream");
                backoff.wait().await;
                continue;
            }
        };
        debug!(%scope, "Watch stream open");

        loop {
            let next = tokio::select! {
                biased;
                _ = watch_cancel.cancelled() => break 'outer,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(events)) => {
                    backoff.reset();
                    for event in events {
                        let Some(event) = decode_event(codec, &scope, event) else {
                            continue;
                        };
                        metrics::watch_event("delivered");
                        if !handler.on_event(event) {
                            debug!(%scope, "Watch handler finished");
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(%scope, error = %e, "Watch stream error");
                    break;
                }
                None => {
                    info!(%scope, "Watch stream closed by store");
                    break;
                }
            }
        }

        drop(stream);
        backoff.wait().await;
    }

    debug!(%scope, reason = ?backoff.err(), "Watch loop stopped");
}

fn decode_event<C: Codec>(
    codec: &C,
    scope: &WatchScope,
    event: StoreEvent,
) -> Option<WatchEvent<C::Value>> {
    match event.kind {
        EventKind::Delete => Some(WatchEvent {
            key: event.key,
            value: None,
            kind: EventKind::Delete,
            revision: event.revision,
        }),
        EventKind::Put => match codec.unmarshal(&event.value) {
            Ok(value) => Some(WatchEvent {
                key: event.key,
                value: Some(value),
                kind: EventKind::Put,
                revision: event.revision,
            }),
            Err(e) => {
                warn!(%scope, key = %event.key, error = %e, "Error decoding watched value");
                metrics::watch_event("undecodable");
                None
            }
        },
    }
}
