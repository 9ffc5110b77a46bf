/*
    Metrics - CAS and watch counters

    Recorded through the `metrics` facade; whichever recorder the host
    application installs (Prometheus, statsd, none) receives them.
*/

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "kvcoord_cas_attempts_total",
        "Total number of CAS attempts, labeled by client variant (base, lease)"
    );

    describe_counter!(
        "kvcoord_cas_results_total",
        "Total number of finished CAS calls, labeled by result (committed, unchanged, noop, exhausted, aborted, failed, cancelled)"
    );

    describe_counter!(
        "kvcoord_cas_conflicts_total",
        "Total number of conditional puts that lost to a concurrent writer"
    );

    describe_histogram!(
        "kvcoord_cas_duration_seconds",
        "Duration of CAS calls from first read to result"
    );

    describe_counter!(
        "kvcoord_lease_operations_total",
        "Total number of lease operations, labeled by op (grant, renew) and result (ok, not_found, error)"
    );

    describe_counter!(
        "kvcoord_watch_reconnects_total",
        "Total number of watch streams re-opened after an error"
    );

    describe_counter!(
        "kvcoord_watch_events_total",
        "Total number of watch events, labeled by outcome (delivered, undecodable)"
    );
}

/// Record a CAS attempt
pub fn cas_attempt(variant: &'static str) {
    counter!("kvcoord_cas_attempts_total", "variant" => variant).increment(1);
}

/// Record the outcome of a CAS call
pub fn cas_result(result: &'static str, duration_secs: f64) {
    counter!("kvcoord_cas_results_total", "result" => result).increment(1);
    histogram!("kvcoord_cas_duration_seconds").record(duration_secs);
}

/// Record a lost conditional put
pub fn cas_conflict() {
    counter!("kvcoord_cas_conflicts_total").increment(1);
}

/// Record a lease grant or renewal
pub fn lease_operation(op: &'static str, result: &'static str) {
    counter!("kvcoord_lease_operations_total", "op" => op, "result" => result).increment(1);
}

/// Record a watch reconnect
pub fn watch_reconnect() {
    counter!("kvcoord_watch_reconnects_total").increment(1);
}

/// Record a watch event
pub fn watch_event(outcome: &'static str) {
    counter!("kvcoord_watch_events_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_compilation() {
        // Without a recorder installed these are no-ops
        init_metrics();
        cas_attempt("base");
        cas_result("committed", 0.01);
        cas_conflict();
        lease_operation("renew", "not_found");
        watch_reconnect();
        watch_event("delivered");
    }
}
