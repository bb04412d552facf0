use tracing::trace;

// Recorded through the `metrics` facade and rendered by the Prometheus
// exporter installed in `main`. Without a recorder these are no-ops.

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("audit_requests_total", "route" => route).increment(1);
    trace!(target = "audit.metrics", route = route, "requests_total_inc");
}

pub fn inc_outcome(outcome: &'static str) {
    ::metrics::counter!("audit_front_door_total", "outcome" => outcome).increment(1);
    trace!(target = "audit.metrics", outcome = outcome, "front_door_outcome");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    ::metrics::histogram!("audit_stage_elapsed_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "audit.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn stage_failed(stage: &'static str) {
    ::metrics::counter!("audit_stage_failures_total", "stage" => stage).increment(1);
}

pub fn gate_in_flight(in_flight: usize) {
    ::metrics::gauge!("audit_gate_in_flight").set(in_flight as f64);
}
