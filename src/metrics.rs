//! Prometheus metrics for tracemesh
//!
//! Node-side metrics are updated by the tracer runtime's consumption loop;
//! client-side metrics by the orchestrator and the stream aggregator.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Tracer Runtime Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Events handed to the event callback, by gadget and kind.
    ///
    /// Labels:
    /// - gadget: Program name (e.g., "tcpconnect")
    /// - kind: "normal", "warn" or "err"
    pub static ref EVENTS_EMITTED: CounterVec = register_counter_vec!(
        "tracemesh_events_total",
        "Events emitted by tracer runtimes",
        &["gadget", "kind"]
    ).expect("failed to register EVENTS_EMITTED metric");

    /// Samples the kernel dropped before userspace could read them.
    pub static ref LOST_SAMPLES: CounterVec = register_counter_vec!(
        "tracemesh_lost_samples_total",
        "Samples lost in the kernel event channel",
        &["gadget"]
    ).expect("failed to register LOST_SAMPLES metric");

    /// Event channel read failures that ended a consumption loop.
    pub static ref READ_ERRORS: CounterVec = register_counter_vec!(
        "tracemesh_read_errors_total",
        "Fatal event channel read errors",
        &["gadget"]
    ).expect("failed to register READ_ERRORS metric");

    /// Kernel hook attachments currently held by all runtimes.
    pub static ref ACTIVE_ATTACHMENTS: Gauge = register_gauge!(
        "tracemesh_active_attachments",
        "Kernel hook attachments currently held"
    ).expect("failed to register ACTIVE_ATTACHMENTS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Orchestrator Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Trace copies created across all nodes.
    pub static ref TRACE_COPIES_CREATED: Counter = register_counter!(
        "tracemesh_trace_copies_created_total",
        "Per-node trace copies created"
    ).expect("failed to register TRACE_COPIES_CREATED metric");

    /// Creations rolled back after a node rejected its copy.
    pub static ref TRACE_ROLLBACKS: Counter = register_counter!(
        "tracemesh_trace_rollbacks_total",
        "Trace creations rolled back"
    ).expect("failed to register TRACE_ROLLBACKS metric");

    /// Per-node errors observed while waiting for convergence.
    pub static ref NODE_ERRORS: Counter = register_counter!(
        "tracemesh_node_errors_total",
        "Per-node operation errors"
    ).expect("failed to register NODE_ERRORS metric");

    /// Per-node warnings observed while waiting for convergence.
    pub static ref NODE_WARNINGS: Counter = register_counter!(
        "tracemesh_node_warnings_total",
        "Per-node operation warnings"
    ).expect("failed to register NODE_WARNINGS metric");

    /// Time spent waiting for trace copies to converge.
    pub static ref CONVERGENCE_DURATION: Histogram = register_histogram!(
        "tracemesh_convergence_duration_seconds",
        "Time until trace copies reached the expected state",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
    ).expect("failed to register CONVERGENCE_DURATION metric");

    /// Node streams currently attached by the aggregator.
    pub static ref ACTIVE_STREAMS: Gauge = register_gauge!(
        "tracemesh_active_streams",
        "Node output streams currently attached"
    ).expect("failed to register ACTIVE_STREAMS metric");
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        EVENTS_EMITTED.with_label_values(&["metrics-test", "normal"]).inc();
        let text = gather();
        assert!(text.contains("tracemesh_events_total"));
    }
}
