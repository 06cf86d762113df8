//! Metrics collection and exposition for Rotor
//!
//! Prometheus-compatible metrics covering message outcomes, per-step
//! latencies, and cache health. The recorder is process-global; the first
//! initialization wins (relevant in tests).

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};

static METRICS_INITIALIZED: OnceLock<Arc<PrometheusHandle>> = OnceLock::new();

/// Initialize the metrics recorder and return the Prometheus handle.
///
/// Safe to call more than once; later calls return the stored handle.
pub fn init_metrics() -> PrometheusHandle {
    if let Some(handle) = METRICS_INITIALIZED.get() {
        return (**handle).clone();
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_metrics();
            let _ = METRICS_INITIALIZED.set(Arc::new(handle.clone()));
            handle
        }
        Err(_) => {
            // A recorder is already installed (another test got there
            // first). Build an unconnected handle for rendering.
            if let Some(handle) = METRICS_INITIALIZED.get() {
                return (**handle).clone();
            }
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            drop(recorder);
            handle
        }
    }
}

fn register_metrics() {
    describe_counter!(
        "rotor_messages_total",
        "Messages processed, labelled by workspace and outcome"
    );
    describe_counter!(
        "rotor_events_delivered_total",
        "Events that reached the end of a chain"
    );
    describe_histogram!(
        "rotor_step_duration_seconds",
        "Per-step execution time, labelled by step id"
    );
    describe_gauge!(
        "rotor_udf_cache_entries",
        "Compiled UDF wrappers currently cached"
    );
}

/// Record the terminal outcome of one message.
pub fn record_message(workspace: &str, status: &'static str) {
    counter!(
        "rotor_messages_total",
        "workspace" => workspace.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record one chain step's execution.
pub fn record_step(step_id: &str, status: &'static str, duration_ms: u64) {
    histogram!(
        "rotor_step_duration_seconds",
        "step" => step_id.to_string(),
        "status" => status
    )
    .record(duration_ms as f64 / 1000.0);
}

/// Count events that completed the chain.
pub fn record_events_delivered(count: usize) {
    counter!("rotor_events_delivered_total").increment(count as u64);
}

/// Publish the compiled-UDF cache size.
pub fn set_udf_cache_entries(count: usize) {
    gauge!("rotor_udf_cache_entries").set(count as f64);
}
