//! Metrics for flowrun.
//!
//! Recorded through the `metrics` facade. The library installs no recorder;
//! the CLI installs a Prometheus recorder when asked to print metrics.
//!
//! ## Metrics
//!
//! ### Counters
//! - `flowrun_flow_runs_total` - Flow runs by outcome
//! - `flowrun_node_runs_total` - Node invocations by kind and terminal state
//! - `flowrun_http_requests_total` - Request node calls by method and status
//! - `flowrun_store_retries_total` - Upsert retries on lock contention
//! - `flowrun_stream_items_total` - Items sent on the run stream by kind
//!
//! ### Histograms
//! - `flowrun_node_duration_seconds` - Node invocation duration by kind

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install Prometheus recorder: {}", e)))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

/// Record the outcome of a flow run.
pub fn record_flow_run(outcome: &str) {
    counter!("flowrun_flow_runs_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a node invocation reaching a terminal state.
pub fn record_node_run(kind: &str, state: &str, duration: Duration) {
    counter!(
        "flowrun_node_runs_total",
        "kind" => kind.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
    histogram!("flowrun_node_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record an HTTP request made by a request node.
pub fn record_http_request(method: &str, status_code: u16) {
    counter!(
        "flowrun_http_requests_total",
        "method" => method.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);
}

/// Record one retry of an execution-record upsert.
pub fn record_store_retry() {
    counter!("flowrun_store_retries_total").increment(1);
}

/// Record an item sent on a run stream.
pub fn record_stream_item(kind: &str) {
    counter!("flowrun_stream_items_total", "kind" => kind.to_string()).increment(1);
}
