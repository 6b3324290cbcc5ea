//! Prometheus metrics helpers for feedspool.
//!
//! # Usage
//!
//! ```rust,ignore
//! use feedspool_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("spool_flush_success_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`spool_`, `buffer_`, `router_`, `retention_`)
//! - Suffix: unit or type (`_total`, `_files`, `_events`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Serve `/metrics` on the given port from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded by the pipeline.
fn register_common_metrics() {
    // =========================================================================
    // Spool writer / flush orchestration
    // =========================================================================

    describe_counter!("spool_events_written_total", "Events appended to spool files");
    describe_counter!("spool_files_committed_total", "Spool files closed for flushing");
    describe_counter!(
        "spool_delete_failures_total",
        "Flushed spool files that could not be deleted"
    );
    describe_counter!(
        "spool_flush_success_total",
        "Spool files processed successfully by every processor"
    );
    describe_counter!(
        "spool_flush_failure_total",
        "Spool flush attempts where at least one processor failed"
    );
    describe_counter!(
        "spool_processor_failures_total",
        "Individual processor failures (label: processor)"
    );
    describe_counter!(
        "spool_abandoned_files_total",
        "Files processed by the abandoned-file recovery sweep"
    );
    describe_gauge!("spool_local_files", "Closed spool files waiting to be flushed");

    // =========================================================================
    // Feed event routing and insertion
    // =========================================================================

    describe_counter!("router_feed_events_total", "Feed events produced by fan-out");
    describe_counter!("router_decode_errors_total", "Raw events that failed to decode");
    describe_counter!("buffer_events_inserted_total", "Feed events persisted in batches");
    describe_counter!(
        "buffer_insert_failures_total",
        "Feed events lost because a batch insert failed"
    );
    describe_counter!(
        "buffer_events_dropped_total",
        "Feed events dropped because the buffer was closed"
    );
    describe_gauge!("buffer_events", "Feed events waiting in the insertion buffer");

    // =========================================================================
    // Retention
    // =========================================================================

    describe_counter!("retention_events_removed_total", "Feed events purged by retention");
}

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
