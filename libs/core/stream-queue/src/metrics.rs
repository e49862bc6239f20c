//! Prometheus metrics for stream queues
//!
//! The recorder is process-wide; `QueueMetrics` only carries the labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the existing handle.
/// Returns `None` if another recorder was already installed by someone else.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    let handle = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    match handle {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Per-stream metrics helper
#[derive(Clone, Debug)]
pub struct QueueMetrics {
    stream_name: String,
    handler_name: String,
}

impl QueueMetrics {
    pub fn new(stream_name: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            handler_name: handler_name.into(),
        }
    }

    /// A message was appended (`kind` is "immediate" or "delayed")
    pub fn published(stream: &str, kind: &'static str) {
        counter!(
            "stream_queue_messages_published_total",
            "stream" => stream.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn processed(&self, duration: Duration) {
        counter!(
            "stream_queue_messages_processed_total",
            "stream" => self.stream_name.clone(),
            "handler" => self.handler_name.clone(),
            "status" => "success"
        )
        .increment(1);

        self.record_duration(duration);
    }

    pub fn failed(&self, duration: Duration) {
        counter!(
            "stream_queue_messages_processed_total",
            "stream" => self.stream_name.clone(),
            "handler" => self.handler_name.clone(),
            "status" => "failed"
        )
        .increment(1);

        self.record_duration(duration);
    }

    pub fn retried(&self) {
        counter!(
            "stream_queue_messages_retried_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self) {
        counter!(
            "stream_queue_messages_dlq_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    pub fn promoted(&self, count: usize) {
        counter!(
            "stream_queue_messages_promoted_total",
            "stream" => self.stream_name.clone()
        )
        .increment(count as u64);
    }

    pub fn reclaimed(&self, count: usize) {
        counter!(
            "stream_queue_messages_reclaimed_total",
            "stream" => self.stream_name.clone()
        )
        .increment(count as u64);
    }

    /// Stream length and pending gauges, refreshed from `get_stats`
    pub fn depth(stream: &str, length: u64, pending: u64) {
        gauge!("stream_queue_stream_length", "stream" => stream.to_string()).set(length as f64);
        gauge!("stream_queue_pending_messages", "stream" => stream.to_string())
            .set(pending as f64);
    }

    fn record_duration(&self, duration: Duration) {
        histogram!(
            "stream_queue_handler_duration_seconds",
            "stream" => self.stream_name.clone(),
            "handler" => self.handler_name.clone()
        )
        .record(duration.as_secs_f64());
    }
}
