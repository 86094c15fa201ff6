//! Prometheus metrics for the work consumer.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Metrics of one service's work consumer.
#[derive(Clone)]
pub struct WorkMetrics {
    service: String,
    stream: String,
}

impl WorkMetrics {
    pub fn new(service: &str, stream: &str) -> Self {
        Self {
            service: service.to_string(),
            stream: stream.to_string(),
        }
    }

    /// Record a message pulled from the stream.
    pub fn message_received(&self) {
        counter!(
            "work_consumer_messages_received_total",
            "service" => self.service.clone(),
            "stream" => self.stream.clone()
        )
        .increment(1);
    }

    /// Record a successfully processed message.
    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "work_consumer_messages_processed_total",
            "service" => self.service.clone(),
            "stream" => self.stream.clone()
        )
        .increment(1);

        histogram!(
            "work_consumer_duration_seconds",
            "service" => self.service.clone(),
            "stream" => self.stream.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed message.
    pub fn message_failed(&self, category: &str) {
        counter!(
            "work_consumer_messages_failed_total",
            "service" => self.service.clone(),
            "stream" => self.stream.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn redelivery_requested(&self) {
        counter!(
            "work_consumer_redelivery_requested_total",
            "service" => self.service.clone(),
            "stream" => self.stream.clone()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self, reason: &str) {
        counter!(
            "work_consumer_dead_lettered_total",
            "service" => self.service.clone(),
            "stream" => self.stream.clone(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Update the consumer's pending gauge.
    pub fn pending(&self, pending: u64) {
        gauge!(
            "work_consumer_pending",
            "service" => self.service.clone(),
            "stream" => self.stream.clone()
        )
        .set(pending as f64);
    }
}

/// Install the Prometheus recorder. Call once per process.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
