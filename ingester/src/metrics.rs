//! Prometheus metrics for the stream ingester

use crate::error::{Result, StreamError};
use prometheus::{
    CounterVec, Encoder, HistogramVec, IntGauge, IntGaugeVec, TextEncoder, register_counter_vec,
    register_histogram_vec, register_int_gauge, register_int_gauge_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All ingester metrics
pub struct Metrics {
    /// Buffers accepted into a queue set (by message type)
    pub buffers_received: CounterVec,

    /// Buffers refused at dispatch (by message type, reason)
    pub buffers_rejected: CounterVec,

    /// Queued buffers evicted by drop-oldest (by queue, partition)
    pub queue_evicted: CounterVec,

    /// Records decoded (by message type)
    pub records_decoded: CounterVec,

    /// Malformed frames (by message type, partition)
    pub decode_errors: CounterVec,

    /// Platform lookups that found nothing (by message type)
    pub enrichment_misses: CounterVec,

    /// Records dropped by admission control (by message type, partition)
    pub throttle_dropped: CounterVec,

    /// Rows accepted by a writer collaborator (by table)
    pub records_written: CounterVec,

    /// Rows in batches a writer collaborator rejected (by table)
    pub sink_errors: CounterVec,

    /// Per-buffer decode time (by message type)
    pub decode_latency: HistogramVec,

    /// Running decoder workers (by message type)
    pub active_workers: IntGaugeVec,

    /// Receive buffers handed out and not yet released
    pub buffers_outstanding: IntGauge,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    #[allow(clippy::result_large_err)]
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            buffers_received: register_counter_vec!(
                "stream_buffers_received_total",
                "Total receive buffers accepted into a queue set",
                &["msg_type"]
            )
            .map_err(|e| StreamError::Metrics(format!("buffers_received: {e}")))?,

            buffers_rejected: register_counter_vec!(
                "stream_buffers_rejected_total",
                "Total receive buffers refused at dispatch",
                &["msg_type", "reason"]
            )
            .map_err(|e| StreamError::Metrics(format!("buffers_rejected: {e}")))?,

            queue_evicted: register_counter_vec!(
                "stream_queue_evicted_total",
                "Total queued buffers evicted to make room",
                &["queue", "partition"]
            )
            .map_err(|e| StreamError::Metrics(format!("queue_evicted: {e}")))?,

            records_decoded: register_counter_vec!(
                "stream_records_decoded_total",
                "Total records decoded",
                &["msg_type"]
            )
            .map_err(|e| StreamError::Metrics(format!("records_decoded: {e}")))?,

            decode_errors: register_counter_vec!(
                "stream_decode_errors_total",
                "Total malformed frames",
                &["msg_type", "partition"]
            )
            .map_err(|e| StreamError::Metrics(format!("decode_errors: {e}")))?,

            enrichment_misses: register_counter_vec!(
                "stream_enrichment_misses_total",
                "Total platform lookups without a match",
                &["msg_type"]
            )
            .map_err(|e| StreamError::Metrics(format!("enrichment_misses: {e}")))?,

            throttle_dropped: register_counter_vec!(
                "stream_throttle_dropped_total",
                "Total records dropped by admission control",
                &["msg_type", "partition"]
            )
            .map_err(|e| StreamError::Metrics(format!("throttle_dropped: {e}")))?,

            records_written: register_counter_vec!(
                "stream_records_written_total",
                "Total rows accepted by a writer",
                &["table"]
            )
            .map_err(|e| StreamError::Metrics(format!("records_written: {e}")))?,

            sink_errors: register_counter_vec!(
                "stream_sink_errors_total",
                "Total rows in batches a writer rejected",
                &["table"]
            )
            .map_err(|e| StreamError::Metrics(format!("sink_errors: {e}")))?,

            decode_latency: register_histogram_vec!(
                "stream_decode_latency_seconds",
                "Time to decode one receive buffer",
                &["msg_type"],
                vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]
            )
            .map_err(|e| StreamError::Metrics(format!("decode_latency: {e}")))?,

            active_workers: register_int_gauge_vec!(
                "stream_active_workers",
                "Number of running decoder workers",
                &["msg_type"]
            )
            .map_err(|e| StreamError::Metrics(format!("active_workers: {e}")))?,

            buffers_outstanding: register_int_gauge!(
                "stream_buffers_outstanding",
                "Receive buffers handed out and not yet released"
            )
            .map_err(|e| StreamError::Metrics(format!("buffers_outstanding: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| StreamError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record buffers accepted into a queue set
    pub fn record_received(&self, msg_type: &str, count: u64) {
        self.buffers_received
            .with_label_values(&[msg_type])
            .inc_by(count as f64);
    }

    /// Record buffers refused at dispatch
    pub fn record_rejected(&self, msg_type: &str, reason: &str, count: u64) {
        self.buffers_rejected
            .with_label_values(&[msg_type, reason])
            .inc_by(count as f64);
    }

    /// Record decoded records
    pub fn record_decoded(&self, msg_type: &str, count: u64) {
        self.records_decoded
            .with_label_values(&[msg_type])
            .inc_by(count as f64);
    }

    /// Record a malformed frame
    pub fn record_decode_error(&self, msg_type: &str, partition: usize) {
        self.decode_errors
            .with_label_values(&[msg_type, &partition.to_string()])
            .inc();
    }

    /// Record decode latency of one buffer
    pub fn record_decode_latency(&self, msg_type: &str, seconds: f64) {
        self.decode_latency
            .with_label_values(&[msg_type])
            .observe(seconds);
    }

    /// Set the number of running workers for a message type
    pub fn set_active_workers(&self, msg_type: &str, workers: usize) {
        self.active_workers
            .with_label_values(&[msg_type])
            .set(workers as i64);
    }

    /// Update outstanding receive buffers
    pub fn set_buffers_outstanding(&self, outstanding: u64) {
        self.buffers_outstanding.set(outstanding as i64);
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_received(msg_type: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_received(msg_type, count);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_rejected(msg_type: &str, reason: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_rejected(msg_type, reason, count);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_queue_evicted(queue: &str, partition: usize, count: u64) {
    if let Some(m) = Metrics::get() {
        m.queue_evicted
            .with_label_values(&[queue, &partition.to_string()])
            .inc_by(count as f64);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_decoded(msg_type: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_decoded(msg_type, count);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_decode_error(msg_type: &str, partition: usize) {
    if let Some(m) = Metrics::get() {
        m.record_decode_error(msg_type, partition);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_decode_latency(msg_type: &str, seconds: f64) {
    if let Some(m) = Metrics::get() {
        m.record_decode_latency(msg_type, seconds);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_enrichment_miss(msg_type: &str) {
    if let Some(m) = Metrics::get() {
        m.enrichment_misses.with_label_values(&[msg_type]).inc();
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_throttled(msg_type: &str, partition: usize, count: u64) {
    if let Some(m) = Metrics::get() {
        m.throttle_dropped
            .with_label_values(&[msg_type, &partition.to_string()])
            .inc_by(count as f64);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_written(table: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.records_written
            .with_label_values(&[table])
            .inc_by(count as f64);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_sink_error(table: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.sink_errors
            .with_label_values(&[table])
            .inc_by(count as f64);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_set_active_workers(msg_type: &str, workers: usize) {
    if let Some(m) = Metrics::get() {
        m.set_active_workers(msg_type, workers);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_set_buffers_outstanding(outstanding: u64) {
    if let Some(m) = Metrics::get() {
        m.set_buffers_outstanding(outstanding);
    }
}
