//! Prometheus metrics for varasto buffers

use crate::error::{Result, VarastoError};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec,
};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serialises registration so concurrent first calls do not double-register
static INIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// All buffer metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Backlog
    // ─────────────────────────────────────────────────────────────────────────
    /// Encoded bytes waiting in the buffer (by strategy)
    pub backlog_bytes: GaugeVec,

    /// Segment files currently on disk
    pub segments_active: Gauge,

    // ─────────────────────────────────────────────────────────────────────────
    // Message flow
    // ─────────────────────────────────────────────────────────────────────────
    /// Messages accepted into the buffer
    pub messages_pushed: Counter,

    /// Messages removed after successful delivery
    pub messages_shifted: Counter,

    /// Delivery attempts answered with a failure
    pub messages_nacked: Counter,

    /// Messages refused at push time (by reason)
    pub messages_rejected: CounterVec,

    /// Storage failures that stopped the stage
    pub fatal_errors: Counter,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            backlog_bytes: register_gauge_vec!(
                "varasto_backlog_bytes",
                "Encoded bytes pending in the buffer",
                &["strategy"]
            )
            .map_err(|e| VarastoError::Metrics(format!("backlog_bytes: {e}")))?,

            segments_active: register_gauge!(
                "varasto_segments_active",
                "Segment files currently held by the mmap buffer"
            )
            .map_err(|e| VarastoError::Metrics(format!("segments_active: {e}")))?,

            messages_pushed: register_counter!(
                "varasto_messages_pushed_total",
                "Total messages accepted into the buffer"
            )
            .map_err(|e| VarastoError::Metrics(format!("messages_pushed: {e}")))?,

            messages_shifted: register_counter!(
                "varasto_messages_shifted_total",
                "Total messages removed after delivery"
            )
            .map_err(|e| VarastoError::Metrics(format!("messages_shifted: {e}")))?,

            messages_nacked: register_counter!(
                "varasto_messages_nacked_total",
                "Total delivery attempts answered with a failure"
            )
            .map_err(|e| VarastoError::Metrics(format!("messages_nacked: {e}")))?,

            messages_rejected: register_counter_vec!(
                "varasto_messages_rejected_total",
                "Total messages refused at push time",
                &["reason"]
            )
            .map_err(|e| VarastoError::Metrics(format!("messages_rejected: {e}")))?,

            fatal_errors: register_counter!(
                "varasto_fatal_errors_total",
                "Storage failures that stopped the buffer stage"
            )
            .map_err(|e| VarastoError::Metrics(format!("fatal_errors: {e}")))?,
        };

        // Only the first set wins
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| VarastoError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Update the backlog gauge for a strategy
    pub fn set_backlog(&self, strategy: &str, bytes: usize) {
        self.backlog_bytes
            .with_label_values(&[strategy])
            .set(bytes as f64);
    }

    /// Update the segment file count
    pub fn set_segments(&self, count: usize) {
        self.segments_active.set(count as f64);
    }

    /// Record an accepted push
    pub fn record_pushed(&self) {
        self.messages_pushed.inc();
    }

    /// Record a shift
    pub fn record_shifted(&self) {
        self.messages_shifted.inc();
    }

    /// Record a failed delivery
    pub fn record_nacked(&self) {
        self.messages_nacked.inc();
    }

    /// Record a refused push
    pub fn record_rejected(&self, reason: &str) {
        self.messages_rejected.with_label_values(&[reason]).inc();
    }

    /// Record a storage failure
    pub fn record_fatal(&self) {
        self.fatal_errors.inc();
    }
}

/// Gather all metrics and encode as Prometheus text format
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
