//! Prometheus metrics collection for roomlink.
//!
//! Metrics live in `OnceLock`s and are registered by [`init`]. Recording
//! helpers are no-ops until then, so library users and unit tests that never
//! call `init()` pay nothing.
//!
//! - `roomlink_connections_active` - connections currently admitted
//! - `roomlink_admission_rejected_total{reason}` - refused connections
//! - `roomlink_fallback_notifications_total{result}` - offline notification path
//! - `roomlink_room_fanout` - recipients per room broadcast

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Admission
// ========================================================================

/// Currently admitted connections (process-local).
pub static CONNECTIONS_ACTIVE: OnceLock<IntGauge> = OnceLock::new();

/// Connections refused by admission control, by reason.
pub static ADMISSION_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();

/// Room joins refused by the connection tracker, by reason.
pub static ROOM_JOIN_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Delivery
// ========================================================================

/// Frames handed to live connections.
pub static FRAMES_DELIVERED: OnceLock<IntCounter> = OnceLock::new();

/// Failed writes to live connections, by reason.
pub static DELIVERY_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();

/// Notification fallbacks, by result (published / failed).
pub static FALLBACK_NOTIFICATIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Recipients per room broadcast.
pub static ROOM_FANOUT: OnceLock<Histogram> = OnceLock::new();

// ========================================================================
// Event bus
// ========================================================================

/// Bus publishes by backend and result.
pub static BUS_PUBLISHED: OnceLock<IntCounterVec> = OnceLock::new();

/// Handler invocations that returned an error or panicked, by backend.
pub static BUS_HANDLER_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Call once at startup before serving `/metrics`.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(CONNECTIONS_ACTIVE, IntGauge::new("roomlink_connections_active", "Connections currently admitted"));
    register!(ADMISSION_REJECTED, IntCounterVec::new(Opts::new("roomlink_admission_rejected_total", "Connections refused by admission control"), &["reason"]));
    register!(ROOM_JOIN_REJECTED, IntCounterVec::new(Opts::new("roomlink_room_join_rejected_total", "Room joins refused by the connection tracker"), &["reason"]));
    register!(FRAMES_DELIVERED, IntCounter::new("roomlink_frames_delivered_total", "Frames handed to live connections"));
    register!(DELIVERY_FAILURES, IntCounterVec::new(Opts::new("roomlink_delivery_failures_total", "Failed writes to live connections"), &["reason"]));
    register!(FALLBACK_NOTIFICATIONS, IntCounterVec::new(Opts::new("roomlink_fallback_notifications_total", "Offline notification fallbacks"), &["result"]));
    register!(ROOM_FANOUT, Histogram::with_opts(
        HistogramOpts::new("roomlink_room_fanout", "Recipients per room broadcast")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0])));
    register!(BUS_PUBLISHED, IntCounterVec::new(Opts::new("roomlink_bus_published_total", "Event bus publishes"), &["backend", "result"]));
    register!(BUS_HANDLER_FAILURES, IntCounterVec::new(Opts::new("roomlink_bus_handler_failures_total", "Event bus handler failures"), &["backend"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
        String::new()
    })
}

// ============================================================================
// Recording helpers
// ============================================================================

pub fn connection_opened() {
    if let Some(g) = CONNECTIONS_ACTIVE.get() {
        g.inc();
    }
}

pub fn connection_closed() {
    if let Some(g) = CONNECTIONS_ACTIVE.get() {
        g.dec();
    }
}

pub fn record_admission_rejected(reason: &str) {
    if let Some(c) = ADMISSION_REJECTED.get() {
        c.with_label_values(&[reason]).inc();
    }
}

pub fn record_room_join_rejected(reason: &str) {
    if let Some(c) = ROOM_JOIN_REJECTED.get() {
        c.with_label_values(&[reason]).inc();
    }
}

pub fn record_delivered() {
    if let Some(c) = FRAMES_DELIVERED.get() {
        c.inc();
    }
}

pub fn record_delivery_failure(reason: &str) {
    if let Some(c) = DELIVERY_FAILURES.get() {
        c.with_label_values(&[reason]).inc();
    }
}

pub fn record_fallback(published: bool) {
    if let Some(c) = FALLBACK_NOTIFICATIONS.get() {
        let result = if published { "published" } else { "failed" };
        c.with_label_values(&[result]).inc();
    }
}

pub fn record_fanout(recipients: usize) {
    if let Some(h) = ROOM_FANOUT.get() {
        h.observe(recipients as f64);
    }
}

pub fn record_bus_publish(backend: &str, ok: bool) {
    if let Some(c) = BUS_PUBLISHED.get() {
        let result = if ok { "ok" } else { "error" };
        c.with_label_values(&[backend, result]).inc();
    }
}

pub fn record_handler_failure(backend: &str) {
    if let Some(c) = BUS_HANDLER_FAILURES.get() {
        c.with_label_values(&[backend]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_are_safe_before_and_after_init() {
        record_fallback(false);
        init();
        init();
        record_fallback(true);
        record_admission_rejected("over_capacity");
        let text = gather_metrics();
        assert!(text.contains("roomlink_fallback_notifications_total"));
        assert!(text.contains("roomlink_admission_rejected_total"));
    }
}
