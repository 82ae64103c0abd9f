//! Metric instrument factories for activity-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created from the `"activity-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("activity-rs")
}

/// Counter: envelopes appended to project streams.
/// Labels: `kind`, `result` ("ok" | "error").
pub fn events_appended() -> Counter<u64> {
    meter()
        .u64_counter("activity.events.appended")
        .with_description("Number of events appended to project streams")
        .build()
}

/// Counter: project stream reads.
/// Labels: `result` ("ok" | "error").
pub fn stream_reads() -> Counter<u64> {
    meter()
        .u64_counter("activity.stream.reads")
        .with_description("Number of project stream reads")
        .build()
}

/// Counter: subscription deliveries by how they were settled.
/// Labels: `group`, `outcome` ("ack" | "retry" | "park" | "skip").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("activity.subscription.deliveries")
        .with_description("Number of subscription deliveries")
        .build()
}

/// Counter: subscription re-attach attempts after a drop.
/// Labels: `group`, `result` ("ok" | "error").
pub fn subscription_reconnects() -> Counter<u64> {
    meter()
        .u64_counter("activity.subscription.reconnects")
        .with_description("Number of subscription re-attach attempts")
        .build()
}

/// Counter: events handled by the activity processor.
/// Labels: `kind`.
pub fn events_processed() -> Counter<u64> {
    meter()
        .u64_counter("activity.events.processed")
        .with_description("Number of events handled by the processor")
        .build()
}

/// Histogram: processor duration in milliseconds.
/// Labels: `group`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("activity.processing.duration_ms")
        .with_description("Processor duration in milliseconds")
        .with_unit("ms")
        .build()
}
