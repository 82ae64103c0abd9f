//! Subscription delivery span helpers.

use tracing::Span;

use crate::log::{NackAction, RecordedEvent};

/// Start a span covering one delivery, from decode through settlement.
///
/// The `delivery.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_delivery_span(group: &str, record: &RecordedEvent, retry_count: u32) -> Span {
    tracing::info_span!(
        "delivery.process",
        "subscription.group" = group,
        "event.id" = %record.event_id,
        "event.type" = %record.event_type,
        "event.stream" = %record.stream,
        "event.position" = record.position,
        "delivery.retry_count" = retry_count,
        "delivery.outcome" = tracing::field::Empty,
    )
}

/// The settlement label used on spans and metrics.
pub fn outcome_label(action: Option<NackAction>) -> &'static str {
    action.map_or("ack", |a| a.as_str())
}

/// Record how a delivery was settled on its span.
pub fn record_outcome(span: &Span, outcome: &'static str) {
    span.record("delivery.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "delivery settled");
    });
}
