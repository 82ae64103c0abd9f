//! Integration tests for telemetry initialization and span helpers.

use activity_rs::log::{NackAction, RecordedEvent};
use activity_rs::telemetry::delivery::{outcome_label, record_outcome, start_delivery_span};
use uuid::Uuid;

fn record() -> RecordedEvent {
    RecordedEvent {
        event_id: Uuid::new_v4(),
        stream: "project-P1".to_string(),
        revision: 0,
        position: 1,
        event_type: "TaskCreated".to_string(),
        content_type: "application/json".to_string(),
        data: b"{}".to_vec(),
        metadata: serde_json::json!({}),
        created_at: chrono::Utc::now(),
    }
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = activity_rs::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "activity-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = activity_rs::telemetry::init_telemetry(config) {
        assert!(!guard.exporting());
        guard.force_flush();
    }
}

#[test]
fn delivery_span_creates_and_records_outcome() {
    let span = start_delivery_span("analytics-group", &record(), 0);
    record_outcome(&span, outcome_label(None));
}

#[test]
fn outcome_labels_match_nack_actions() {
    assert_eq!(outcome_label(None), "ack");
    assert_eq!(outcome_label(Some(NackAction::Retry)), "retry");
    assert_eq!(outcome_label(Some(NackAction::Park)), "park");
    assert_eq!(outcome_label(Some(NackAction::Skip)), "skip");
}

#[test]
fn metrics_record_without_a_meter_provider() {
    use opentelemetry::KeyValue;

    activity_rs::telemetry::metrics::events_appended()
        .add(1, &[KeyValue::new("kind", "TaskCreated")]);
    activity_rs::telemetry::metrics::processing_duration_ms()
        .record(1.5, &[KeyValue::new("group", "analytics-group")]);
}
