//! HTTP facade tests against the in-memory log.

use std::sync::Arc;

use activity_rs::api::routes::NEXT_FROM_HEADER;
use activity_rs::api::{AppState, router};
use activity_rs::log::memory::MemoryLog;
use activity_rs::log::{self, Delivery, EventLog, NackAction, NewRecord};
use activity_rs::store::StreamNaming;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt as _;

fn app(log: &MemoryLog) -> Router {
    router(AppState::new(Arc::new(log.clone()), StreamNaming::default()))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

async fn post_event(app: &Router, body: Value) -> (StatusCode, String) {
    let request = Request::post("/event/append")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _, body) = send(app, request).await;
    (status, String::from_utf8(body).unwrap())
}

async fn get_events(app: &Router, uri: &str) -> (StatusCode, Vec<Value>) {
    let (status, _, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    let events = if status == StatusCode::OK {
        serde_json::from_slice(&body).unwrap()
    } else {
        Vec::new()
    };
    (status, events)
}

fn project_created(project_id: &str) -> Value {
    json!({
        "type": "ProjectCreated",
        "time": "2024-01-01T00:00:00Z",
        "projectId": project_id,
        "event": {"projectId": project_id, "title": "Alpha", "ownerId": "U1"}
    })
}

fn task_created(project_id: &str, task_id: &str) -> Value {
    json!({
        "type": "TaskCreated",
        "time": "2024-01-01T00:00:00Z",
        "projectId": project_id,
        "event": {"taskId": task_id, "projectId": project_id}
    })
}

#[tokio::test]
async fn append_then_read_round_trip() {
    let log = MemoryLog::new();
    let app = app(&log);

    let (status, body) = post_event(&app, project_created("P1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Successfully created project");

    let (status, events) = get_events(&app, "/events/P1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "ProjectCreated");
    assert_eq!(events[0]["projectId"], "P1");
    assert_eq!(events[0]["time"], "2024-01-01T00:00:00Z");
    assert_eq!(events[0]["event"]["title"], "Alpha");
}

#[tokio::test]
async fn unknown_type_is_rejected_and_not_stored() {
    let log = MemoryLog::new();
    let app = app(&log);
    post_event(&app, project_created("P1")).await;

    let (status, body) = post_event(
        &app,
        json!({"type": "Foobar", "projectId": "P1", "event": {"x": 1}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Event type not handled");

    let (_, events) = get_events(&app, "/events/P1").await;
    assert_eq!(events.len(), 1);
    assert_eq!(log.len().await, 1);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let log = MemoryLog::new();
    let app = app(&log);

    let request = Request::post("/event/append")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"Failed to decode event data");

    // Known tag with a body of the wrong shape.
    let (status, body) = post_event(
        &app,
        json!({"type": "TaskCreated", "projectId": "P1", "event": {"taskId": 7}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Failed to decode event data");
    assert!(log.is_empty().await);
}

#[tokio::test]
async fn missing_project_id_on_append_is_rejected() {
    let log = MemoryLog::new();
    let app = app(&log);

    let (status, _) = post_event(
        &app,
        json!({"type": "TaskCreated", "event": {"taskId": "T1", "projectId": "P1"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(log.is_empty().await);
}

#[tokio::test]
async fn missing_project_id_on_read_is_rejected() {
    let log = MemoryLog::new();
    let app = app(&log);

    let (status, _, body) = send(&app, Request::get("/events/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"Missing projectId parameter");
}

#[tokio::test]
async fn streams_are_isolated_per_project() {
    let log = MemoryLog::new();
    let app = app(&log);

    let (status, body) = post_event(&app, task_created("P1", "T1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Successfully created task");
    post_event(&app, task_created("P2", "T2")).await;

    let (_, p1) = get_events(&app, "/events/P1").await;
    let (_, p2) = get_events(&app, "/events/P2").await;
    assert_eq!(p1.len(), 1);
    assert_eq!(p1[0]["event"]["taskId"], "T1");
    assert_eq!(p2.len(), 1);
    assert_eq!(p2[0]["event"]["taskId"], "T2");
}

#[tokio::test]
async fn unknown_project_reads_empty() {
    let log = MemoryLog::new();
    let app = app(&log);

    let (status, events) = get_events(&app, "/events/nobody").await;
    assert_eq!(status, StatusCode::OK);
    assert!(events.is_empty());
}

#[tokio::test]
async fn project_reads_are_paginated() {
    let log = MemoryLog::new();
    let app = app(&log);
    for i in 0..5 {
        post_event(&app, task_created("P1", &format!("T{i}"))).await;
    }

    let request = Request::get("/events/P1?limit=2").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let page: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["event"]["taskId"], "T0");
    assert_eq!(headers[NEXT_FROM_HEADER], "2");

    let request = Request::get("/events/P1?from=4&limit=2")
        .body(Body::empty())
        .unwrap();
    let (_, headers, body) = send(&app, request).await;
    let page: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["event"]["taskId"], "T4");
    assert!(headers.get(NEXT_FROM_HEADER).is_none());
}

#[tokio::test]
async fn read_past_the_end_is_empty() {
    let log = MemoryLog::new();
    let app = app(&log);
    post_event(&app, task_created("P1", "T1")).await;

    for uri in ["/events/P1?from=1", "/events/P1?from=18446744073709551615"] {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        let (status, headers, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        let page: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert!(page.is_empty(), "{uri}");
        assert!(headers.get(NEXT_FROM_HEADER).is_none());
    }
}

#[tokio::test]
async fn default_read_is_capped_at_one_hundred() {
    let log = MemoryLog::new();
    let app = app(&log);
    for i in 0..105 {
        post_event(&app, task_created("P1", &format!("T{i}"))).await;
    }

    let request = Request::get("/events/P1").body(Body::empty()).unwrap();
    let (_, headers, body) = send(&app, request).await;
    let events: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(events.len(), 100);
    assert_eq!(events[99]["event"]["taskId"], "T99");
    assert_eq!(headers[NEXT_FROM_HEADER], "100");
}

#[tokio::test]
async fn all_events_reports_empty_log() {
    let log = MemoryLog::new();
    let app = app(&log);

    let (status, _, body) = send(&app, Request::get("/events").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"No events found");

    post_event(&app, task_created("P1", "T1")).await;
    post_event(&app, task_created("P2", "T2")).await;
    let (status, events) = get_events(&app, "/events").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["projectId"], "P2");
}

#[tokio::test]
async fn all_events_swallows_log_failures() {
    let log = MemoryLog::new();
    let app = app(&log);
    log.close().await;

    let (status, _, body) = send(&app, Request::get("/events").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn append_failure_is_a_server_error() {
    let log = MemoryLog::new();
    let app = app(&log);
    log.close().await;

    let (status, body) = post_event(&app, project_created("P1")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Failed to process event");

    let (status, _, body) =
        send(&app, Request::get("/events/P1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, b"Failed to retrieve events");
}

#[tokio::test]
async fn health_reports_ok() {
    let log = MemoryLog::new();
    let (status, _, body) =
        send(&app(&log), Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn parked_events_can_be_listed_and_replayed() {
    let log = MemoryLog::new();
    let app = app(&log);
    log::ensure_subscription(&log, "analytics-group").await.unwrap();
    let garbage = NewRecord::new("Garbage", "application/octet-stream", b"\x00\x01".to_vec());
    log.append("project-P1", garbage).await.unwrap();

    let mut subscription = log.attach_subscription("analytics-group").await.unwrap();
    let Delivery::Event { record, .. } = subscription.recv().await else {
        panic!("expected an event");
    };
    subscription
        .nack(&record, NackAction::Park, "decode failed")
        .await
        .unwrap();

    let (status, _, body) = send(
        &app,
        Request::get("/subscriptions/analytics-group/parked")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parked: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0]["reason"], "decode failed");
    assert_eq!(parked[0]["record"]["stream"], "project-P1");
    assert_eq!(parked[0]["replaying"], false);

    let (status, _, body) = send(
        &app,
        Request::post("/subscriptions/analytics-group/parked/replay")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let replay: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(replay["replayed"], 1);
}

#[tokio::test]
async fn parked_events_of_unknown_group_is_not_found() {
    let log = MemoryLog::new();
    let (status, _, body) = send(
        &app(&log),
        Request::get("/subscriptions/nope/parked")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, b"Subscription group not found");
}
