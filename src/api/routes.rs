//! Route handlers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::error::Error;
use crate::event::Envelope;
use crate::log::ParkedEvent;
use crate::store::reader::DEFAULT_PAGE_SIZE;

/// Response header carrying the revision to continue a stream read from.
pub const NEXT_FROM_HEADER: &str = "x-next-from";

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Pagination for stream reads.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub from: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub replayed: usize,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// `POST /event/append`: decode, validate, append.
pub async fn append_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<&'static str> {
    let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| {
        warn!("failed to decode event: {e}");
        ApiError::bad_request("Failed to decode event data")
    })?;

    let Some(kind) = envelope.kind() else {
        warn!(kind = envelope.type_tag(), "unhandled event type");
        return Err(ApiError::bad_request("Event type not handled"));
    };

    match state.appender.append(&envelope).await {
        Ok(_) => Ok(kind.confirmation()),
        Err(Error::InvalidEvent(reason)) => {
            warn!(%reason, "rejected event");
            Err(ApiError::bad_request("Missing projectId"))
        }
        Err(Error::UnhandledEventType(_)) => Err(ApiError::bad_request("Event type not handled")),
        Err(e) => {
            error!(kind = kind.as_str(), "failed to store event: {e}");
            Err(ApiError::internal("Failed to process event"))
        }
    }
}

/// `GET /events/`: the project id segment is empty.
pub async fn missing_project_id() -> ApiError {
    ApiError::bad_request("Missing projectId parameter")
}

/// `GET /events/{projectId}?from=&limit=`
pub async fn project_events(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Response> {
    if project_id.trim().is_empty() {
        return Err(ApiError::bad_request("Missing projectId parameter"));
    }

    let page = state
        .reader
        .read_page(
            &project_id,
            params.from.unwrap_or(0),
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await
        .map_err(|e| {
            error!(%project_id, "failed to read stream: {e}");
            ApiError::internal("Failed to retrieve events")
        })?;

    let mut headers = HeaderMap::new();
    if let Some(next) = page.next_from {
        headers.insert(NEXT_FROM_HEADER, HeaderValue::from(next));
    }
    Ok((headers, Json(page.events)).into_response())
}

/// `GET /events`: best-effort read across all projects. Failures are
/// logged and answered with an empty 200.
pub async fn all_events(State(state): State<Arc<AppState>>) -> Response {
    match state.reader.read_all(DEFAULT_PAGE_SIZE).await {
        Ok(events) if events.is_empty() => (StatusCode::OK, "No events found").into_response(),
        Ok(events) => Json(events).into_response(),
        Err(e) => {
            error!("failed to fetch events: {e}");
            StatusCode::OK.into_response()
        }
    }
}

/// `GET /subscriptions/{group}/parked`
pub async fn parked_events(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> ApiResult<Json<Vec<ParkedEvent>>> {
    state
        .log()
        .parked_events(&group)
        .await
        .map(Json)
        .map_err(|e| subscription_error(&group, e))
}

/// `POST /subscriptions/{group}/parked/replay`
pub async fn replay_parked(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> ApiResult<Json<ReplayResponse>> {
    let replayed = state
        .log()
        .replay_parked(&group)
        .await
        .map_err(|e| subscription_error(&group, e))?;
    Ok(Json(ReplayResponse { replayed }))
}

fn subscription_error(group: &str, e: Error) -> ApiError {
    match e {
        Error::SubscriptionNotFound(_) => ApiError::not_found("Subscription group not found"),
        e => {
            error!(group, "subscription operation failed: {e}");
            ApiError::internal("Failed to access subscription")
        }
    }
}
