//! HTTP boundary: append events, replay project streams, inspect parked
//! events.

pub mod error;
pub mod routes;

use std::future::IntoFuture as _;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::Result;
use crate::log::EventLog;
use crate::store::{Appender, Reader, StreamNaming};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long in-flight requests may run after shutdown is requested.
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(30);

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub appender: Appender,
    pub reader: Reader,
    log: Arc<dyn EventLog>,
}

impl AppState {
    /// Build the appender and reader over one shared log client.
    pub fn new(log: Arc<dyn EventLog>, naming: StreamNaming) -> Self {
        Self {
            appender: Appender::new(Arc::clone(&log), naming.clone()),
            reader: Reader::new(Arc::clone(&log), naming),
            log,
        }
    }

    pub fn log(&self) -> &dyn EventLog {
        self.log.as_ref()
    }
}

/// Build the router with tracing and timeout layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/event/append", post(routes::append_event))
        .route("/events", get(routes::all_events))
        .route("/events/", get(routes::missing_project_id))
        .route("/events/:project_id", get(routes::project_events))
        .route("/subscriptions/:group/parked", get(routes::parked_events))
        .route(
            "/subscriptions/:group/parked/replay",
            post(routes::replay_parked),
        )
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` fires, then drain in-flight requests for up to
/// [`GRACEFUL_SHUTDOWN`].
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "http server listening");

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return Ok(result?),
        _ = shutdown.cancelled() => {}
    }

    info!("shutdown requested, draining http requests");
    match tokio::time::timeout(GRACEFUL_SHUTDOWN, server).await {
        Ok(result) => result?,
        Err(_) => warn!("graceful shutdown timed out, dropping remaining connections"),
    }
    Ok(())
}
