//! Error types for activity-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("event type not handled: {0}")]
    UnhandledEventType(String),

    /// Returned by a processor that gives up on an event; the event is parked.
    #[error("poison event: {0}")]
    Poison(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("persistent subscription group already exists: {0}")]
    SubscriptionExists(String),

    #[error("persistent subscription group not found: {0}")]
    SubscriptionNotFound(String),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),

    #[error("event log unavailable: {0}")]
    Unavailable(String),

    #[error("event log is closed")]
    Closed,

    #[error("unsupported event log url scheme: {0}")]
    UnsupportedLog(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
