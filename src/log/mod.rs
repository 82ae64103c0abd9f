//! Append-only event log.
//!
//! The log stores records in named streams, each totally ordered by
//! revision, and in one global order by position. Persistent subscriptions
//! are durable named cursors over every stream; a cursor only advances when
//! the consumer settles a delivery (ack, park, or skip).
//!
//! Two backends implement [`EventLog`]: [`postgres::PgLog`] for deployments
//! and [`memory::MemoryLog`] for tests and single-process runs. Use
//! [`connect`] to pick one from a connection string.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Content type recorded for JSON-encoded envelopes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A record to append. The event id must be fresh for every append.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub metadata: serde_json::Value,
}

impl NewRecord {
    /// A record with a freshly generated random id.
    pub fn new(
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            content_type: content_type.into(),
            data,
            metadata: serde_json::json!({}),
        }
    }

    /// A JSON record with a freshly generated random id.
    pub fn json(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(event_type, JSON_CONTENT_TYPE, data)
    }
}

/// A record as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub stream: String,
    /// Zero-based index within the stream.
    pub revision: u64,
    /// One-based global commit position.
    pub position: u64,
    pub event_type: String,
    pub content_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub position: u64,
    pub revision: u64,
}

/// What a subscription handle yields.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A record to process. `retry_count` is how many times it has been
    /// nacked for retry on this handle.
    Event {
        record: RecordedEvent,
        retry_count: u32,
    },
    /// The handle is no longer usable and must be re-attached.
    Dropped { reason: String },
}

/// Negative acknowledgement actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Redeliver the record.
    Retry,
    /// Set the record aside for inspection and advance past it.
    Park,
    /// Advance past the record without keeping it.
    Skip,
}

impl NackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NackAction::Retry => "retry",
            NackAction::Park => "park",
            NackAction::Skip => "skip",
        }
    }
}

/// A record a subscription group set aside.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkedEvent {
    pub group: String,
    pub record: RecordedEvent,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
    /// Replay requested and not yet settled.
    pub replaying: bool,
}

/// Records read from a stream, in order. The end of the stream is the end
/// of the iteration.
pub type RecordStream<'a> = BoxStream<'a, Result<RecordedEvent>>;

/// The append-only log shared by the appender, reader, and consumer.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one record to `stream`, creating the stream if needed. No
    /// expected-version check: concurrent appends are serialized by the log.
    async fn append(&self, stream: &str, record: NewRecord) -> Result<AppendResult>;

    /// Read up to `max_count` records of `stream` starting at revision
    /// `from`. A stream that does not exist reads as empty.
    fn read_stream<'a>(&'a self, stream: &'a str, from: u64, max_count: u64) -> RecordStream<'a>;

    /// Read up to `max_count` records across all streams, in global order,
    /// starting after position `after`.
    fn read_all(&self, after: u64, max_count: u64) -> RecordStream<'_>;

    /// Create a persistent subscription group over all streams, starting at
    /// the beginning of the log. Fails with [`Error::SubscriptionExists`] if
    /// the group is already present.
    async fn create_subscription(&self, group: &str) -> Result<()>;

    /// Attach to an existing subscription group.
    async fn attach_subscription(&self, group: &str) -> Result<Box<dyn Subscription>>;

    /// Last settled position of a group (0 before anything was settled).
    async fn subscription_position(&self, group: &str) -> Result<u64>;

    /// Records the group has parked, in log order.
    async fn parked_events(&self, group: &str) -> Result<Vec<ParkedEvent>>;

    /// Queue every parked record of the group for redelivery. Returns how
    /// many were queued.
    async fn replay_parked(&self, group: &str) -> Result<usize>;

    /// Release connections. Safe to call more than once.
    async fn close(&self);
}

/// An attached persistent subscription, owned by one consumer.
///
/// One delivery is in flight at a time: settle it with [`ack`](Self::ack)
/// or [`nack`](Self::nack) before the next [`recv`](Self::recv). An
/// unsettled delivery is yielded again.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    async fn recv(&mut self) -> Delivery;

    /// Mark the record processed; the cursor advances past it.
    async fn ack(&mut self, record: &RecordedEvent) -> Result<()>;

    async fn nack(&mut self, record: &RecordedEvent, action: NackAction, reason: &str)
    -> Result<()>;
}

/// Open a log from a connection string.
///
/// `postgres://` and `postgresql://` connect to Postgres and run pending
/// migrations. `memory://` opens an empty in-process log.
pub async fn connect(url: &str) -> Result<Arc<dyn EventLog>> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("");
    match scheme {
        "postgres" | "postgresql" => {
            let log = postgres::PgLog::connect(url).await?;
            log.migrate().await?;
            info!("connected to postgres event log");
            Ok(Arc::new(log))
        }
        "memory" => {
            info!("using in-process event log");
            Ok(Arc::new(memory::MemoryLog::new()))
        }
        other => Err(Error::UnsupportedLog(other.to_string())),
    }
}

/// Create the subscription group if it is missing. An "already exists"
/// answer from the log counts as success.
pub async fn ensure_subscription(log: &dyn EventLog, group: &str) -> Result<()> {
    match log.create_subscription(group).await {
        Ok(()) => {
            info!(group, "created persistent subscription");
            Ok(())
        }
        Err(Error::SubscriptionExists(_)) => {
            info!(group, "persistent subscription already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
