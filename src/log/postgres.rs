//! Postgres-backed event log via direct SQLx.
//!
//! Records live in `log_events`; `position` is the global commit order and
//! `stream_revision` the order within a stream. Appends hold a
//! transaction-scoped advisory lock so positions are assigned in commit
//! order, and announce themselves with `NOTIFY event_appended`.
//! Subscription cursors live in `subscription_groups`, parked records in
//! `parked_events`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt as _, TryStreamExt as _};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tracing::debug;
use uuid::Uuid;

use super::{
    AppendResult, Delivery, EventLog, NackAction, NewRecord, ParkedEvent, RecordStream,
    RecordedEvent, Subscription,
};
use crate::error::{Error, Result};

/// Channel used to wake attached subscriptions after an append.
const NOTIFY_CHANNEL: &str = "event_appended";

/// Advisory lock key serializing appends ("actlog" in ASCII).
const APPEND_LOCK_KEY: i64 = 0x6163_746c_6f67;

/// Records fetched per subscription round trip.
const FETCH_BATCH: i64 = 64;

const RECORD_COLUMNS: &str = "position, event_id, stream, stream_revision, event_type, \
                              content_type, data, metadata, created_at";

#[derive(sqlx::FromRow)]
struct RecordRow {
    position: i64,
    event_id: Uuid,
    stream: String,
    stream_revision: i64,
    event_type: String,
    content_type: String,
    data: Vec<u8>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for RecordedEvent {
    fn from(row: RecordRow) -> Self {
        Self {
            event_id: row.event_id,
            stream: row.stream,
            revision: row.stream_revision as u64,
            position: row.position as u64,
            event_type: row.event_type,
            content_type: row.content_type,
            data: row.data,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ParkedRow {
    #[sqlx(flatten)]
    record: RecordRow,
    reason: String,
    parked_at: DateTime<Utc>,
    state: String,
}

/// Saturate at `i64::MAX` instead of wrapping into negative values.
fn to_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Postgres [`EventLog`]. Owns the connection pool.
pub struct PgLog {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgLog {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            poll_interval: Duration::from_secs(5),
        })
    }

    /// Fallback poll interval for subscriptions when no NOTIFY arrives.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn group_position(&self, group: &str) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT position FROM subscription_groups WHERE name = $1")
                .bind(group)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(position,)| position)
            .ok_or_else(|| Error::SubscriptionNotFound(group.to_string()))
    }
}

#[async_trait]
impl EventLog for PgLog {
    async fn append(&self, stream: &str, record: NewRecord) -> Result<AppendResult> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let (position, revision): (i64, i64) = sqlx::query_as(
            "INSERT INTO log_events (event_id, stream, stream_revision, event_type, content_type, data, metadata)
             VALUES ($1, $2,
                     (SELECT COALESCE(MAX(stream_revision) + 1, 0) FROM log_events WHERE stream = $2),
                     $3, $4, $5, $6)
             RETURNING position, stream_revision",
        )
        .bind(record.event_id)
        .bind(stream)
        .bind(&record.event_type)
        .bind(&record.content_type)
        .bind(&record.data)
        .bind(&record.metadata)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(stream)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(stream, position, revision, "appended record");
        Ok(AppendResult {
            position: position as u64,
            revision: revision as u64,
        })
    }

    fn read_stream<'a>(&'a self, stream: &'a str, from: u64, max_count: u64) -> RecordStream<'a> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM log_events
             WHERE stream = $1 AND stream_revision >= $2
             ORDER BY stream_revision
             LIMIT $3"
        );
        futures::stream::once(async move {
            let rows: Vec<RecordRow> = sqlx::query_as(&sql)
                .bind(stream)
                .bind(to_bigint(from))
                .bind(to_bigint(max_count))
                .fetch_all(&self.pool)
                .await?;
            Ok::<_, Error>(futures::stream::iter(
                rows.into_iter().map(|row| Ok(RecordedEvent::from(row))),
            ))
        })
        .try_flatten()
        .boxed()
    }

    fn read_all(&self, after: u64, max_count: u64) -> RecordStream<'_> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM log_events
             WHERE position > $1
             ORDER BY position
             LIMIT $2"
        );
        futures::stream::once(async move {
            let rows: Vec<RecordRow> = sqlx::query_as(&sql)
                .bind(to_bigint(after))
                .bind(to_bigint(max_count))
                .fetch_all(&self.pool)
                .await?;
            Ok::<_, Error>(futures::stream::iter(
                rows.into_iter().map(|row| Ok(RecordedEvent::from(row))),
            ))
        })
        .try_flatten()
        .boxed()
    }

    async fn create_subscription(&self, group: &str) -> Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO subscription_groups (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
        )
        .bind(group)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(Error::SubscriptionExists(group.to_string()));
        }
        Ok(())
    }

    async fn attach_subscription(&self, group: &str) -> Result<Box<dyn Subscription>> {
        let position = self.group_position(group).await?;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        Ok(Box::new(PgSubscription {
            pool: self.pool.clone(),
            listener,
            group: group.to_string(),
            position,
            buffer: VecDeque::new(),
            pending_retry: None,
            poll_interval: self.poll_interval,
        }))
    }

    async fn subscription_position(&self, group: &str) -> Result<u64> {
        Ok(self.group_position(group).await? as u64)
    }

    async fn parked_events(&self, group: &str) -> Result<Vec<ParkedEvent>> {
        self.group_position(group).await?;
        let rows: Vec<ParkedRow> = sqlx::query_as(
            "SELECT e.position, e.event_id, e.stream, e.stream_revision, e.event_type,
                    e.content_type, e.data, e.metadata, e.created_at,
                    p.reason, p.parked_at, p.state
             FROM parked_events p
             JOIN log_events e ON e.position = p.position
             WHERE p.group_name = $1
             ORDER BY p.position",
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ParkedEvent {
                group: group.to_string(),
                record: row.record.into(),
                reason: row.reason,
                parked_at: row.parked_at,
                replaying: row.state == "replaying",
            })
            .collect())
    }

    async fn replay_parked(&self, group: &str) -> Result<usize> {
        self.group_position(group).await?;
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE parked_events SET state = 'replaying' WHERE group_name = $1 AND state = 'parked'",
        )
        .bind(group)
        .execute(&mut *tx)
        .await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(group)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(updated.rows_affected() as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// An attached subscription: a local cursor, a prefetch buffer, and a
/// LISTEN connection for wakeups.
struct PgSubscription {
    pool: PgPool,
    listener: PgListener,
    group: String,
    /// Last settled position.
    position: i64,
    /// Prefetched records after `position`, in order. Popped on settle so a
    /// cancelled `recv` loses nothing.
    buffer: VecDeque<RecordedEvent>,
    pending_retry: Option<(RecordedEvent, u32)>,
    poll_interval: Duration,
}

impl PgSubscription {
    async fn next_ready(&mut self) -> Result<Option<(RecordedEvent, u32)>> {
        if let Some((record, retry_count)) = &self.pending_retry {
            return Ok(Some((record.clone(), *retry_count)));
        }

        let replay: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM log_events
             WHERE position = (SELECT MIN(position) FROM parked_events
                               WHERE group_name = $1 AND state = 'replaying')"
        ))
        .bind(&self.group)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = replay {
            return Ok(Some((row.into(), 0)));
        }

        if self.buffer.is_empty() {
            let rows: Vec<RecordRow> = sqlx::query_as(&format!(
                "SELECT {RECORD_COLUMNS} FROM log_events
                 WHERE position > $1
                 ORDER BY position
                 LIMIT $2"
            ))
            .bind(self.position)
            .bind(FETCH_BATCH)
            .fetch_all(&self.pool)
            .await?;
            self.buffer.extend(rows.into_iter().map(RecordedEvent::from));
        }
        Ok(self.buffer.front().map(|record| (record.clone(), 0)))
    }

    async fn settle(&mut self, record: &RecordedEvent) -> Result<()> {
        if self
            .pending_retry
            .as_ref()
            .is_some_and(|(r, _)| r.event_id == record.event_id)
        {
            self.pending_retry = None;
        }

        sqlx::query(
            "DELETE FROM parked_events WHERE group_name = $1 AND position = $2 AND state = 'replaying'",
        )
        .bind(&self.group)
        .bind(record.position as i64)
        .execute(&self.pool)
        .await?;

        let position = record.position as i64;
        if position > self.position {
            sqlx::query(
                "UPDATE subscription_groups
                 SET position = GREATEST(position, $2), updated_at = now()
                 WHERE name = $1",
            )
            .bind(&self.group)
            .bind(position)
            .execute(&self.pool)
            .await?;
            self.position = position;
            while self
                .buffer
                .front()
                .is_some_and(|r| r.position as i64 <= position)
            {
                self.buffer.pop_front();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn recv(&mut self) -> Delivery {
        loop {
            match self.next_ready().await {
                Ok(Some((record, retry_count))) => {
                    return Delivery::Event {
                        record,
                        retry_count,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    return Delivery::Dropped {
                        reason: e.to_string(),
                    };
                }
            }

            // Wait for: notification or poll timeout
            tokio::select! {
                notif = self.listener.recv() => {
                    if let Err(e) = notif {
                        return Delivery::Dropped { reason: format!("listener error: {e}") };
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&mut self, record: &RecordedEvent) -> Result<()> {
        self.settle(record).await
    }

    async fn nack(
        &mut self,
        record: &RecordedEvent,
        action: NackAction,
        reason: &str,
    ) -> Result<()> {
        match action {
            NackAction::Retry => {
                let retry_count = match &self.pending_retry {
                    Some((pending, count)) if pending.event_id == record.event_id => count + 1,
                    _ => 1,
                };
                self.pending_retry = Some((record.clone(), retry_count));
                Ok(())
            }
            NackAction::Park => {
                sqlx::query(
                    "INSERT INTO parked_events (group_name, position, reason)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (group_name, position)
                     DO UPDATE SET state = 'parked', reason = EXCLUDED.reason, parked_at = now()",
                )
                .bind(&self.group)
                .bind(record.position as i64)
                .bind(reason)
                .execute(&self.pool)
                .await?;
                self.settle(record).await
            }
            NackAction::Skip => self.settle(record).await,
        }
    }
}
