//! Replays a project stream from the log.

use std::sync::Arc;

use futures::TryStreamExt as _;
use opentelemetry::KeyValue;
use tracing::warn;

use super::StreamNaming;
use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::log::EventLog;
use crate::telemetry::metrics;

/// Page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u64 = 1000;

/// One page of a stream.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub events: Vec<Envelope>,
    /// Revision to continue from when the stream holds more records.
    pub next_from: Option<u64>,
}

#[derive(Clone)]
pub struct Reader {
    log: Arc<dyn EventLog>,
    naming: StreamNaming,
}

impl Reader {
    pub fn new(log: Arc<dyn EventLog>, naming: StreamNaming) -> Self {
        Self { log, naming }
    }

    /// The first [`DEFAULT_PAGE_SIZE`] events of a project, in append order.
    pub async fn read(&self, project_id: &str) -> Result<Vec<Envelope>> {
        Ok(self
            .read_page(project_id, 0, DEFAULT_PAGE_SIZE)
            .await?
            .events)
    }

    /// Up to `limit` records starting at revision `from`. Records that do
    /// not decode as envelopes are skipped but still count toward `limit`.
    pub async fn read_page(&self, project_id: &str, from: u64, limit: u64) -> Result<Page> {
        if project_id.is_empty() {
            return Err(Error::InvalidEvent("missing projectId".to_string()));
        }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        // Revisions are stored as BIGINT.
        let from = from.min(i64::MAX as u64);
        let stream = self.naming.stream_for(project_id);

        let result = self.collect_page(&stream, from, limit).await;
        metrics::stream_reads().add(
            1,
            &[KeyValue::new(
                "result",
                if result.is_ok() { "ok" } else { "error" },
            )],
        );
        result
    }

    async fn collect_page(&self, stream: &str, from: u64, limit: u64) -> Result<Page> {
        // One record past the page tells whether a continuation exists.
        let mut records = self.log.read_stream(stream, from, limit + 1);
        let mut page = Page::default();
        let mut seen = 0;

        while let Some(record) = records.try_next().await? {
            if seen == limit {
                page.next_from = Some(record.revision);
                break;
            }
            seen += 1;
            match serde_json::from_slice::<Envelope>(&record.data) {
                Ok(envelope) => page.events.push(envelope),
                Err(e) => warn!(
                    event_id = %record.event_id,
                    stream,
                    revision = record.revision,
                    "skipping undecodable record: {e}"
                ),
            }
        }
        Ok(page)
    }

    /// Best-effort read across every stream in global order.
    pub async fn read_all(&self, limit: u64) -> Result<Vec<Envelope>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut records = self.log.read_all(0, limit);
        let mut events = Vec::new();
        while let Some(record) = records.try_next().await? {
            match serde_json::from_slice::<Envelope>(&record.data) {
                Ok(envelope) => events.push(envelope),
                Err(e) => warn!(
                    event_id = %record.event_id,
                    stream = %record.stream,
                    "skipping undecodable record: {e}"
                ),
            }
        }
        Ok(events)
    }
}
