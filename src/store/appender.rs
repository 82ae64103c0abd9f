//! Appends validated envelopes to their project stream.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::StreamNaming;
use crate::error::Result;
use crate::event::Envelope;
use crate::log::{AppendResult, EventLog, NewRecord};
use crate::telemetry::metrics;

/// Writes envelopes to `stream_for(projectId)` with a fresh event id.
///
/// No expected-version check and no retry: transport errors go back to
/// the caller.
#[derive(Clone)]
pub struct Appender {
    log: Arc<dyn EventLog>,
    naming: StreamNaming,
}

impl Appender {
    pub fn new(log: Arc<dyn EventLog>, naming: StreamNaming) -> Self {
        Self { log, naming }
    }

    /// Validate, encode, and append one envelope.
    pub async fn append(&self, envelope: &Envelope) -> Result<AppendResult> {
        let kind = envelope.validate()?;
        let stream = self.naming.stream_for(&envelope.project_id);
        let record = NewRecord::json(kind.as_str(), serde_json::to_vec(envelope)?);
        let event_id = record.event_id;

        let result = self.log.append(&stream, record).await;
        match &result {
            Ok(landed) => debug!(
                %event_id,
                %stream,
                kind = kind.as_str(),
                position = landed.position,
                revision = landed.revision,
                "event appended"
            ),
            Err(e) => warn!(%event_id, %stream, kind = kind.as_str(), "append failed: {e}"),
        }
        metrics::events_appended().add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );
        result
    }
}
