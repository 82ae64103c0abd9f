//! Processors invoked by the consumer on each delivered event.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::event::{Envelope, Payload};
use crate::telemetry::metrics;

/// Where a delivery sits in the log and how often it was retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryContext {
    pub event_id: Uuid,
    pub position: u64,
    /// Retries requested for this event so far; 0 on first delivery.
    pub retry_count: u32,
}

/// Handles one delivered envelope.
///
/// Delivery is at-least-once, so implementations must tolerate seeing the
/// same event more than once. Returning [`Error::Poison`] parks the event;
/// any other error asks for redelivery. A processor that wants to stop
/// retrying checks `delivery.retry_count` and returns `Poison`.
///
/// [`Error::Poison`]: crate::error::Error::Poison
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, envelope: &Envelope, delivery: &DeliveryContext) -> Result<()>;
}

/// Default processor: records each event in the activity log output and
/// counts it by kind. No derived events, no read model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityProcessor;

#[async_trait]
impl Processor for ActivityProcessor {
    async fn process(&self, envelope: &Envelope, _delivery: &DeliveryContext) -> Result<()> {
        let project = envelope.project_id.as_str();
        match &envelope.payload {
            Payload::MemberAdded(p) => {
                info!(project, member = %p.member_id, "member added to project");
            }
            Payload::MemberRemoved(p) => {
                info!(project, member = %p.member_id, "member removed from project");
            }
            Payload::MemberAddedTask(p) => {
                info!(project, member = %p.member_id, task = %p.task_id, "member added to task");
            }
            Payload::MemberRemovedTask(p) => {
                info!(project, member = %p.member_id, task = %p.task_id, "member removed from task");
            }
            Payload::TaskCreated(p) => info!(project, task = %p.task_id, "task created"),
            Payload::TaskStatusChanged(p) => info!(
                project,
                task = %p.task_id,
                status = %p.status,
                changed_by = %p.changed_by,
                "task status changed"
            ),
            Payload::DocumentAdded(p) => info!(
                project,
                task = %p.task_id,
                document = %p.document_id,
                added_by = %p.added_by,
                "document added"
            ),
            Payload::ProjectCreated(p) => {
                info!(project, title = %p.title, owner = %p.owner_id, "project created");
            }
            Payload::Unknown { kind, .. } => {
                info!(project, kind = %kind, "unhandled event type");
                return Ok(());
            }
        }
        metrics::events_processed().add(
            1,
            &[KeyValue::new("kind", envelope.type_tag().to_string())],
        );
        Ok(())
    }
}
