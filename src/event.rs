//! Domain events recorded in a project's activity stream.
//!
//! An [`Envelope`] is the unit appended to the log: a kind tag, a creation
//! timestamp, the owning project, and a kind-specific payload. JSON is the
//! wire and storage encoding; the payload travels under the `event` key.
//!
//! Decoding reads the envelope first and then interprets the payload by its
//! tag. A tag outside [`EventKind`] still decodes, into [`Payload::Unknown`],
//! so callers decide whether to reject it (HTTP) or set it aside (consumer).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The closed set of domain event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    MemberAdded,
    MemberRemoved,
    MemberAddedTask,
    MemberRemovedTask,
    TaskCreated,
    TaskStatusChanged,
    DocumentAdded,
    ProjectCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::MemberAdded,
        EventKind::MemberRemoved,
        EventKind::MemberAddedTask,
        EventKind::MemberRemovedTask,
        EventKind::TaskCreated,
        EventKind::TaskStatusChanged,
        EventKind::DocumentAdded,
        EventKind::ProjectCreated,
    ];

    /// The tag as written in the `type` field and used as the log event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MemberAdded => "MemberAdded",
            EventKind::MemberRemoved => "MemberRemoved",
            EventKind::MemberAddedTask => "MemberAddedTask",
            EventKind::MemberRemovedTask => "MemberRemovedTask",
            EventKind::TaskCreated => "TaskCreated",
            EventKind::TaskStatusChanged => "TaskStatusChanged",
            EventKind::DocumentAdded => "DocumentAdded",
            EventKind::ProjectCreated => "ProjectCreated",
        }
    }

    /// Human-readable confirmation returned after a successful append.
    pub fn confirmation(&self) -> &'static str {
        match self {
            EventKind::MemberAdded => "Successfully added member to project",
            EventKind::MemberRemoved => "Successfully removed member from project",
            EventKind::MemberAddedTask => "Successfully added member to task",
            EventKind::MemberRemovedTask => "Successfully removed member from task",
            EventKind::TaskCreated => "Successfully created task",
            EventKind::TaskStatusChanged => "Successfully changed task status",
            EventKind::DocumentAdded => "Successfully added document",
            EventKind::ProjectCreated => "Successfully created project",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnhandledEventType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Body of `MemberAdded` and `MemberRemoved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMember {
    pub member_id: String,
    pub project_id: String,
}

/// Body of `MemberAddedTask` and `MemberRemovedTask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMember {
    pub member_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub task_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusChanged {
    pub task_id: String,
    pub project_id: String,
    pub status: String,
    pub changed_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAdded {
    pub task_id: String,
    pub project_id: String,
    pub document_id: String,
    pub added_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCreated {
    pub project_id: String,
    pub title: String,
    pub owner_id: String,
}

/// Kind-specific event body, discriminated by the envelope's `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    MemberAdded(ProjectMember),
    MemberRemoved(ProjectMember),
    MemberAddedTask(TaskMember),
    MemberRemovedTask(TaskMember),
    TaskCreated(TaskCreated),
    TaskStatusChanged(TaskStatusChanged),
    DocumentAdded(DocumentAdded),
    ProjectCreated(ProjectCreated),
    /// A tag outside [`EventKind`]; the body is kept as-is.
    Unknown { kind: String, body: Value },
}

impl Payload {
    /// Interpret a raw body according to its tag.
    pub fn decode(tag: &str, body: Value) -> Result<Self> {
        let Ok(kind) = tag.parse::<EventKind>() else {
            return Ok(Payload::Unknown {
                kind: tag.to_string(),
                body,
            });
        };
        let payload = match kind {
            EventKind::MemberAdded => Payload::MemberAdded(serde_json::from_value(body)?),
            EventKind::MemberRemoved => Payload::MemberRemoved(serde_json::from_value(body)?),
            EventKind::MemberAddedTask => Payload::MemberAddedTask(serde_json::from_value(body)?),
            EventKind::MemberRemovedTask => {
                Payload::MemberRemovedTask(serde_json::from_value(body)?)
            }
            EventKind::TaskCreated => Payload::TaskCreated(serde_json::from_value(body)?),
            EventKind::TaskStatusChanged => {
                Payload::TaskStatusChanged(serde_json::from_value(body)?)
            }
            EventKind::DocumentAdded => Payload::DocumentAdded(serde_json::from_value(body)?),
            EventKind::ProjectCreated => Payload::ProjectCreated(serde_json::from_value(body)?),
        };
        Ok(payload)
    }

    /// The known kind, or `None` for [`Payload::Unknown`].
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Payload::MemberAdded(_) => Some(EventKind::MemberAdded),
            Payload::MemberRemoved(_) => Some(EventKind::MemberRemoved),
            Payload::MemberAddedTask(_) => Some(EventKind::MemberAddedTask),
            Payload::MemberRemovedTask(_) => Some(EventKind::MemberRemovedTask),
            Payload::TaskCreated(_) => Some(EventKind::TaskCreated),
            Payload::TaskStatusChanged(_) => Some(EventKind::TaskStatusChanged),
            Payload::DocumentAdded(_) => Some(EventKind::DocumentAdded),
            Payload::ProjectCreated(_) => Some(EventKind::ProjectCreated),
            Payload::Unknown { .. } => None,
        }
    }

    /// The tag string, including unknown ones.
    pub fn type_tag(&self) -> &str {
        match self {
            Payload::Unknown { kind, .. } => kind,
            known => known.kind().map_or("", |k| k.as_str()),
        }
    }
}

/// Serializes the body only; the tag lives on the envelope.
impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Payload::MemberAdded(body) | Payload::MemberRemoved(body) => body.serialize(serializer),
            Payload::MemberAddedTask(body) | Payload::MemberRemovedTask(body) => {
                body.serialize(serializer)
            }
            Payload::TaskCreated(body) => body.serialize(serializer),
            Payload::TaskStatusChanged(body) => body.serialize(serializer),
            Payload::DocumentAdded(body) => body.serialize(serializer),
            Payload::ProjectCreated(body) => body.serialize(serializer),
            Payload::Unknown { body, .. } => body.serialize(serializer),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The serialized unit appended to a project stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    /// Wall-clock creation time (UTC).
    pub time: DateTime<Utc>,
    /// Project whose stream this event belongs to.
    pub project_id: String,
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(project_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            time: Utc::now(),
            project_id: project_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.payload.kind()
    }

    pub fn type_tag(&self) -> &str {
        self.payload.type_tag()
    }

    /// Check that the envelope may be appended: a known kind and a
    /// non-empty project id.
    pub fn validate(&self) -> Result<EventKind> {
        let kind = self
            .kind()
            .ok_or_else(|| Error::UnhandledEventType(self.type_tag().to_string()))?;
        if self.project_id.trim().is_empty() {
            return Err(Error::InvalidEvent("missing projectId".to_string()));
        }
        Ok(kind)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct as _;

        let mut st = serializer.serialize_struct("Envelope", 4)?;
        st.serialize_field("type", self.type_tag())?;
        st.serialize_field("time", &self.time)?;
        st.serialize_field("projectId", &self.project_id)?;
        st.serialize_field("event", &self.payload)?;
        st.end()
    }
}

/// Wire shape before the payload is interpreted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "chrono::Utc::now")]
    time: DateTime<Utc>,
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    event: Value,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = Error;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        Ok(Self {
            payload: Payload::decode(&raw.kind, raw.event)?,
            time: raw.time,
            project_id: raw.project_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(kind: EventKind) -> Payload {
        match kind {
            EventKind::MemberAdded => Payload::MemberAdded(ProjectMember {
                member_id: "U1".into(),
                project_id: "P1".into(),
            }),
            EventKind::MemberRemoved => Payload::MemberRemoved(ProjectMember {
                member_id: "U1".into(),
                project_id: "P1".into(),
            }),
            EventKind::MemberAddedTask => Payload::MemberAddedTask(TaskMember {
                member_id: "U1".into(),
                task_id: "T1".into(),
            }),
            EventKind::MemberRemovedTask => Payload::MemberRemovedTask(TaskMember {
                member_id: "U1".into(),
                task_id: "T1".into(),
            }),
            EventKind::TaskCreated => Payload::TaskCreated(TaskCreated {
                task_id: "T1".into(),
                project_id: "P1".into(),
            }),
            EventKind::TaskStatusChanged => Payload::TaskStatusChanged(TaskStatusChanged {
                task_id: "T1".into(),
                project_id: "P1".into(),
                status: "InProgress".into(),
                changed_by: "U2".into(),
            }),
            EventKind::DocumentAdded => Payload::DocumentAdded(DocumentAdded {
                task_id: "T1".into(),
                project_id: "P1".into(),
                document_id: "D1".into(),
                added_by: "U3".into(),
            }),
            EventKind::ProjectCreated => Payload::ProjectCreated(ProjectCreated {
                project_id: "P1".into(),
                title: "Alpha".into(),
                owner_id: "U1".into(),
            }),
        }
    }

    #[test]
    fn every_kind_survives_json() {
        for kind in EventKind::ALL {
            let envelope = Envelope::new("P1", sample(kind));
            let bytes = serde_json::to_vec(&envelope).unwrap();
            let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(decoded, envelope, "kind {kind}");
            assert_eq!(decoded.kind(), Some(kind));
        }
    }

    #[test]
    fn wire_shape_uses_event_key_and_camel_case() {
        let envelope = Envelope::new("P1", sample(EventKind::TaskStatusChanged));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "TaskStatusChanged");
        assert_eq!(value["projectId"], "P1");
        assert_eq!(value["event"]["changedBy"], "U2");
        assert!(value["time"].is_string());
    }

    #[test]
    fn unknown_tag_decodes_with_opaque_body() {
        let envelope: Envelope = serde_json::from_value(json!({
            "type": "Foobar",
            "time": "2024-01-01T00:00:00Z",
            "projectId": "P1",
            "event": {"anything": [1, 2, 3]}
        }))
        .unwrap();

        assert_eq!(envelope.kind(), None);
        assert_eq!(envelope.type_tag(), "Foobar");
        assert!(matches!(
            envelope.validate(),
            Err(Error::UnhandledEventType(ref t)) if t == "Foobar"
        ));

        // The unknown body is written back untouched.
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event"], json!({"anything": [1, 2, 3]}));
    }

    #[test]
    fn known_tag_with_wrong_body_is_a_decode_error() {
        let result: std::result::Result<Envelope, _> = serde_json::from_value(json!({
            "type": "TaskCreated",
            "projectId": "P1",
            "event": {"title": "no task id here"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn empty_project_id_fails_validation() {
        let envelope = Envelope::new("", sample(EventKind::TaskCreated));
        assert!(matches!(envelope.validate(), Err(Error::InvalidEvent(_))));
    }

    #[test]
    fn missing_time_defaults_to_now() {
        let before = Utc::now();
        let envelope: Envelope = serde_json::from_value(json!({
            "type": "TaskCreated",
            "projectId": "P1",
            "event": {"taskId": "T1", "projectId": "P1"}
        }))
        .unwrap();
        assert!(envelope.time >= before);
    }

    #[test]
    fn confirmation_matches_kind() {
        assert_eq!(
            EventKind::ProjectCreated.confirmation(),
            "Successfully created project"
        );
        assert_eq!(
            EventKind::MemberAdded.confirmation(),
            "Successfully added member to project"
        );
    }
}
