// ABOUTME: Defines StatusUpdate, the unit of forwarding work queued for downstream ticketing systems.
// ABOUTME: Updates for the same external event share a content hash so newer ones coalesce in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::{ContentHash, Hashed};

/// Status reported for events that went stale without a ticket being opened.
pub const NO_ISSUE_CREATED: &str = "No_issue_created";

/// A pending status change for one external event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub event_id: String,
    pub event_name: Option<String>,
    pub status: String,
    /// The (possibly merged) event document the update was derived from.
    #[serde(default)]
    pub event: Value,
}

impl StatusUpdate {
    pub fn new(event_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_name: None,
            status: status.into(),
            event: Value::Null,
        }
    }

    /// Derive an update from an incoming event document. Returns None when the
    /// document carries no event id or no normalized status.
    ///
    /// The status is read from `free.eventNormalizedStatus`, which is either a
    /// plain string or a list of `{value, timestamp}` entries where the last
    /// entry is current.
    pub fn from_event(doc: &Value) -> Option<Self> {
        let event_id = doc.pointer("/mand/eventId")?.as_str()?;
        let status = match doc.pointer("/free/eventNormalizedStatus")? {
            Value::String(s) => s.clone(),
            Value::Array(entries) => entries
                .last()?
                .get("value")?
                .as_str()?
                .to_string(),
            other => {
                tracing::debug!("unsupported eventNormalizedStatus shape: {}", other);
                return None;
            }
        };
        let event_name = doc
            .pointer("/mand/eventName")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            event_id: event_id.to_string(),
            event_name,
            status,
            event: doc.clone(),
        })
    }
}

impl Hashed for StatusUpdate {
    fn content_hash(&self) -> ContentHash {
        ContentHash::of(self.event_id.as_bytes())
    }
}
