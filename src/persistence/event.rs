use crate::transaction::ExecuteStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaEventType {
    /// Payload is the full saga definition JSON.
    SagaStartedEvent,
    TransactionStartedEvent,
    TransactionEndedEvent,
    TransactionAbortedEvent,
    CompensationStartedEvent,
    TransactionCompensatedEvent,
    /// Terminal. A saga without it is pending.
    SagaEndedEvent,
}

impl SagaEventType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaEventType::SagaEndedEvent)
    }
}

impl fmt::Display for SagaEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One append-only saga event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEvent {
    /// Assigned by the store on `offer`.
    pub id: u64,
    pub saga_id: String,
    pub create_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: SagaEventType,
    pub content_json: String,
}

impl SagaEvent {
    pub fn new(saga_id: impl Into<String>, event_type: SagaEventType, content_json: impl Into<String>) -> Self {
        Self {
            id: 0,
            saga_id: saga_id.into(),
            create_time: Utc::now(),
            event_type,
            content_json: content_json.into(),
        }
    }

    /// Event about a single request; payload `{"requestId": ..}` plus an
    /// optional error message.
    pub fn for_request(
        saga_id: impl Into<String>,
        event_type: SagaEventType,
        request_id: &str,
        error: Option<&str>,
    ) -> Self {
        let content = match error {
            Some(message) => serde_json::json!({ "requestId": request_id, "error": message }),
            None => serde_json::json!({ "requestId": request_id }),
        };
        Self::new(saga_id, event_type, content.to_string())
    }

    /// `TransactionEndedEvent` for a request; `applied` is false when the
    /// transport left the data source untouched.
    pub fn ended(saga_id: impl Into<String>, request_id: &str, applied: bool) -> Self {
        let content = serde_json::json!({ "requestId": request_id, "applied": applied });
        Self::new(saga_id, SagaEventType::TransactionEndedEvent, content.to_string())
    }

    /// Whether an ended request left its effect in the database. Logs written
    /// without the flag count as applied.
    pub fn applied(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.content_json)
            .ok()
            .and_then(|content| content.get("applied")?.as_bool())
            .unwrap_or(true)
    }

    /// Request id carried by a per-request event.
    pub fn request_id(&self) -> Option<String> {
        let content: serde_json::Value = serde_json::from_str(&self.content_json).ok()?;
        content.get("requestId")?.as_str().map(str::to_string)
    }
}

/// Pre-image record of one branch, kept until its transaction finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaSnapshot {
    /// Assigned by the store on `persist_snapshot`.
    pub id: u64,
    pub transaction_id: String,
    pub snapshot_id: u64,
    pub transaction_context: String,
    pub revert_context: String,
    pub execute_status: ExecuteStatus,
}

impl SagaSnapshot {
    pub fn new(
        transaction_id: &str,
        snapshot_id: u64,
        transaction_context: String,
        revert_context: String,
        execute_status: ExecuteStatus,
    ) -> Self {
        Self {
            id: 0,
            transaction_id: transaction_id.to_string(),
            snapshot_id,
            transaction_context,
            revert_context,
            execute_status,
        }
    }
}
