use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ErrorKind, Operation, OperationKind, OperationStatus};

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATE_EVENTS: &str = "orchestrate_events";

// -----------------------------------------------------------------------------
// Operation lifecycle events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum OperationEventType {
    #[serde(rename = "EVT:OPERATION_ACCEPTED")]
    Accepted,
    #[serde(rename = "EVT:OPERATION_STARTED")]
    Started,
    #[serde(rename = "EVT:OPERATION_SUCCEEDED")]
    Succeeded,
    #[serde(rename = "EVT:OPERATION_FAILED")]
    Failed,
}

impl OperationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationEventType::Accepted => "EVT:OPERATION_ACCEPTED",
            OperationEventType::Started => "EVT:OPERATION_STARTED",
            OperationEventType::Succeeded => "EVT:OPERATION_SUCCEEDED",
            OperationEventType::Failed => "EVT:OPERATION_FAILED",
        }
    }

    pub fn for_status(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Pending => OperationEventType::Accepted,
            OperationStatus::Running => OperationEventType::Started,
            OperationStatus::Succeeded => OperationEventType::Succeeded,
            OperationStatus::Failed => OperationEventType::Failed,
        }
    }
}

/// Side-channel message mirroring one Operation transition.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OperationEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: OperationEventType,
    pub occurred_at: DateTime<Utc>,
    pub request_id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub detail: String,
    pub error_kind: Option<ErrorKind>,
    pub project: Option<String>,
    pub target: Option<String>,
    pub source: String,
}

impl OperationEvent {
    pub fn from_operation(op: &Operation, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: OperationEventType::for_status(op.status),
            occurred_at: Utc::now(),
            request_id: op.request_id,
            kind: op.kind,
            status: op.status,
            detail: op.detail.clone(),
            error_kind: op.error_kind,
            project: op.project.clone(),
            target: op.target.clone(),
            source: source.to_string(),
        }
    }
}
