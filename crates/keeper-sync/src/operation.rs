//! Queued mutations and their retry state machine.
//!
//! ```text
//! pending --Start--> syncing --Succeeded--> completed
//!                       |--Failed (retries left)--> pending   (retryCount + 1)
//!                       |--Failed (exhausted)-----> failed    (retryCount + 1)
//!                       `--Interrupted------------> pending   (no increment)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Entity kind, e.g. `patient`.
    pub entity: String,
    pub entity_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub status: OperationStatus,
    /// Enqueue position; assigned by the queue.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn new(
        op_type: OperationType,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type,
            entity: entity.into(),
            entity_id: entity_id.into(),
            payload,
            timestamp: Utc::now(),
            retry_count: 0,
            status: OperationStatus::Pending,
            sequence: 0,
            last_error: None,
        }
    }

    /// Storage key; zero-padded so lexical order is enqueue order.
    pub fn key(&self) -> String {
        format!("{:020}-{}", self.sequence, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Start,
    Succeeded,
    Failed { reason: String },
    /// The process stopped while the operation was in flight.
    Interrupted,
}

impl SyncEvent {
    fn name(&self) -> &'static str {
        match self {
            SyncEvent::Start => "start",
            SyncEvent::Succeeded => "succeeded",
            SyncEvent::Failed { .. } => "failed",
            SyncEvent::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot apply `{event}` to an operation that is {from:?}")]
    Invalid {
        from: OperationStatus,
        event: &'static str,
    },
}

/// Apply `event` to `op`, returning the next state. `op` is never modified.
pub fn transition(
    op: &SyncOperation,
    event: SyncEvent,
    max_retry_attempts: u32,
) -> Result<SyncOperation, TransitionError> {
    let mut next = op.clone();
    match (op.status, event) {
        (OperationStatus::Pending, SyncEvent::Start) => {
            next.status = OperationStatus::Syncing;
        }
        (OperationStatus::Syncing, SyncEvent::Succeeded) => {
            next.status = OperationStatus::Completed;
            next.last_error = None;
        }
        (OperationStatus::Syncing, SyncEvent::Failed { reason }) => {
            next.retry_count = op.retry_count.saturating_add(1);
            next.last_error = Some(reason);
            next.status = if next.retry_count >= max_retry_attempts {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
        }
        (OperationStatus::Syncing, SyncEvent::Interrupted) => {
            next.status = OperationStatus::Pending;
        }
        (from, event) => {
            return Err(TransitionError::Invalid {
                from,
                event: event.name(),
            })
        }
    }
    Ok(next)
}
