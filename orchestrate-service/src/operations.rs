//! Operation Tracker: one durable record per accepted mutating request.
//!
//! Records are created Pending at acceptance and only moved forward by the task doing the
//! work. Every transition is logged and mirrored on the event bus.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use orchestrate_common::bus::OperationEvent;
use orchestrate_common::{
    ErrorKind, Operation, OperationKind, OperationStatus, OrchestrateError, Result,
};

use crate::events::EventPublisher;
use crate::locks::KeyedLocks;
use crate::store::Records;

const EVENT_SOURCE: &str = "orchestrate-service";

#[derive(Clone)]
pub struct OperationTracker {
    records: Records,
    publisher: Arc<dyn EventPublisher>,
    locks: KeyedLocks,
}

fn transition_allowed(from: OperationStatus, to: OperationStatus) -> bool {
    use OperationStatus::*;
    matches!(
        (from, to),
        (Pending, Running) | (Running, Running) | (Pending | Running, Succeeded | Failed)
    )
}

impl OperationTracker {
    pub fn new(records: Records, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            records,
            publisher,
            locks: KeyedLocks::new(),
        }
    }

    /// Create a Pending Operation. Called before any work is done.
    pub async fn begin(
        &self,
        kind: OperationKind,
        project: Option<&str>,
        target: Option<&str>,
    ) -> Result<Operation> {
        let now = Utc::now();
        let op = Operation {
            request_id: Uuid::new_v4(),
            kind,
            status: OperationStatus::Pending,
            detail: "accepted".to_string(),
            error_kind: None,
            project: project.map(str::to_string),
            target: target.map(str::to_string),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.records.put_operation(&op).await?;
        tracing::info!(
            request_id = %op.request_id,
            kind = kind.as_str(),
            project = project.unwrap_or(""),
            target = target.unwrap_or(""),
            "operation accepted"
        );
        self.publish(&op).await;
        Ok(op)
    }

    pub async fn get(&self, id: Uuid) -> Result<Operation> {
        self.records
            .get_operation(id)
            .await?
            .ok_or_else(|| OrchestrateError::not_found(format!("operation {}", id)))
    }

    /// Move `id` to `status`. A terminal Operation never changes again.
    pub async fn transition(
        &self,
        id: Uuid,
        status: OperationStatus,
        detail: &str,
        error_kind: Option<ErrorKind>,
    ) -> Result<Operation> {
        let _guard = self.locks.lock(&id.to_string()).await;
        let mut op = self.get(id).await?;

        if op.status.is_terminal() {
            return Err(OrchestrateError::InvalidState(format!(
                "operation {} is already {}",
                id,
                op.status.as_str()
            )));
        }
        if !transition_allowed(op.status, status) {
            return Err(OrchestrateError::InvalidState(format!(
                "operation {} cannot move from {} to {}",
                id,
                op.status.as_str(),
                status.as_str()
            )));
        }

        let from = op.status;
        let now = Utc::now();
        op.status = status;
        op.detail = detail.to_string();
        op.error_kind = error_kind;
        op.updated_at = now;
        if status.is_terminal() {
            op.completed_at = Some(now);
        }
        self.records.put_operation(&op).await?;

        match status {
            OperationStatus::Failed => tracing::warn!(
                request_id = %id,
                kind = op.kind.as_str(),
                from = from.as_str(),
                error_kind = error_kind.map(|k| k.as_str()).unwrap_or(""),
                detail,
                "operation failed"
            ),
            _ => tracing::info!(
                request_id = %id,
                kind = op.kind.as_str(),
                from = from.as_str(),
                to = status.as_str(),
                detail,
                "operation transition"
            ),
        }
        self.publish(&op).await;
        Ok(op)
    }

    pub async fn start(&self, id: Uuid, detail: &str) -> Result<Operation> {
        self.transition(id, OperationStatus::Running, detail, None).await
    }

    pub async fn succeed(&self, id: Uuid, detail: &str) -> Result<Operation> {
        self.transition(id, OperationStatus::Succeeded, detail, None).await
    }

    pub async fn fail(&self, id: Uuid, err: &OrchestrateError) -> Result<Operation> {
        self.transition(id, OperationStatus::Failed, &err.to_string(), Some(err.kind()))
            .await
    }

    /// Record the outcome of a background task.
    pub async fn finish(&self, id: Uuid, outcome: Result<String>) {
        let res = match &outcome {
            Ok(detail) => self.succeed(id, detail).await,
            Err(err) => self.fail(id, err).await,
        };
        if let Err(e) = res {
            tracing::error!(request_id = %id, error = %e, "failed to record operation outcome");
        }
    }

    pub fn reporter(&self, id: Uuid) -> ProgressReporter {
        ProgressReporter {
            tracker: self.clone(),
            id,
        }
    }

    async fn publish(&self, op: &Operation) {
        let evt = OperationEvent::from_operation(op, EVENT_SOURCE);
        if let Err(e) = self.publisher.publish(&evt).await {
            tracing::warn!(request_id = %op.request_id, error = %format!("{:#}", e), "event publish failed");
        }
    }
}

/// Writes Running detail updates for one Operation.
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: OperationTracker,
    id: Uuid,
}

impl ProgressReporter {
    pub async fn report(&self, detail: &str) {
        if let Err(e) = self.tracker.start(self.id, detail).await {
            tracing::warn!(request_id = %self.id, error = %e, "progress update rejected");
        }
    }
}
