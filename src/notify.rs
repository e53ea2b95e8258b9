// pgbackup/src/notify.rs
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::ExecutionStatus;

/// Emitted once per finished execution, after its record is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub backup_id: Uuid,
    pub execution_id: Uuid,
    pub outcome: ExecutionStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub size_bytes: Option<u64>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn execution_finished(&self, event: &ExecutionEvent);
}

/// Writes the event to the log. Used when no webhook collaborator is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn execution_finished(&self, event: &ExecutionEvent) {
        match &event.error {
            None => info!(
                backup_id = %event.backup_id,
                execution_id = %event.execution_id,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                size_bytes = event.size_bytes,
                "backup execution finished"
            ),
            Some(error) => warn!(
                backup_id = %event.backup_id,
                execution_id = %event.execution_id,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                error = %error,
                "backup execution failed"
            ),
        }
    }
}
