//! Execution records: opened before a run, closed exactly once after it.

pub mod retention;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::notify::ExecutionEvent;
use crate::store::{Execution, ExecutionOutcome, Repository};
use crate::utils::diagnostics;
pub use retention::{RetentionEnforcer, RetentionReport};

/// Attempts at writing a run's final state before giving up.
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Proof that an execution is open. `finish` consumes it, so a run cannot
/// close its record twice.
#[derive(Debug)]
pub struct RunningExecution {
    execution_id: Uuid,
    backup_id: Uuid,
    started: Instant,
}

impl RunningExecution {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn backup_id(&self) -> Uuid {
        self.backup_id
    }
}

#[derive(Clone)]
pub struct ExecutionTracker {
    repo: Arc<dyn Repository>,
}

impl ExecutionTracker {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn begin(&self, backup_id: Uuid) -> Result<RunningExecution> {
        let execution = self.repo.create_execution(backup_id, Utc::now()).await?;
        debug!(%backup_id, execution_id = %execution.id, "execution started");
        Ok(RunningExecution {
            execution_id: execution.id,
            backup_id,
            started: Instant::now(),
        })
    }

    /// Finalises the record and returns it with the matching notification.
    /// Failure messages are redacted and truncated before they are stored.
    /// Transient repository errors are retried a few times with a growing
    /// delay; the last error is returned and the record stays `running`.
    pub async fn finish(
        &self,
        running: RunningExecution,
        outcome: ExecutionOutcome,
    ) -> Result<(Execution, ExecutionEvent)> {
        let outcome = match outcome {
            ExecutionOutcome::Failed { message } => ExecutionOutcome::Failed {
                message: diagnostics::for_record(&message),
            },
            succeeded => succeeded,
        };
        let mut attempt = 1;
        let execution = loop {
            match self
                .repo
                .finish_execution(running.execution_id, &outcome, Utc::now())
                .await
            {
                Ok(execution) => break execution,
                Err(err @ (EngineError::ExecutionAlreadyFinished(_) | EngineError::NotFound(_))) => {
                    return Err(err);
                }
                Err(err) if attempt >= FINISH_ATTEMPTS => return Err(err),
                Err(err) => {
                    warn!(
                        execution_id = %running.execution_id,
                        attempt,
                        error = %err,
                        "could not finalise execution, retrying"
                    );
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
            }
        };

        let event = ExecutionEvent {
            backup_id: running.backup_id,
            execution_id: running.execution_id,
            outcome: execution.status,
            error: execution.message.clone(),
            duration_ms: u64::try_from(running.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            size_bytes: execution.file_size,
        };
        debug!(
            backup_id = %running.backup_id,
            execution_id = %running.execution_id,
            status = %execution.status,
            "execution finished"
        );
        Ok((execution, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionStatus, MemoryRepository};
    use crate::utils::diagnostics::MAX_DIAGNOSTIC_BYTES;

    #[tokio::test]
    async fn success_records_path_and_size() -> anyhow::Result<()> {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = ExecutionTracker::new(repo.clone());
        let backup_id = Uuid::new_v4();

        let running = tracker.begin(backup_id).await?;
        let execution_id = running.execution_id();
        assert_eq!(repo.get_execution(execution_id).await?.status, ExecutionStatus::Running);

        let (execution, event) = tracker
            .finish(
                running,
                ExecutionOutcome::Succeeded {
                    path: "nightly/dump.zip".to_string(),
                    size: 2048,
                },
            )
            .await?;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.path.as_deref(), Some("nightly/dump.zip"));
        assert_eq!(event.size_bytes, Some(2048));
        assert_eq!(event.error, None);
        assert_eq!(event.execution_id, execution_id);
        Ok(())
    }

    #[tokio::test]
    async fn failure_message_is_redacted_and_bounded() -> anyhow::Result<()> {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = ExecutionTracker::new(repo.clone());
        let running = tracker.begin(Uuid::new_v4()).await?;

        let noisy = format!(
            "could not connect to postgres://app:hunter2@db/app\n{}",
            "x".repeat(10_000)
        );
        let (execution, event) = tracker
            .finish(running, ExecutionOutcome::Failed { message: noisy })
            .await?;
        let stored = execution.message.unwrap_or_default();
        assert!(!stored.contains("hunter2"));
        assert!(stored.len() <= MAX_DIAGNOSTIC_BYTES + 32);
        assert_eq!(event.outcome, ExecutionStatus::Failed);
        assert_eq!(event.error.as_deref(), Some(stored.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn transient_finish_errors_are_retried() -> anyhow::Result<()> {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = ExecutionTracker::new(repo.clone());
        let running = tracker.begin(Uuid::new_v4()).await?;
        let execution_id = running.execution_id();

        repo.fail_next_finishes(2);
        let (execution, _) = tracker
            .finish(running, ExecutionOutcome::Failed { message: "boom".to_string() })
            .await?;
        assert_eq!(execution.id, execution_id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn persistent_finish_errors_are_returned() -> anyhow::Result<()> {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = ExecutionTracker::new(repo.clone());
        let running = tracker.begin(Uuid::new_v4()).await?;
        let execution_id = running.execution_id();

        repo.fail_next_finishes(FINISH_ATTEMPTS as usize);
        let err = tracker
            .finish(running, ExecutionOutcome::Failed { message: "boom".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(repo.get_execution(execution_id).await?.status, ExecutionStatus::Running);
        Ok(())
    }
}
