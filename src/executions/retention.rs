// pgbackup/src/executions/retention.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{EngineError, Result};
use crate::storage::StorageResolver;
use crate::store::Repository;
use crate::utils::locks::RecordLocks;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes archives and execution records that aged out of their
/// definition's retention window.
pub struct RetentionEnforcer {
    repo: Arc<dyn Repository>,
    storage: StorageResolver,
    locks: Arc<RecordLocks>,
}

impl RetentionEnforcer {
    pub fn new(repo: Arc<dyn Repository>, storage: StorageResolver, locks: Arc<RecordLocks>) -> Self {
        Self {
            repo,
            storage,
            locks,
        }
    }

    /// One reaping pass. A record is only deleted after its archive is gone,
    /// and a failure on one record does not stop the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        for definition in self.repo.list_backup_definitions_with_retention().await? {
            if definition.retention_days <= 0 {
                continue;
            }
            let cutoff = now - chrono::Duration::days(i64::from(definition.retention_days));
            let expired = self
                .repo
                .list_expired_executions(definition.id, cutoff)
                .await?;
            if expired.is_empty() {
                continue;
            }

            let transport = match self.storage.for_target(definition.target).await {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(backup_id = %definition.id, error = %err, "cannot reach storage for retention");
                    report.failed += expired.len();
                    continue;
                }
            };

            for execution in expired {
                let _lock = self.locks.lock(execution.id).await;
                // A concurrent pass may have reaped it while we waited.
                match self.repo.get_execution(execution.id).await {
                    Ok(_) => {}
                    Err(EngineError::NotFound(_)) => continue,
                    Err(err) => return Err(err),
                }

                if let Some(path) = execution.path.as_deref() {
                    if let Err(err) = transport.delete(path).await {
                        warn!(
                            backup_id = %definition.id,
                            execution_id = %execution.id,
                            key = %path,
                            error = %err,
                            "failed to delete expired archive, keeping record"
                        );
                        report.failed += 1;
                        continue;
                    }
                }
                self.repo.delete_execution(execution.id).await?;
                report.deleted += 1;
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            info!(deleted = report.deleted, failed = report.failed, "retention pass finished");
        }
        Ok(report)
    }

    /// Runs a pass every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once(Utc::now()).await {
                            error!(error = %err, "retention pass failed");
                        }
                    }
                }
            }
        })
    }
}
