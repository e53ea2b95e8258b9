// pgbackup/src/store/memory.rs
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::Repository;
use super::ledger::ExecutionLedger;
use super::models::{BackupDefinition, DestinationTarget, Execution, ExecutionOutcome, ExecutionStatus};
use crate::errors::{EngineError, Result};

#[derive(Debug, Default)]
struct State {
    definitions: HashMap<Uuid, BackupDefinition>,
    destinations: HashMap<Uuid, DestinationTarget>,
    executions: HashMap<Uuid, Execution>,
}

/// Repository for inline configuration and tests. Definitions and
/// destinations live in memory; executions too, unless a ledger file is
/// attached with [`MemoryRepository::with_ledger`].
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    ledger: Option<ExecutionLedger>,
    #[cfg(test)]
    finish_failures: std::sync::atomic::AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps execution records in the JSON file at `path`.
    pub fn with_ledger(path: impl Into<PathBuf>) -> Self {
        Self {
            ledger: Some(ExecutionLedger::new(path)),
            ..Self::default()
        }
    }

    pub fn upsert_definition(&self, definition: BackupDefinition) {
        self.state.lock().definitions.insert(definition.id, definition);
    }

    pub fn remove_definition(&self, id: Uuid) {
        self.state.lock().definitions.remove(&id);
    }

    pub fn upsert_destination(&self, destination: DestinationTarget) {
        self.state.lock().destinations.insert(destination.id, destination);
    }

    /// In-memory executions only.
    pub fn insert_execution(&self, execution: Execution) {
        self.state.lock().executions.insert(execution.id, execution);
    }

    /// In-memory executions of one definition, oldest first.
    pub fn executions_for(&self, backup_id: Uuid) -> Vec<Execution> {
        let state = self.state.lock();
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|execution| execution.backup_id == backup_id)
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.started_at);
        executions
    }

    /// The next `count` calls to `finish_execution` fail.
    #[cfg(test)]
    pub fn fail_next_finishes(&self, count: usize) {
        self.finish_failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    async fn update_executions<T>(
        &self,
        change: impl FnOnce(&mut HashMap<Uuid, Execution>) -> Result<T>,
    ) -> Result<T> {
        match &self.ledger {
            Some(ledger) => ledger.update(change).await,
            None => {
                let mut state = self.state.lock();
                change(&mut state.executions)
            }
        }
    }

    async fn view_executions<T>(&self, view: impl FnOnce(&HashMap<Uuid, Execution>) -> T) -> Result<T> {
        match &self.ledger {
            Some(ledger) => Ok(view(&ledger.read().await?)),
            None => {
                let state = self.state.lock();
                Ok(view(&state.executions))
            }
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_backup_definition(&self, id: Uuid) -> Result<BackupDefinition> {
        self.state
            .lock()
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("backup {id}")))
    }

    async fn list_active_backup_definitions(&self) -> Result<Vec<BackupDefinition>> {
        let state = self.state.lock();
        Ok(state
            .definitions
            .values()
            .filter(|definition| definition.is_active)
            .cloned()
            .collect())
    }

    async fn list_backup_definitions_with_retention(&self) -> Result<Vec<BackupDefinition>> {
        let state = self.state.lock();
        Ok(state
            .definitions
            .values()
            .filter(|definition| definition.retention_days > 0)
            .cloned()
            .collect())
    }

    async fn get_destination(&self, id: Uuid) -> Result<DestinationTarget> {
        self.state
            .lock()
            .destinations
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("destination {id}")))
    }

    async fn create_execution(&self, backup_id: Uuid, started_at: DateTime<Utc>) -> Result<Execution> {
        let execution = Execution::running(backup_id, started_at);
        let stored = execution.clone();
        self.update_executions(move |executions| {
            executions.insert(stored.id, stored);
            Ok(())
        })
        .await?;
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        outcome: &ExecutionOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Execution> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let pending = self.finish_failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.finish_failures.store(pending - 1, Ordering::SeqCst);
                return Err(EngineError::Persistence("connection reset".to_string()));
            }
        }
        self.update_executions(|executions| {
            let execution = executions
                .get_mut(&id)
                .ok_or_else(|| EngineError::NotFound(format!("execution {id}")))?;
            execution.finish(outcome, finished_at)?;
            Ok(execution.clone())
        })
        .await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.view_executions(|executions| executions.get(&id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {id}")))
    }

    async fn list_expired_executions(
        &self,
        backup_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Execution>> {
        let mut expired = self
            .view_executions(|executions| {
                executions
                    .values()
                    .filter(|execution| {
                        execution.backup_id == backup_id
                            && execution.status != ExecutionStatus::Running
                            && execution.finished_at.is_some_and(|at| at < cutoff)
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await?;
        expired.sort_by_key(|execution| execution.finished_at);
        Ok(expired)
    }

    async fn delete_execution(&self, id: Uuid) -> Result<()> {
        self.update_executions(|executions| {
            executions.remove(&id);
            Ok(())
        })
        .await
    }
}
