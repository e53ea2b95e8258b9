//! Persistence collaborator: backup definitions, destinations and execution
//! records. Implementations hand out secrets already decrypted.

pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
pub use memory::MemoryRepository;
pub use models::{
    BackupDefinition, BackupTarget, DatabaseTarget, DestinationTarget, Execution,
    ExecutionOutcome, ExecutionStatus, ObjectProvider, SigningMode,
};
pub use postgres::PgRepository;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_backup_definition(&self, id: Uuid) -> Result<BackupDefinition>;

    async fn list_active_backup_definitions(&self) -> Result<Vec<BackupDefinition>>;

    /// Definitions with a positive retention window, active or not.
    async fn list_backup_definitions_with_retention(&self) -> Result<Vec<BackupDefinition>>;

    async fn get_destination(&self, id: Uuid) -> Result<DestinationTarget>;

    async fn create_execution(&self, backup_id: Uuid, started_at: DateTime<Utc>) -> Result<Execution>;

    /// Moves a running execution to its final state. Fails with
    /// `ExecutionAlreadyFinished` when the record already left `running`.
    async fn finish_execution(
        &self,
        id: Uuid,
        outcome: &ExecutionOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Execution>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution>;

    /// Finished executions of `backup_id` that ended before `cutoff`.
    async fn list_expired_executions(
        &self,
        backup_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Execution>>;

    async fn delete_execution(&self, id: Uuid) -> Result<()>;
}
