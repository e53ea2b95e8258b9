// pgbackup/src/store/models.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::pg::DumpOptions;
use crate::schedule::CronSchedule;
use crate::utils::secret::Secret;

/// A source database with its connection string already decrypted.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseTarget {
    pub id: Uuid,
    pub name: String,
    /// Major version as stored, e.g. `"16"`. Checked against the allow-list
    /// when a run is resolved.
    pub pg_version: String,
    pub connection_string: Secret,
}

/// Where archives of a backup definition go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTarget {
    Local,
    Destination(Uuid),
}

#[derive(Debug, Clone)]
pub struct BackupDefinition {
    pub id: Uuid,
    pub name: String,
    pub database: DatabaseTarget,
    pub all_databases: bool,
    pub target: BackupTarget,
    pub cron_expression: String,
    pub time_zone: String,
    pub is_active: bool,
    /// Sub-path under the destination root, e.g. `/nightly`.
    pub dest_dir: String,
    /// Days to keep archives. Zero keeps them forever.
    pub retention_days: i16,
    pub options: DumpOptions,
    pub archive_password: Option<Secret>,
}

impl BackupDefinition {
    pub fn validate(&self) -> Result<()> {
        self.options.validate()?;
        CronSchedule::parse(&self.cron_expression, &self.time_zone)?;
        if self.retention_days < 0 {
            return Err(EngineError::InvalidConfig(format!(
                "backup {}: retention days cannot be negative",
                self.name
            )));
        }
        Ok(())
    }

    pub fn password(&self) -> Option<&Secret> {
        self.archive_password.as_ref().filter(|pw| !pw.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectProvider {
    Aws,
    Minio,
}

impl fmt::Display for ObjectProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectProvider::Aws => f.write_str("aws"),
            ObjectProvider::Minio => f.write_str("minio"),
        }
    }
}

/// How requests to an object store are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SigningMode {
    #[serde(rename = "v4")]
    V4,
    /// SigV4 headers without payload hashing or default checksums. Needed by
    /// S3-compatible servers that predate the newer checksum headers.
    #[serde(rename = "v4-unsigned-payload")]
    V4UnsignedPayload,
}

/// An object-storage endpoint with decrypted credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationTarget {
    pub id: Uuid,
    pub name: String,
    pub provider: ObjectProvider,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    pub endpoint: String,
    pub access_key: Secret,
    pub secret_key: Secret,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub signing: Option<SigningMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    #[serde(rename = "success")]
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(EngineError::Persistence(format!(
                "unknown execution status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub status: ExecutionStatus,
    pub message: Option<String>,
    /// Storage key of the archive, set on success.
    pub path: Option<String>,
    pub file_size: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn running(backup_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Execution {
            id: Uuid::new_v4(),
            backup_id,
            status: ExecutionStatus::Running,
            message: None,
            path: None,
            file_size: None,
            started_at,
            finished_at: None,
        }
    }

    /// Applies `outcome`, refusing to touch an execution that already left
    /// the running state.
    pub fn finish(&mut self, outcome: &ExecutionOutcome, finished_at: DateTime<Utc>) -> Result<()> {
        if self.status != ExecutionStatus::Running {
            return Err(EngineError::ExecutionAlreadyFinished(self.id));
        }
        match outcome {
            ExecutionOutcome::Succeeded { path, size } => {
                self.status = ExecutionStatus::Succeeded;
                self.path = Some(path.clone());
                self.file_size = Some(*size);
            }
            ExecutionOutcome::Failed { message } => {
                self.status = ExecutionStatus::Failed;
                self.message = Some(message.clone());
            }
        }
        self.finished_at = Some(finished_at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded { path: String, size: u64 },
    Failed { message: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Succeeded { .. } => ExecutionStatus::Succeeded,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_single_shot() -> anyhow::Result<()> {
        let mut execution = Execution::running(Uuid::new_v4(), Utc::now());
        execution.finish(
            &ExecutionOutcome::Succeeded {
                path: "nightly/dump.zip".to_string(),
                size: 42,
            },
            Utc::now(),
        )?;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.file_size, Some(42));

        let err = execution
            .finish(
                &ExecutionOutcome::Failed {
                    message: "late".to_string(),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionAlreadyFinished(id) if id == execution.id));
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        Ok(())
    }

    #[test]
    fn status_round_trips_through_storage_labels() -> anyhow::Result<()> {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str())?, status);
        }
        assert!(ExecutionStatus::parse("deleted").is_err());
        Ok(())
    }

    #[test]
    fn destination_deserializes_signing_labels() -> anyhow::Result<()> {
        let dest: DestinationTarget = serde_json::from_value(serde_json::json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "name": "minio",
            "provider": "minio",
            "bucket": "backups",
            "endpoint": "minio.local:9000",
            "access_key": "ak",
            "secret_key": "sk",
            "signing": "v4-unsigned-payload"
        }))?;
        assert_eq!(dest.provider, ObjectProvider::Minio);
        assert_eq!(dest.signing, Some(SigningMode::V4UnsignedPayload));
        assert!(!dest.force_path_style);
        assert!(dest.region.is_empty());
        Ok(())
    }
}
