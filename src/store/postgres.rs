// pgbackup/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::Repository;
use super::models::{
    BackupDefinition, BackupTarget, DatabaseTarget, DestinationTarget, Execution,
    ExecutionOutcome, ExecutionStatus, ObjectProvider,
};
use crate::errors::{EngineError, Result};
use crate::pg::DumpOptions;
use crate::utils::secret::Secret;

const BACKUP_SELECT: &str = r#"
    SELECT
        b.id, b.name, b.destination_id, b.is_local, b.all_databases,
        b.cron_expression, b.time_zone, b.is_active, b.dest_dir, b.retention_days,
        b.opt_data_only, b.opt_schema_only, b.opt_clean, b.opt_if_exists,
        b.opt_create, b.opt_no_comments,
        pgp_sym_decrypt(b.zip_password, $1) AS zip_password,
        d.id AS database_id, d.name AS database_name, d.pg_version,
        pgp_sym_decrypt(d.connection_string, $1) AS connection_string
    FROM backups b
    JOIN databases d ON d.id = b.database_id
"#;

const DESTINATION_SELECT: &str = r#"
    SELECT
        id, name, provider, bucket_name, region, endpoint, force_path_style,
        pgp_sym_decrypt(access_key, $1) AS access_key,
        pgp_sym_decrypt(secret_key, $1) AS secret_key
    FROM destinations
"#;

const EXECUTION_COLUMNS: &str =
    "id, backup_id, status, message, path, file_size, started_at, finished_at";

/// Repository over the backups/databases/destinations/executions tables.
/// Secrets are stored with pgcrypto and decrypted in the query.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
    encryption_key: Secret,
}

impl PgRepository {
    pub async fn connect(database_url: &str, encryption_key: Secret) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("connected to the metadata database");
        Ok(Self {
            pool,
            encryption_key,
        })
    }

    async fn fetch_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| execution_from_row(&row))
            .transpose()
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_backup_definition(&self, id: Uuid) -> Result<BackupDefinition> {
        let sql = format!("{BACKUP_SELECT} WHERE b.id = $2");
        let row = sqlx::query(&sql)
            .bind(self.encryption_key.expose())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("backup {id}")))?;
        definition_from_row(&row)
    }

    async fn list_active_backup_definitions(&self) -> Result<Vec<BackupDefinition>> {
        let sql = format!("{BACKUP_SELECT} WHERE b.is_active = true ORDER BY b.name");
        let rows = sqlx::query(&sql)
            .bind(self.encryption_key.expose())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn list_backup_definitions_with_retention(&self) -> Result<Vec<BackupDefinition>> {
        let sql = format!("{BACKUP_SELECT} WHERE b.retention_days > 0 ORDER BY b.name");
        let rows = sqlx::query(&sql)
            .bind(self.encryption_key.expose())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn get_destination(&self, id: Uuid) -> Result<DestinationTarget> {
        let sql = format!("{DESTINATION_SELECT} WHERE id = $2");
        let row = sqlx::query(&sql)
            .bind(self.encryption_key.expose())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("destination {id}")))?;
        destination_from_row(&row)
    }

    async fn create_execution(&self, backup_id: Uuid, started_at: DateTime<Utc>) -> Result<Execution> {
        let execution = Execution::running(backup_id, started_at);
        sqlx::query(
            "INSERT INTO executions (id, backup_id, status, started_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(execution.id)
        .bind(execution.backup_id)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .execute(&self.pool)
        .await?;
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        outcome: &ExecutionOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Execution> {
        let (message, path, size) = match outcome {
            ExecutionOutcome::Succeeded { path, size } => {
                (None, Some(path.as_str()), Some(size_to_column(*size)?))
            }
            ExecutionOutcome::Failed { message } => (Some(message.as_str()), None, None),
        };
        let sql = format!(
            "UPDATE executions \
             SET status = $2, message = $3, path = $4, file_size = $5, finished_at = $6 \
             WHERE id = $1 AND status = 'running' \
             RETURNING {EXECUTION_COLUMNS}"
        );
        let updated = sqlx::query(&sql)
            .bind(id)
            .bind(outcome.status().as_str())
            .bind(message)
            .bind(path)
            .bind(size)
            .bind(finished_at)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => execution_from_row(&row),
            None => match self.fetch_execution(id).await? {
                Some(_) => Err(EngineError::ExecutionAlreadyFinished(id)),
                None => Err(EngineError::NotFound(format!("execution {id}"))),
            },
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.fetch_execution(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {id}")))
    }

    async fn list_expired_executions(
        &self,
        backup_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE backup_id = $1 AND status <> 'running' AND finished_at < $2 \
             ORDER BY finished_at"
        );
        let rows = sqlx::query(&sql)
            .bind(backup_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn delete_execution(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM executions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn definition_from_row(row: &PgRow) -> Result<BackupDefinition> {
    let is_local: bool = row.try_get("is_local")?;
    let destination_id: Option<Uuid> = row.try_get("destination_id")?;
    let target = match (is_local, destination_id) {
        (true, _) => BackupTarget::Local,
        (false, Some(id)) => BackupTarget::Destination(id),
        (false, None) => {
            let id: Uuid = row.try_get("id")?;
            return Err(EngineError::InvalidConfig(format!(
                "backup {id} is not local but has no destination"
            )));
        }
    };

    let zip_password: Option<String> = row.try_get("zip_password")?;
    Ok(BackupDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        database: DatabaseTarget {
            id: row.try_get("database_id")?,
            name: row.try_get("database_name")?,
            pg_version: row.try_get("pg_version")?,
            connection_string: Secret::new(row.try_get::<String, _>("connection_string")?),
        },
        all_databases: row.try_get("all_databases")?,
        target,
        cron_expression: row.try_get("cron_expression")?,
        time_zone: row.try_get("time_zone")?,
        is_active: row.try_get("is_active")?,
        dest_dir: row.try_get("dest_dir")?,
        retention_days: row.try_get("retention_days")?,
        options: DumpOptions {
            data_only: row.try_get("opt_data_only")?,
            schema_only: row.try_get("opt_schema_only")?,
            clean: row.try_get("opt_clean")?,
            if_exists: row.try_get("opt_if_exists")?,
            create: row.try_get("opt_create")?,
            no_comments: row.try_get("opt_no_comments")?,
        },
        archive_password: zip_password.filter(|pw| !pw.is_empty()).map(Secret::new),
    })
}

fn destination_from_row(row: &PgRow) -> Result<DestinationTarget> {
    let provider: String = row.try_get("provider")?;
    let provider = match provider.as_str() {
        "aws" | "s3" => ObjectProvider::Aws,
        "minio" => ObjectProvider::Minio,
        other => {
            return Err(EngineError::InvalidConfig(format!(
                "unknown storage provider {other:?}"
            )));
        }
    };
    Ok(DestinationTarget {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider,
        bucket: row.try_get("bucket_name")?,
        region: row.try_get("region")?,
        endpoint: row.try_get("endpoint")?,
        access_key: Secret::new(row.try_get::<String, _>("access_key")?),
        secret_key: Secret::new(row.try_get::<String, _>("secret_key")?),
        force_path_style: row.try_get("force_path_style")?,
        signing: None,
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution> {
    let status: String = row.try_get("status")?;
    let file_size: Option<i64> = row.try_get("file_size")?;
    Ok(Execution {
        id: row.try_get("id")?,
        backup_id: row.try_get("backup_id")?,
        status: ExecutionStatus::parse(&status)?,
        message: row.try_get("message")?,
        path: row.try_get("path")?,
        file_size: file_size.and_then(|size| u64::try_from(size).ok()),
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn size_to_column(size: u64) -> Result<i64> {
    i64::try_from(size)
        .map_err(|_| EngineError::Persistence(format!("archive size {size} does not fit BIGINT")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_beyond_bigint_are_rejected() {
        assert_eq!(size_to_column(1024).ok(), Some(1024));
        assert!(matches!(
            size_to_column(u64::MAX),
            Err(EngineError::Persistence(_))
        ));
    }

    #[tokio::test]
    #[ignore = "needs PGBACKUP_TEST_PG_URL pointing at a migrated metadata database"]
    async fn finishing_twice_is_detected() -> anyhow::Result<()> {
        let url = std::env::var("PGBACKUP_TEST_PG_URL")?;
        let key = std::env::var("PGBACKUP_ENCRYPTION_KEY").unwrap_or_default();
        let repo = PgRepository::connect(&url, Secret::new(key)).await?;
        let backup_id: Uuid = std::env::var("PGBACKUP_TEST_BACKUP_ID")?.parse()?;

        let execution = repo.create_execution(backup_id, Utc::now()).await?;
        let outcome = ExecutionOutcome::Failed {
            message: "integration test".to_string(),
        };
        repo.finish_execution(execution.id, &outcome, Utc::now()).await?;
        let again = repo.finish_execution(execution.id, &outcome, Utc::now()).await;
        assert!(matches!(again, Err(EngineError::ExecutionAlreadyFinished(_))));
        repo.delete_execution(execution.id).await?;
        Ok(())
    }
}
