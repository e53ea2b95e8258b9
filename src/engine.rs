// pgbackup/src/engine.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::run_dump_pipeline;
use crate::errors::{EngineError, Result};
use crate::executions::{ExecutionTracker, RetentionEnforcer};
use crate::notify::Notifier;
use crate::pg::{PgTools, PgVersion};
use crate::restore::{ArchiveLocation, RestoreRequest, run_restore_pipeline};
use crate::storage::{DownloadLink, StorageResolver};
use crate::store::{DestinationTarget, Execution, ExecutionOutcome, ExecutionStatus, Repository};
use crate::utils::locks::{InFlight, RecordLocks};
use crate::utils::secret::Secret;

/// Lifetime of the presigned URL a restore uses to fetch its archive.
const RESTORE_LINK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub local_backups_dir: PathBuf,
    /// Parent for scratch directories; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            local_backups_dir: PathBuf::from("./backups"),
            scratch_dir: None,
        }
    }
}

/// Archive a restore reads from.
#[derive(Debug, Clone)]
pub enum RestoreSource {
    /// The archive of a successful execution.
    Execution(Uuid),
    /// A filesystem path or an http(s) URL.
    Archive(String),
}

#[derive(Debug, Clone)]
pub struct RestoreParams {
    pub source: RestoreSource,
    pub connection_string: Secret,
    /// Required for `Archive` sources; defaults to the backup's database
    /// version for `Execution` sources.
    pub version: Option<String>,
    /// Falls back to the backup's archive password for `Execution` sources.
    pub password: Option<Secret>,
    pub entry: Option<String>,
}

/// A backup run that has an open execution record.
#[derive(Debug)]
pub struct StartedBackup {
    pub execution_id: Uuid,
    handle: JoinHandle<Result<Execution>>,
}

impl StartedBackup {
    /// Waits for the run and returns the finalised record.
    pub async fn wait(self) -> Result<Execution> {
        self.handle.await?
    }
}

/// Runs backups, restores and link requests against the configured
/// repository, client tools and storage.
pub struct Engine {
    repo: Arc<dyn Repository>,
    tools: Arc<dyn PgTools>,
    notifier: Arc<dyn Notifier>,
    storage: StorageResolver,
    tracker: ExecutionTracker,
    in_flight: Arc<InFlight>,
    record_locks: Arc<RecordLocks>,
    settings: EngineSettings,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn Repository>,
        tools: Arc<dyn PgTools>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage: StorageResolver::new(Arc::clone(&repo), settings.local_backups_dir.clone()),
            tracker: ExecutionTracker::new(Arc::clone(&repo)),
            repo,
            tools,
            notifier,
            in_flight: InFlight::new(),
            record_locks: RecordLocks::new(),
            settings,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Token cancelled by [`Engine::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn is_running(&self, backup_id: Uuid) -> bool {
        self.in_flight.is_active(backup_id)
    }

    pub fn retention_enforcer(&self) -> RetentionEnforcer {
        RetentionEnforcer::new(
            Arc::clone(&self.repo),
            self.storage.clone(),
            Arc::clone(&self.record_locks),
        )
    }

    /// Opens an execution and starts the dump pipeline in the background.
    /// Scheduled fires and manual triggers both come through here, so both
    /// are subject to the one-run-per-definition rule.
    ///
    /// Errors returned here mean nothing ran and no record exists. Failures
    /// after the record is opened land on the record instead.
    pub async fn start_backup(&self, backup_id: Uuid) -> Result<StartedBackup> {
        let guard = self
            .in_flight
            .try_acquire(backup_id)
            .ok_or(EngineError::OverlapSkipped(backup_id))?;

        let definition = self.repo.get_backup_definition(backup_id).await?;
        definition.validate()?;
        let version = PgVersion::parse(&definition.database.pg_version)?;
        self.tools.check_installed(version)?;
        let transport = self.storage.for_target(definition.target).await?;

        let running = self.tracker.begin(backup_id).await?;
        let execution_id = running.execution_id();
        info!(%backup_id, %execution_id, backup = %definition.name, "backup started");

        let cancel = self.shutdown.child_token();
        let tools = Arc::clone(&self.tools);
        let tracker = self.tracker.clone();
        let notifier = Arc::clone(&self.notifier);
        let scratch = self.settings.scratch_dir.clone();

        // The pipeline watches `cancel` itself so that a cancelled upload
        // still removes its partial archive or aborts its multipart upload.
        let handle = self.tasks.spawn(async move {
            let _guard = guard;
            let result = run_dump_pipeline(
                tools,
                &definition,
                version,
                transport.as_ref(),
                scratch.as_deref(),
                Utc::now(),
                cancel,
            )
            .await;

            let outcome = match result {
                Ok(artifact) => ExecutionOutcome::Succeeded {
                    path: artifact.key,
                    size: artifact.size,
                },
                Err(err) => {
                    error!(%backup_id, %execution_id, error = %err, "backup failed");
                    ExecutionOutcome::Failed {
                        message: err.to_string(),
                    }
                }
            };
            let status = match &outcome {
                ExecutionOutcome::Succeeded { .. } => ExecutionStatus::Succeeded,
                ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
            };
            match tracker.finish(running, outcome).await {
                Ok((execution, event)) => {
                    notifier.execution_finished(&event).await;
                    Ok(execution)
                }
                Err(err) => {
                    error!(
                        %backup_id,
                        %execution_id,
                        outcome = %status,
                        error = %err,
                        "could not record the end of a backup; execution left running"
                    );
                    Err(err)
                }
            }
        });

        Ok(StartedBackup {
            execution_id,
            handle,
        })
    }

    /// Connectivity check for unsaved credentials.
    pub async fn test_destination(&self, destination: &DestinationTarget) -> Result<()> {
        self.storage.for_destination(destination).await?.test().await
    }

    pub async fn test_destination_by_id(&self, destination_id: Uuid) -> Result<()> {
        let destination = self.repo.get_destination(destination_id).await?;
        self.test_destination(&destination).await
    }

    pub async fn test_database(&self, version: &str, connection_string: &Secret) -> Result<()> {
        let version = PgVersion::parse(version)?;
        self.tools.check_installed(version)?;
        self.tools.test(version, connection_string.expose()).await
    }

    /// Restores an archive into `params.connection_string`. Destructive; see
    /// [`RestoreRequest`].
    pub async fn run_restore(&self, params: RestoreParams) -> Result<()> {
        let cancel = self.shutdown.child_token();
        let scratch_root = self.settings.scratch_dir.as_deref();
        let entry = params.entry.as_deref();

        match &params.source {
            RestoreSource::Archive(location) => {
                let version = params.version.as_deref().ok_or_else(|| {
                    EngineError::InvalidConfig("restoring an archive requires a version".to_string())
                })?;
                let version = PgVersion::parse(version)?;
                self.tools.check_installed(version)?;
                let request = RestoreRequest {
                    version,
                    connection_string: &params.connection_string,
                    location: ArchiveLocation::parse(location),
                    password: params.password.as_ref(),
                    entry,
                    scratch_root,
                };
                run_restore_pipeline(self.tools.as_ref(), request, &cancel).await
            }
            RestoreSource::Execution(execution_id) => {
                // Held for the whole restore so retention cannot reap the archive.
                let _lock = self.record_locks.lock(*execution_id).await;
                let (execution, key) = self.archived_execution(*execution_id).await?;
                let definition = self.repo.get_backup_definition(execution.backup_id).await?;

                let version = params
                    .version
                    .as_deref()
                    .unwrap_or(&definition.database.pg_version);
                let version = PgVersion::parse(version)?;
                self.tools.check_installed(version)?;

                let transport = self.storage.for_target(definition.target).await?;
                let link = transport.download_link(&key, RESTORE_LINK_TTL).await?;
                let password = params.password.as_ref().or(definition.password());
                let request = RestoreRequest {
                    version,
                    connection_string: &params.connection_string,
                    location: link.into(),
                    password,
                    entry,
                    scratch_root,
                };
                run_restore_pipeline(self.tools.as_ref(), request, &cancel).await
            }
        }
    }

    /// Presigned URL (object storage) or path (local) of an execution's
    /// archive.
    pub async fn get_download_link(&self, execution_id: Uuid, ttl: Duration) -> Result<DownloadLink> {
        let _lock = self.record_locks.lock(execution_id).await;
        let (execution, key) = self.archived_execution(execution_id).await?;
        let definition = self.repo.get_backup_definition(execution.backup_id).await?;
        let transport = self.storage.for_target(definition.target).await?;
        transport.download_link(&key, ttl).await
    }

    async fn archived_execution(&self, execution_id: Uuid) -> Result<(Execution, String)> {
        let execution = self.repo.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Succeeded {
            return Err(EngineError::NotFound(format!(
                "archive of execution {execution_id} ({})",
                execution.status
            )));
        }
        let key = execution
            .path
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("archive of execution {execution_id}")))?;
        Ok((execution, key))
    }

    /// Cancels every running pipeline and waits until their records are
    /// finalised.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(Duration::from_secs(30), self.tasks.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for running backups to stop");
        }
    }
}
