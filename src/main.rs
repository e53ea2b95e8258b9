//! PostgreSQL backup/restore engine
//!
//! Runs scheduled pg_dump backups into zip archives on local disk or S3
//! compatible storage, restores them, and prunes expired archives.

// pgbackup/src/main.rs
mod backup;
mod config;
mod engine;
mod errors;
mod executions;
mod notify;
mod pg;
mod restore;
mod schedule;
mod storage;
mod store;
mod utils;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use config::AppConfig;
use engine::{Engine, EngineSettings, RestoreParams, RestoreSource};
use notify::LogNotifier;
use pg::PgRunner;
use schedule::Scheduler;
use storage::DownloadLink;
use store::ExecutionStatus;
use utils::secret::Secret;

/// How often `serve` re-reads backup definitions.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "pgbackup", version, about = "PostgreSQL backup and restore engine")]
struct Cli {
    /// Path to config.json
    #[arg(long, env = "PGBACKUP_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and the retention loop until Ctrl-C
    Serve,
    /// Run one backup now and wait for it
    Backup { backup_id: Uuid },
    /// Restore an archive into a database. Statements applied before a
    /// failure are not rolled back.
    Restore {
        /// Archive of a successful execution
        #[arg(long, conflicts_with = "archive", required_unless_present = "archive")]
        execution: Option<Uuid>,
        /// Local path or http(s) URL of an archive
        #[arg(long)]
        archive: Option<String>,
        /// PostgreSQL major version of the target server
        #[arg(long)]
        version: Option<String>,
        /// Target connection string
        #[arg(long, env = "PGBACKUP_RESTORE_CONN", hide_env_values = true)]
        conn: String,
        /// Archive password
        #[arg(long, env = "PGBACKUP_ARCHIVE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Entry to restore, e.g. `app.sql` from an all-databases archive
        #[arg(long)]
        entry: Option<String>,
    },
    /// Check that a stored destination is reachable and writable
    TestDestination { destination_id: Uuid },
    /// Check that a database accepts connections
    TestDatabase {
        #[arg(long)]
        version: String,
        #[arg(long, env = "PGBACKUP_TEST_CONN", hide_env_values = true)]
        conn: String,
    },
    /// Print a download link for an execution's archive
    DownloadLink {
        execution_id: Uuid,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
    /// Run one retention pass
    Prune,
}

/// Main entry point for the backup/restore engine
#[tokio::main]
async fn main() -> ExitCode {
    match run_app(Cli::parse()).await {
        Ok(_) => {
            eprintln!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;
    init_tracing(&config.log_filter, cli.json);
    for warning in &config.warnings {
        warn!("{warning}");
    }

    let repo = config.build_repository().await?;
    let engine = Engine::new(
        repo,
        Arc::new(PgRunner::new(&config.pg_bin_root)),
        Arc::new(LogNotifier),
        EngineSettings {
            local_backups_dir: config.local_backups_dir.clone(),
            scratch_dir: config.scratch_dir.clone(),
        },
    );

    match cli.command {
        Command::Serve => serve(engine, &config).await?,
        Command::Backup { backup_id } => {
            let execution = engine
                .start_backup(backup_id)
                .await
                .context("Backup could not start")?
                .wait()
                .await?;
            if execution.status != ExecutionStatus::Succeeded {
                bail!(
                    "Backup failed: {}",
                    execution.message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            info!(
                execution_id = %execution.id,
                key = execution.path.as_deref().unwrap_or_default(),
                bytes = execution.file_size.unwrap_or_default(),
                "backup finished"
            );
        }
        Command::Restore {
            execution,
            archive,
            version,
            conn,
            password,
            entry,
        } => {
            let source = match (execution, archive) {
                (Some(id), _) => RestoreSource::Execution(id),
                (None, Some(archive)) => RestoreSource::Archive(archive),
                (None, None) => bail!("either --execution or --archive is required"),
            };
            engine
                .run_restore(RestoreParams {
                    source,
                    connection_string: Secret::new(conn),
                    version,
                    password: password.map(Secret::new),
                    entry,
                })
                .await
                .context("Restore process failed")?;
        }
        Command::TestDestination { destination_id } => {
            engine
                .test_destination_by_id(destination_id)
                .await
                .context("Destination test failed")?;
            info!(%destination_id, "destination is reachable and writable");
        }
        Command::TestDatabase { version, conn } => {
            engine
                .test_database(&version, &Secret::new(conn))
                .await
                .context("Database test failed")?;
            info!("database accepts connections");
        }
        Command::DownloadLink {
            execution_id,
            ttl_secs,
        } => {
            let link = engine
                .get_download_link(execution_id, Duration::from_secs(ttl_secs))
                .await?;
            match link {
                DownloadLink::Url(url) => println!("{url}"),
                DownloadLink::Path(path) => println!("{}", path.display()),
            }
        }
        Command::Prune => {
            let report = engine.retention_enforcer().run_once(Utc::now()).await?;
            info!(deleted = report.deleted, failed = report.failed, "retention pass finished");
        }
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(engine: Arc<Engine>, config: &AppConfig) -> Result<()> {
    let scheduler = Scheduler::new(Arc::clone(&engine));
    let registered = scheduler.sync_all().await?;
    info!(registered, "scheduler started");

    let retention = Arc::new(engine.retention_enforcer())
        .spawn(config.retention_interval, engine.shutdown_token());

    let mut resync = tokio::time::interval(RESYNC_INTERVAL);
    resync.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = resync.tick() => {
                if let Err(err) = scheduler.sync_all().await {
                    warn!(error = %err, "failed to refresh backup definitions");
                }
            }
        }
    }

    info!("shutting down");
    scheduler.shutdown().await;
    engine.shutdown().await;
    let _ = retention.await;
    Ok(())
}
