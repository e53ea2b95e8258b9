pub(crate) mod archive;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::pg::{PgTools, PgVersion};
use crate::schedule::parse_time_zone;
use crate::storage::StorageTransport;
use crate::store::BackupDefinition;
use crate::utils::connection;
use archive::ArchiveEntry;

/// A stored archive produced by one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub key: String,
    pub size: u64,
}

/// `dump-<YYYYMMDD-HHMMSS>-<uuid>.zip`, stamped in the definition's zone.
pub fn archive_name(local: &DateTime<Tz>) -> String {
    format!(
        "dump-{}-{}.zip",
        local.format("%Y%m%d-%H%M%S"),
        Uuid::new_v4()
    )
}

/// `<dest_dir>/<YYYY>/<MM>/<DD>/<archive name>` without a leading separator.
pub fn archive_key(dest_dir: &str, tz: Tz, now: DateTime<Utc>) -> String {
    let local = now.with_timezone(&tz);
    let dir = dest_dir.trim_matches('/');
    let dated = local.format("%Y/%m/%d");
    let name = archive_name(&local);
    if dir.is_empty() {
        format!("{dated}/{name}")
    } else {
        format!("{dir}/{dated}/{name}")
    }
}

/// Dumps the definition's database(s), packages the dumps and uploads the
/// archive. Nothing is buffered whole in memory; the first failing stage
/// fails the run.
///
/// Cancelling `cancel` surfaces as a stream error inside the upload, so the
/// transport cleans up whatever it had written before the run returns
/// [`EngineError::Cancelled`].
pub async fn run_dump_pipeline(
    tools: Arc<dyn PgTools>,
    definition: &BackupDefinition,
    version: PgVersion,
    transport: &dyn StorageTransport,
    scratch_root: Option<&Path>,
    now: DateTime<Utc>,
    cancel: CancellationToken,
) -> Result<BackupArtifact> {
    let tz = parse_time_zone(&definition.time_zone)?;
    let conn = definition.database.connection_string.expose();
    let options = definition.options;

    let entries = if definition.all_databases {
        let databases = tokio::select! {
            listed = tools.list_databases(version, conn) => listed?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        if databases.is_empty() {
            return Err(EngineError::EmptySourceSet);
        }
        info!(
            backup_id = %definition.id,
            databases = databases.len(),
            "backing up all databases"
        );
        databases
            .iter()
            .map(|database| {
                let db_conn = connection::with_database(conn, database)?;
                let tools = Arc::clone(&tools);
                Ok(ArchiveEntry::for_database(database, move || {
                    tools.dump(version, &db_conn, &options)
                }))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let tools = Arc::clone(&tools);
        let conn = conn.to_string();
        vec![ArchiveEntry::single(move || {
            tools.dump(version, &conn, &options)
        })]
    };

    let archive = archive::package(
        entries,
        definition.password().cloned(),
        scratch_root.map(Path::to_path_buf),
        cancel,
    )?;

    let key = archive_key(&definition.dest_dir, tz, now);
    let size = transport.upload(&key, archive).await?;
    info!(
        backup_id = %definition.id,
        target = %transport.describe(),
        key = %key,
        bytes = size,
        "backup archive stored"
    );
    Ok(BackupArtifact { key, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalTransport;
    use crate::test_support::{FakeTools, definition, files_under};
    use chrono::TimeZone;
    use std::io::Cursor;
    use zip::ZipArchive;

    fn entry_names(path: &Path) -> anyhow::Result<Vec<String>> {
        let archive = ZipArchive::new(Cursor::new(std::fs::read(path)?))?;
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        Ok(names)
    }

    #[test]
    fn key_uses_the_definition_zone_for_the_date() -> anyhow::Result<()> {
        // 23:30 UTC on the 1st is already the 2nd in Tokyo.
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap();
        let key = archive_key("/nightly/", parse_time_zone("Asia/Tokyo")?, now);
        assert!(key.starts_with("nightly/2024/03/02/dump-20240302-083000-"), "{key}");
        assert!(key.ends_with(".zip"));

        let bare = archive_key("", Tz::UTC, now);
        assert!(bare.starts_with("2024/03/01/dump-20240301-233000-"), "{bare}");
        Ok(())
    }

    #[tokio::test]
    async fn single_database_archive_holds_dump_sql() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let transport = LocalTransport::new(root.path());
        let tools = FakeTools::new().with_database("app", "CREATE TABLE app();");
        let def = definition(false);

        let artifact = run_dump_pipeline(
            tools.clone(),
            &def,
            PgVersion::Pg16,
            &transport,
            None,
            Utc::now(),
            CancellationToken::new(),
        )
        .await?;
        let stored = root.path().join(&artifact.key);
        assert_eq!(std::fs::metadata(&stored)?.len(), artifact.size);
        assert_eq!(entry_names(&stored)?, vec!["dump.sql"]);
        Ok(())
    }

    #[tokio::test]
    async fn all_databases_mode_lists_live_and_writes_one_entry_each() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let transport = LocalTransport::new(root.path());
        let tools = FakeTools::new()
            .with_database("a", "CREATE TABLE a();")
            .with_database("b", "CREATE TABLE b();");
        let def = definition(true);

        let artifact = run_dump_pipeline(
            tools.clone(),
            &def,
            PgVersion::Pg16,
            &transport,
            None,
            Utc::now(),
            CancellationToken::new(),
        )
        .await?;
        assert_eq!(entry_names(&root.path().join(&artifact.key))?, vec!["a.sql", "b.sql"]);
        assert_eq!(tools.dumped(), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_server_fails_without_an_archive() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let transport = LocalTransport::new(root.path());
        let tools = FakeTools::new();

        let err = run_dump_pipeline(
            tools,
            &definition(true),
            PgVersion::Pg16,
            &transport,
            None,
            Utc::now(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::EmptySourceSet));
        assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failing_dump_fails_the_upload() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let transport = LocalTransport::new(root.path());
        let tools = FakeTools::new()
            .with_database("app", "CREATE TABLE app();")
            .failing_dumps();

        let err = run_dump_pipeline(
            tools,
            &definition(false),
            PgVersion::Pg16,
            &transport,
            None,
            Utc::now(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::ProcessFailure { .. }), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_run_leaves_no_partial_archive() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let transport = LocalTransport::new(root.path());
        let tools = FakeTools::new()
            .with_database("app", "CREATE TABLE app();")
            .gated();
        let def = definition(false);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_dump_pipeline(
            tools,
            &def,
            PgVersion::Pg16,
            &transport,
            None,
            Utc::now(),
            cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled), "{err:?}");

        let left = files_under(root.path())?;
        assert!(left.is_empty(), "{left:?}");
        Ok(())
    }
}
