pub(crate) mod download;

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backup::archive::{self, SINGLE_ENTRY_NAME};
use crate::errors::{EngineError, Result};
use crate::pg::{PgTools, PgVersion};
use crate::utils::{connection, scratch_workspace, secret::Secret};
pub use download::ArchiveLocation;

/// Everything one restore needs.
///
/// Restoring is destructive. psql stops at the first failing statement but
/// does not roll back the ones before it, so a failed restore can leave the
/// target partially modified.
#[derive(Debug)]
pub struct RestoreRequest<'a> {
    pub version: PgVersion,
    pub connection_string: &'a Secret,
    pub location: ArchiveLocation,
    pub password: Option<&'a Secret>,
    /// Entry to replay; `dump.sql` unless restoring one database out of an
    /// all-databases archive.
    pub entry: Option<&'a str>,
    pub scratch_root: Option<&'a Path>,
}

/// Fetches the archive into a fresh scratch directory, unpacks the entry and
/// replays it. The scratch directory is removed on every exit path.
pub async fn run_restore_pipeline(
    tools: &dyn PgTools,
    request: RestoreRequest<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    let entry = request.entry.unwrap_or(SINGLE_ENTRY_NAME).to_string();
    if entry.contains('/') || entry.contains('\\') {
        return Err(EngineError::InvalidConfig(format!("invalid archive entry {entry:?}")));
    }

    let workspace = scratch_workspace(request.scratch_root, "pgbackup-restore-")?;
    let archive_path = workspace.path().join("archive.zip");

    tokio::select! {
        acquired = download::acquire(&request.location, &archive_path) => { acquired?; }
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
    }

    let sql_path = {
        let archive_path = archive_path.clone();
        let entry = entry.clone();
        let password = request.password.cloned();
        let dest = workspace.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            archive::extract_entry(&archive_path, &entry, password.as_ref(), &dest)
        })
        .await??
    };

    let conn = request.connection_string.expose();
    info!(
        target = %connection::describe(conn),
        entry = %entry,
        version = %request.version,
        "restoring archive"
    );
    tools
        .restore(request.version, conn, &sql_path, cancel)
        .await?;
    info!(target = %connection::describe(conn), "restore finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{ArchiveEntry, package};
    use crate::pg::ByteReader;
    use crate::test_support::{FakeTools, TEST_CONN};
    use std::io::Cursor;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;

    async fn write_archive(
        dir: &Path,
        entries: Vec<(&'static str, &'static str)>,
        password: Option<Secret>,
    ) -> anyhow::Result<PathBuf> {
        let entries = entries
            .into_iter()
            .map(|(name, sql)| {
                ArchiveEntry::new(name, move || {
                    Ok(Box::pin(Cursor::new(sql.as_bytes())) as ByteReader)
                })
            })
            .collect();
        let mut reader = package(entries, password, None, CancellationToken::new())?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        let path = dir.join("backup.zip");
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    fn request<'a>(
        conn: &'a Secret,
        archive: PathBuf,
        password: Option<&'a Secret>,
        entry: Option<&'a str>,
        scratch: &'a Path,
    ) -> RestoreRequest<'a> {
        RestoreRequest {
            version: PgVersion::Pg16,
            connection_string: conn,
            location: ArchiveLocation::Path(archive),
            password,
            entry,
            scratch_root: Some(scratch),
        }
    }

    #[tokio::test]
    async fn replays_dump_sql_and_cleans_up() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        let password = Secret::new("pw");
        let archive = write_archive(
            dir.path(),
            vec![("dump.sql", "CREATE TABLE t();")],
            Some(password.clone()),
        )
        .await?;
        let tools = FakeTools::new();
        let conn = Secret::new(TEST_CONN);

        run_restore_pipeline(
            tools.as_ref(),
            request(&conn, archive, Some(&password), None, scratch.path()),
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(tools.restored(), vec!["CREATE TABLE t();"]);
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn selects_a_database_entry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        let archive = write_archive(
            dir.path(),
            vec![("a.sql", "CREATE TABLE a();"), ("b.sql", "CREATE TABLE b();")],
            None,
        )
        .await?;
        let tools = FakeTools::new();
        let conn = Secret::new(TEST_CONN);

        run_restore_pipeline(
            tools.as_ref(),
            request(&conn, archive, None, Some("b.sql"), scratch.path()),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(tools.restored(), vec!["CREATE TABLE b();"]);
        Ok(())
    }

    #[tokio::test]
    async fn renamed_entry_never_reaches_psql() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        let archive = write_archive(dir.path(), vec![("backup.sql", "DROP TABLE t;")], None).await?;
        let tools = FakeTools::new();
        let conn = Secret::new(TEST_CONN);

        let err = run_restore_pipeline(
            tools.as_ref(),
            request(&conn, archive, None, None, scratch.path()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::ArchiveFormat(_)));
        assert!(tools.restored().is_empty());
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn mid_script_failure_is_a_process_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        let archive = write_archive(dir.path(), vec![("dump.sql", "SELECT broken;")], None).await?;
        let tools = FakeTools::new().failing_restores();
        let conn = Secret::new(TEST_CONN);

        let err = run_restore_pipeline(
            tools.as_ref(),
            request(&conn, archive, None, None, scratch.path()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::ProcessFailure { .. }));
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_restore() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        let archive = write_archive(dir.path(), vec![("dump.sql", "SELECT 1;")], None).await?;
        let tools = FakeTools::new().gated();
        let conn = Secret::new(TEST_CONN);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_restore_pipeline(
            tools.as_ref(),
            request(&conn, archive, None, None, scratch.path()),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }
}
