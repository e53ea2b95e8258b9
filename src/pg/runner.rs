// pgbackup/src/pg/runner.rs
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ByteReader, DumpOptions, PgToolchain, PgTools, PgVersion};
use crate::errors::{ConnectivityKind, EngineError, Result};
use crate::utils::{connection, diagnostics};

const LIST_DATABASES_SQL: &str = "SELECT datname FROM pg_database \
     WHERE datistemplate = false AND datallowconn = true ORDER BY datname;";

/// Runs the real PostgreSQL client binaries.
#[derive(Debug, Clone)]
pub struct PgRunner {
    bin_root: PathBuf,
}

impl PgRunner {
    pub fn new(bin_root: impl Into<PathBuf>) -> Self {
        Self {
            bin_root: bin_root.into(),
        }
    }

    fn toolchain(&self, version: PgVersion) -> PgToolchain {
        PgToolchain::locate(version, &self.bin_root)
    }
}

#[async_trait]
impl PgTools for PgRunner {
    fn check_installed(&self, version: PgVersion) -> Result<()> {
        PgToolchain::resolve(version, &self.bin_root).map(|_| ())
    }

    async fn test(&self, version: PgVersion, conn: &str) -> Result<()> {
        let tools = self.toolchain(version);
        let output = Command::new(&tools.psql)
            .arg(conn)
            .args(["-c", "SELECT 1;"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&tools.psql, e))?;

        if !output.status.success() {
            return Err(EngineError::Connectivity {
                target: connection::describe(conn),
                kind: ConnectivityKind::Other,
                message: diagnostics::for_record(&combined(&output.stdout, &output.stderr)),
            });
        }
        debug!(target = %connection::describe(conn), %version, "database connection test passed");
        Ok(())
    }

    async fn list_databases(&self, version: PgVersion, conn: &str) -> Result<Vec<String>> {
        let tools = self.toolchain(version);
        let output = Command::new(&tools.psql)
            .arg(conn)
            .args(["-At", "-c", LIST_DATABASES_SQL])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&tools.psql, e))?;

        if !output.status.success() {
            return Err(process_failure(
                &tools.psql,
                output.status,
                &combined(&output.stdout, &output.stderr),
            ));
        }

        let databases = parse_database_list(&String::from_utf8_lossy(&output.stdout));
        info!(count = databases.len(), "found databases to back up");
        Ok(databases)
    }

    fn dump(&self, version: PgVersion, conn: &str, options: &DumpOptions) -> Result<ByteReader> {
        let tools = self.toolchain(version);
        let mut child = Command::new(&tools.pg_dump)
            .arg(conn)
            .args(options.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&tools.pg_dump, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Storage("pg_dump stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Storage("pg_dump stderr was not captured".to_string()))?;

        debug!(target = %connection::describe(conn), %version, "started pg_dump");
        Ok(dump_reader(DumpState::Streaming {
            child,
            stdout: ReaderStream::new(stdout),
            stderr: drain(stderr),
            program: tools.pg_dump,
        }))
    }

    async fn restore(
        &self,
        version: PgVersion,
        conn: &str,
        sql_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tools = self.toolchain(version);
        let child = Command::new(&tools.psql)
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-d"])
            .arg(conn)
            .arg("-f")
            .arg(sql_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&tools.psql, e))?;

        info!(target = %connection::describe(conn), %version, "replaying SQL with psql");
        // Dropping the wait future drops the child, which kills psql.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        if !output.status.success() {
            return Err(process_failure(
                &tools.psql,
                output.status,
                &combined(&output.stdout, &output.stderr),
            ));
        }
        Ok(())
    }
}

enum DumpState {
    Streaming {
        child: Child,
        stdout: ReaderStream<ChildStdout>,
        stderr: JoinHandle<String>,
        program: PathBuf,
    },
    Finished,
}

/// Turns a running pg_dump into a reader. After stdout hits EOF the exit
/// status is checked, so a failed dump surfaces as a read error rather than
/// a silently truncated stream.
fn dump_reader(state: DumpState) -> ByteReader {
    let chunks = stream::unfold(state, |state| async move {
        let DumpState::Streaming {
            mut child,
            mut stdout,
            stderr,
            program,
        } = state
        else {
            return None;
        };

        match stdout.next().await {
            Some(Ok(chunk)) => Some((
                Ok(chunk),
                DumpState::Streaming {
                    child,
                    stdout,
                    stderr,
                    program,
                },
            )),
            Some(Err(err)) => Some((Err(err), DumpState::Finished)),
            None => {
                let status = match child.wait().await {
                    Ok(status) => status,
                    Err(err) => return Some((Err(err), DumpState::Finished)),
                };
                if status.success() {
                    return None;
                }
                let diagnostics = stderr.await.unwrap_or_default();
                let err = process_failure(&program, status, &diagnostics);
                Some((Err(err.into_io()), DumpState::Finished))
            }
        }
    });
    Box::pin(StreamReader::new(chunks.boxed()))
}

fn drain<R>(mut pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn combined(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stderr).into_owned();
    let out = String::from_utf8_lossy(stdout);
    if !out.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&out);
    }
    text
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

fn process_failure(program: &Path, status: ExitStatus, diagnostics: &str) -> EngineError {
    EngineError::ProcessFailure {
        program: program_name(program),
        status: status.to_string(),
        diagnostics: diagnostics::for_record(diagnostics),
    }
}

fn spawn_error(program: &Path, err: std::io::Error) -> EngineError {
    EngineError::InvalidConfig(format!("failed to start {}: {err}", program.display()))
}

pub(crate) fn parse_database_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
