//! PostgreSQL client tooling: version allow-list and the external
//! `pg_dump` / `psql` processes the pipelines drive.

pub mod options;
pub mod runner;
pub mod version;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
pub use options::DumpOptions;
pub use runner::PgRunner;
pub use version::{PgToolchain, PgVersion};

/// A lazily produced, non-restartable byte stream.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Operations the pipelines need from the PostgreSQL client tools.
#[async_trait]
pub trait PgTools: Send + Sync {
    /// Fails unless the client binaries for `version` are installed.
    fn check_installed(&self, version: PgVersion) -> Result<()>;

    /// Runs a trivial query against `conn`.
    async fn test(&self, version: PgVersion, conn: &str) -> Result<()>;

    /// Non-template databases reachable through `conn`, in name order.
    async fn list_databases(&self, version: PgVersion, conn: &str) -> Result<Vec<String>>;

    /// Starts `pg_dump` and returns its stdout. The stream yields an error
    /// instead of a clean EOF when the process exits non-zero.
    fn dump(&self, version: PgVersion, conn: &str, options: &DumpOptions) -> Result<ByteReader>;

    /// Replays `sql_file` into `conn`, stopping at the first SQL error.
    async fn restore(
        &self,
        version: PgVersion,
        conn: &str,
        sql_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
