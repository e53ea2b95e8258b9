// pgbackup/src/store/ledger.rs
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::models::Execution;
use crate::errors::{EngineError, Result};

/// File name of the ledger inside the local backups directory.
pub const LEDGER_FILE: &str = ".pgbackup-executions.json";

/// Execution records kept in a JSON file so that separate processes over
/// the same inline configuration see each other's runs.
///
/// Every change re-reads the file, applies itself and swaps the file in with
/// a rename, so a reader never observes a half-written ledger.
#[derive(Debug)]
pub struct ExecutionLedger {
    path: PathBuf,
    write: Mutex<()>,
}

impl ExecutionLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current records. A missing file is an empty ledger.
    pub async fn read(&self) -> Result<HashMap<Uuid, Execution>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(self.failure("reading", err)),
        };
        let executions: Vec<Execution> = serde_json::from_slice(&bytes)
            .map_err(|e| self.failure("parsing", e))?;
        Ok(executions.into_iter().map(|e| (e.id, e)).collect())
    }

    /// Applies `change` to the current records and persists the result.
    /// Nothing is written when `change` fails.
    pub async fn update<T>(
        &self,
        change: impl FnOnce(&mut HashMap<Uuid, Execution>) -> Result<T>,
    ) -> Result<T> {
        let _write = self.write.lock().await;
        let mut executions = self.read().await?;
        let out = change(&mut executions)?;

        let mut ordered: Vec<&Execution> = executions.values().collect();
        ordered.sort_by_key(|execution| execution.started_at);
        let json = serde_json::to_vec_pretty(&ordered).map_err(|e| self.failure("encoding", e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.failure("creating the directory of", e))?;
        }
        let tmp = self.path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        fs::write(&tmp, json)
            .await
            .map_err(|e| self.failure("writing", e))?;
        if let Err(err) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.failure("replacing", err));
        }
        debug!(path = %self.path.display(), records = ordered.len(), "execution ledger saved");
        Ok(out)
    }

    fn failure(&self, action: &str, err: impl std::fmt::Display) -> EngineError {
        EngineError::Persistence(format!(
            "{action} execution ledger {}: {err}",
            self.path.display()
        ))
    }
}
