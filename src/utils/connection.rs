// pgbackup/src/utils/connection.rs
use url::Url;

use crate::errors::{EngineError, Result};

/// Returns `conn` pointed at `database`, keeping credentials, host and query
/// parameters. Only URI-style connection strings are supported.
pub fn with_database(conn: &str, database: &str) -> Result<String> {
    let mut parsed = Url::parse(conn).map_err(|e| {
        EngineError::InvalidConfig(format!(
            "connection string must be a postgres:// URI to back up all databases: {e}"
        ))
    })?;
    parsed.set_path(&format!("/{database}"));
    Ok(parsed.to_string())
}

/// Host and database of a connection string, safe to print.
pub fn describe(conn: &str) -> String {
    match Url::parse(conn) {
        Ok(parsed) => format!(
            "{}{}",
            parsed.host_str().unwrap_or("localhost"),
            parsed.path()
        ),
        Err(_) => "<connection>".to_string(),
    }
}
