// pgbackup/src/pg/options.rs
use serde::Deserialize;

use crate::errors::{EngineError, Result};

/// pg_dump switches a backup definition may enable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DumpOptions {
    /// `--data-only`
    pub data_only: bool,
    /// `--schema-only`
    pub schema_only: bool,
    /// `--clean`
    pub clean: bool,
    /// `--if-exists`, only valid together with `clean`
    pub if_exists: bool,
    /// `--create`
    pub create: bool,
    /// `--no-comments`
    pub no_comments: bool,
}

impl DumpOptions {
    /// Rejects combinations pg_dump itself refuses.
    pub fn validate(&self) -> Result<()> {
        if self.if_exists && !self.clean {
            return Err(EngineError::InvalidConfig(
                "if_exists requires clean to be enabled".to_string(),
            ));
        }
        if self.data_only && self.schema_only {
            return Err(EngineError::InvalidConfig(
                "data_only and schema_only cannot be used together".to_string(),
            ));
        }
        if self.clean && self.data_only {
            return Err(EngineError::InvalidConfig(
                "clean and data_only cannot be used together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_args(&self) -> Vec<&'static str> {
        let flags = [
            (self.data_only, "--data-only"),
            (self.schema_only, "--schema-only"),
            (self.clean, "--clean"),
            (self.if_exists, "--if-exists"),
            (self.create, "--create"),
            (self.no_comments, "--no-comments"),
        ];
        flags
            .into_iter()
            .filter_map(|(enabled, flag)| enabled.then_some(flag))
            .collect()
    }
}
