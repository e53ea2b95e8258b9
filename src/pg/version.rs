// pgbackup/src/pg/version.rs
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use which::which;

use crate::errors::{EngineError, Result};

/// PostgreSQL releases the engine will dump and restore.
///
/// Only versions still covered by the PostgreSQL versioning policy are
/// listed; anything else is refused before a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgVersion {
    Pg13,
    Pg14,
    Pg15,
    Pg16,
    Pg17,
}

impl PgVersion {
    pub const ALL: [PgVersion; 5] = [
        PgVersion::Pg13,
        PgVersion::Pg14,
        PgVersion::Pg15,
        PgVersion::Pg16,
        PgVersion::Pg17,
    ];

    pub fn major(self) -> &'static str {
        match self {
            PgVersion::Pg13 => "13",
            PgVersion::Pg14 => "14",
            PgVersion::Pg15 => "15",
            PgVersion::Pg16 => "16",
            PgVersion::Pg17 => "17",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        PgVersion::ALL
            .into_iter()
            .find(|version| version.major() == value)
            .ok_or_else(|| EngineError::UnsupportedEngineVersion(value.to_string()))
    }
}

impl FromStr for PgVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        PgVersion::parse(s)
    }
}

impl fmt::Display for PgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PostgreSQL {}", self.major())
    }
}

/// Client binaries of one PostgreSQL release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgToolchain {
    pub version: PgVersion,
    pub pg_dump: PathBuf,
    pub psql: PathBuf,
}

impl PgToolchain {
    /// Debian-style layout: `<bin_root>/<major>/bin/{pg_dump,psql}`.
    pub fn locate(version: PgVersion, bin_root: &Path) -> Self {
        let bin = bin_root.join(version.major()).join("bin");
        PgToolchain {
            version,
            pg_dump: bin.join("pg_dump"),
            psql: bin.join("psql"),
        }
    }

    /// Like [`PgToolchain::locate`] but fails unless both binaries are executable.
    pub fn resolve(version: PgVersion, bin_root: &Path) -> Result<Self> {
        let toolchain = Self::locate(version, bin_root);
        for binary in [&toolchain.pg_dump, &toolchain.psql] {
            which(binary).map_err(|_| {
                EngineError::InvalidConfig(format!(
                    "{} client tools are not installed: {} is missing or not executable",
                    version,
                    binary.display()
                ))
            })?;
        }
        Ok(toolchain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_allow_listed_versions() -> anyhow::Result<()> {
        for version in PgVersion::ALL {
            assert_eq!(PgVersion::parse(version.major())?, version);
        }
        assert_eq!(" 16 ".parse::<PgVersion>()?, PgVersion::Pg16);
        Ok(())
    }

    #[test]
    fn rejects_unlisted_versions() {
        for value in ["12", "18", "16.2", "", "latest"] {
            let err = PgVersion::parse(value).unwrap_err();
            assert!(
                matches!(err, EngineError::UnsupportedEngineVersion(_)),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn locates_versioned_binaries() {
        let toolchain = PgToolchain::locate(PgVersion::Pg15, Path::new("/usr/lib/postgresql"));
        assert_eq!(
            toolchain.pg_dump,
            PathBuf::from("/usr/lib/postgresql/15/bin/pg_dump")
        );
        assert_eq!(toolchain.psql, PathBuf::from("/usr/lib/postgresql/15/bin/psql"));
    }

    #[test]
    fn resolve_fails_when_binaries_are_missing() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let err = PgToolchain::resolve(PgVersion::Pg17, root.path()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(err.is_start_failure());
        Ok(())
    }
}
