//! Where archives are stored: a directory on local disk or an S3-compatible
//! bucket, behind one transport trait.

pub mod local;
pub mod s3;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{EngineError, Result};
use crate::pg::ByteReader;
use crate::store::{BackupTarget, DestinationTarget, Repository};
pub use local::LocalTransport;
pub use s3::S3Transport;

/// How a stored archive can be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadLink {
    /// Time-limited presigned URL.
    Url(String),
    /// Direct filesystem path. Never expires.
    Path(PathBuf),
}

#[async_trait]
pub trait StorageTransport: Send + Sync {
    /// Human readable location, safe to log.
    fn describe(&self) -> String;

    async fn test(&self) -> Result<()>;

    /// Streams `body` to `key` and returns the number of bytes stored.
    async fn upload(&self, key: &str, body: ByteReader) -> Result<u64>;

    /// Removes `key`. Removing a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn download_link(&self, key: &str, ttl: Duration) -> Result<DownloadLink>;
}

/// Object keys never start with a separator.
pub fn normalize_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// Builds transports for backup targets. Destinations are read from the
/// repository on every call so rotated credentials apply to the next run.
#[derive(Clone)]
pub struct StorageResolver {
    repo: Arc<dyn Repository>,
    local_root: PathBuf,
}

impl StorageResolver {
    pub fn new(repo: Arc<dyn Repository>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            local_root: local_root.into(),
        }
    }

    pub async fn for_target(&self, target: BackupTarget) -> Result<Box<dyn StorageTransport>> {
        match target {
            BackupTarget::Local => Ok(Box::new(LocalTransport::new(&self.local_root))),
            BackupTarget::Destination(id) => {
                let destination = self.repo.get_destination(id).await?;
                self.for_destination(&destination).await
            }
        }
    }

    pub async fn for_destination(
        &self,
        destination: &DestinationTarget,
    ) -> Result<Box<dyn StorageTransport>> {
        Ok(Box::new(S3Transport::connect(destination).await?))
    }
}

pub(crate) fn invalid_key(key: &str) -> EngineError {
    EngineError::InvalidConfig(format!("invalid storage key {key:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_separators_are_stripped() {
        assert_eq!(normalize_key("/nightly/dump.zip"), "nightly/dump.zip");
        assert_eq!(normalize_key("//a/b.zip"), "a/b.zip");
        assert_eq!(normalize_key("a/b.zip"), "a/b.zip");
    }
}
