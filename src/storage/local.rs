// pgbackup/src/storage/local.rs
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DownloadLink, StorageTransport, invalid_key, normalize_key};
use crate::errors::{ConnectivityKind, EngineError, Result};
use crate::pg::ByteReader;

/// Archives kept under a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = normalize_key(key);
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !clean {
            return Err(invalid_key(key));
        }
        Ok(self.root.join(relative))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[async_trait]
impl StorageTransport for LocalTransport {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn test(&self) -> Result<()> {
        let unreachable = |err: std::io::Error| EngineError::Connectivity {
            target: self.describe(),
            kind: ConnectivityKind::Other,
            message: format!("directory is not writable: {err}"),
        };
        fs::create_dir_all(&self.root).await.map_err(unreachable)?;
        let marker = self
            .root
            .join(format!(".pgbackup-write-test-{}", Uuid::new_v4()));
        fs::write(&marker, b"ok").await.map_err(unreachable)?;
        fs::remove_file(&marker).await.map_err(unreachable)?;
        debug!(root = %self.root.display(), "local backup directory is writable");
        Ok(())
    }

    async fn upload(&self, key: &str, mut body: ByteReader) -> Result<u64> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);

        let written = async {
            let mut file = fs::File::create(&partial).await?;
            let size = tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(size)
        }
        .await;

        match written {
            Ok(size) => {
                fs::rename(&partial, &target).await?;
                info!(path = %target.display(), bytes = size, "stored archive on local disk");
                Ok(size)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), error = %cleanup, "could not remove partial archive");
                }
                Err(EngineError::from(err))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let target = self.resolve(key)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %target.display(), "archive already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn download_link(&self, key: &str, _ttl: Duration) -> Result<DownloadLink> {
        let target = self.resolve(key)?;
        if !fs::try_exists(&target).await? {
            return Err(EngineError::NotFound(format!("archive {}", target.display())));
        }
        Ok(DownloadLink::Path(target))
    }
}
