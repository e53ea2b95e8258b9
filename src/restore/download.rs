// pgbackup/src/restore/download.rs
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::info;

use crate::errors::{ConnectivityKind, EngineError, Result};
use crate::storage::DownloadLink;
use crate::utils::diagnostics::strip_query;

/// Where a restore reads its archive from.
#[derive(Clone, PartialEq, Eq)]
pub enum ArchiveLocation {
    Path(PathBuf),
    Url(String),
}

impl ArchiveLocation {
    /// `http(s)://` values are URLs, anything else a filesystem path.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            ArchiveLocation::Url(trimmed.to_string())
        } else {
            ArchiveLocation::Path(PathBuf::from(trimmed))
        }
    }
}

impl From<DownloadLink> for ArchiveLocation {
    fn from(link: DownloadLink) -> Self {
        match link {
            DownloadLink::Url(url) => ArchiveLocation::Url(url),
            DownloadLink::Path(path) => ArchiveLocation::Path(path),
        }
    }
}

// Presigned URLs carry their signature in the query string.
impl fmt::Debug for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveLocation::Path(path) => write!(f, "Path({})", path.display()),
            ArchiveLocation::Url(url) => write!(f, "Url({})", strip_query(url)),
        }
    }
}

/// Copies or downloads the archive to `destination`. Returns its size.
pub async fn acquire(location: &ArchiveLocation, destination: &Path) -> Result<u64> {
    match location {
        ArchiveLocation::Path(source) => copy_local(source, destination).await,
        ArchiveLocation::Url(url) => download(url, destination).await,
    }
}

async fn copy_local(source: &Path, destination: &Path) -> Result<u64> {
    let size = tokio::fs::copy(source, destination)
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => EngineError::NotFound(format!("archive {}", source.display())),
            _ => EngineError::from(err),
        })?;
    info!(source = %source.display(), bytes = size, "copied archive into restore workspace");
    Ok(size)
}

async fn download(url: &str, destination: &Path) -> Result<u64> {
    let target = strip_query(url).to_string();
    let response = reqwest::get(url)
        .await
        .map_err(|err| EngineError::Connectivity {
            target: target.clone(),
            kind: ConnectivityKind::Unreachable,
            message: err.without_url().to_string(),
        })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(EngineError::NotFound(format!("archive at {target}")));
    }
    if !status.is_success() {
        let kind = match status.as_u16() {
            401 | 403 => ConnectivityKind::CredentialsRejected,
            _ => ConnectivityKind::Other,
        };
        return Err(EngineError::Connectivity {
            target,
            kind,
            message: format!("download returned HTTP {status}"),
        });
    }

    let body = response
        .bytes_stream()
        .map_err(|err| std::io::Error::other(err.without_url()));
    let mut reader = StreamReader::new(body);
    let mut file = File::create(destination).await?;
    let size = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    info!(source = %target, bytes = size, "downloaded archive into restore workspace");
    Ok(size)
}
