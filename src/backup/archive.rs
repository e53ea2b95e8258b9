// pgbackup/src/backup/archive.rs
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::stream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{EngineError, Result};
use crate::pg::ByteReader;
use crate::utils::{scratch_workspace, secret::Secret};

/// Entry name used when a single database is archived.
pub const SINGLE_ENTRY_NAME: &str = "dump.sql";

const CHANNEL_DEPTH: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

type Opener = Box<dyn FnOnce() -> Result<ByteReader> + Send>;

/// One file inside the archive. The source is opened only when the packager
/// reaches it, so dumps run one after another.
pub struct ArchiveEntry {
    name: String,
    open: Opener,
}

impl ArchiveEntry {
    pub fn new<F>(name: impl Into<String>, open: F) -> Self
    where
        F: FnOnce() -> Result<ByteReader> + Send + 'static,
    {
        Self {
            name: name.into(),
            open: Box::new(open),
        }
    }

    pub fn single<F>(open: F) -> Self
    where
        F: FnOnce() -> Result<ByteReader> + Send + 'static,
    {
        Self::new(SINGLE_ENTRY_NAME, open)
    }

    pub fn for_database<F>(database: &str, open: F) -> Self
    where
        F: FnOnce() -> Result<ByteReader> + Send + 'static,
    {
        Self::new(entry_name_for(database), open)
    }
}

pub fn entry_name_for(database: &str) -> String {
    format!("{database}.sql")
}

/// Packages `entries` into a zip archive and returns it as a byte stream.
///
/// Without a password the archive is written straight into the returned
/// stream. With a password it is built in a scratch directory under
/// `scratch_root` first and streamed from there; the directory is removed
/// however the work ends. Cancelling `cancel` stops the work between reads.
pub fn package(
    entries: Vec<ArchiveEntry>,
    password: Option<Secret>,
    scratch_root: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<ByteReader> {
    if entries.is_empty() {
        return Err(EngineError::EmptySourceSet);
    }

    let handle = Handle::current();
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let failure_tx = tx.clone();
        let source = Source {
            handle: &handle,
            cancel: &cancel,
        };
        let result = match password.filter(|pw| !pw.is_empty()) {
            None => write_streaming(entries, &source, tx),
            Some(password) => {
                write_protected(entries, &password, scratch_root.as_deref(), &source, tx)
            }
        };
        if let Err(err) = result {
            debug!(error = %err, "archive packaging stopped");
            let _ = failure_tx.blocking_send(Err(err.into_io()));
        }
    });

    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok(Box::pin(StreamReader::new(chunks)))
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true)
        .unix_permissions(0o644)
}

/// Runtime access for the blocking packager.
struct Source<'a> {
    handle: &'a Handle,
    cancel: &'a CancellationToken,
}

fn write_streaming(
    entries: Vec<ArchiveEntry>,
    source: &Source<'_>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> Result<()> {
    let mut zip = ZipWriter::new_stream(ChannelWriter { tx });
    for entry in entries {
        zip.start_file(entry.name.as_str(), entry_options())
            .map_err(zip_error)?;
        copy_entry(entry, source, &mut zip)?;
    }
    let mut sink = zip.finish().map_err(zip_error)?;
    sink.flush()?;
    Ok(())
}

fn write_protected(
    entries: Vec<ArchiveEntry>,
    password: &Secret,
    scratch_root: Option<&Path>,
    source: &Source<'_>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> Result<()> {
    let workspace = scratch_workspace(scratch_root, "pgbackup-archive-")?;
    let archive_path = workspace.path().join("archive.zip");

    let mut zip = ZipWriter::new(File::create(&archive_path)?);
    for entry in entries {
        let options = entry_options().with_aes_encryption(AesMode::Aes256, password.expose());
        zip.start_file(entry.name.as_str(), options)
            .map_err(zip_error)?;
        copy_entry(entry, source, &mut zip)?;
    }
    zip.finish().map_err(zip_error)?;

    let mut file = File::open(&archive_path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..read])))
            .map_err(|_| EngineError::Cancelled)?;
    }
    Ok(())
}

fn copy_entry<W: Write>(entry: ArchiveEntry, source: &Source<'_>, out: &mut W) -> Result<()> {
    let ArchiveEntry { name, open } = entry;
    let mut reader = {
        // Process spawning needs the runtime context.
        let _guard = source.handle.enter();
        open()?
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        let read = source.handle.block_on(async {
            tokio::select! {
                read = reader.read(&mut buf) => read.map_err(EngineError::from),
                _ = source.cancel.cancelled() => Err(EngineError::Cancelled),
            }
        })?;
        if read == 0 {
            break;
        }
        out.write_all(&buf[..read])?;
        copied += read as u64;
    }
    debug!(entry = %name, bytes = copied, "archived entry");
    Ok(())
}

/// Pushes archive bytes into the async side. A closed receiver means the
/// consumer went away, which ends packaging.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn zip_error(err: ZipError) -> EngineError {
    match err {
        ZipError::Io(io) => EngineError::from(io),
        other => EngineError::ArchiveFormat(other.to_string()),
    }
}

/// Extracts `entry` from the archive at `archive_path` into `dest_dir` and
/// returns the extracted file's path. Blocking.
pub fn extract_entry(
    archive_path: &Path,
    entry: &str,
    password: Option<&Secret>,
    dest_dir: &Path,
) -> Result<PathBuf> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| EngineError::ArchiveFormat(format!("not a readable zip archive: {e}")))?;

    let protected = match archive.by_name(entry) {
        Ok(_) => false,
        Err(ZipError::FileNotFound) => {
            return Err(EngineError::ArchiveFormat(format!(
                "archive has no {entry} entry"
            )));
        }
        Err(ZipError::UnsupportedArchive(reason)) if reason == ZipError::PASSWORD_REQUIRED => true,
        Err(other) => return Err(zip_error(other)),
    };

    let mut zipped = if protected {
        let password = password.filter(|pw| !pw.is_empty()).ok_or_else(|| {
            EngineError::ArchiveFormat("archive is password protected".to_string())
        })?;
        archive
            .by_name_decrypt(entry, password.expose().as_bytes())
            .map_err(|e| match e {
                ZipError::InvalidPassword => {
                    EngineError::ArchiveFormat("archive password is incorrect".to_string())
                }
                other => EngineError::ArchiveFormat(other.to_string()),
            })?
    } else {
        archive.by_name(entry).map_err(zip_error)?
    };

    let target = dest_dir.join(entry);
    let mut out = File::create(&target)?;
    io::copy(&mut zipped, &mut out).map_err(|e| {
        EngineError::ArchiveFormat(format!("failed to unpack {entry}: {e}"))
    })?;
    out.sync_all()?;
    Ok(target)
}
