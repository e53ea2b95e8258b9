use std::fmt;
use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Why a connectivity check failed. Operators need to tell a rejected key
/// apart from a missing bucket or a dead endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityKind {
    CredentialsRejected,
    BucketMissing,
    Unreachable,
    Other,
}

impl fmt::Display for ConnectivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityKind::CredentialsRejected => "credentials rejected",
            ConnectivityKind::BucketMissing => "bucket does not exist",
            ConnectivityKind::Unreachable => "endpoint unreachable",
            ConnectivityKind::Other => "connection failed",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("PostgreSQL version not allowed: {0}")]
    UnsupportedEngineVersion(String),

    #[error("cannot reach {target} ({kind}): {message}")]
    Connectivity {
        target: String,
        kind: ConnectivityKind,
        message: String,
    },

    #[error("{program} exited with {status}: {diagnostics}")]
    ProcessFailure {
        program: String,
        status: String,
        diagnostics: String,
    },

    #[error("no databases found to back up")]
    EmptySourceSet,

    #[error("archive format error: {0}")]
    ArchiveFormat(String),

    #[error("backup {0} already has a run in flight")]
    OverlapSkipped(Uuid),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("execution {0} was already finished")]
    ExecutionAlreadyFinished(Uuid),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage operation failed: {0}")]
    Storage(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl EngineError {
    /// True when the failure happened before any execution record or
    /// artifact could exist.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            EngineError::UnsupportedEngineVersion(_)
                | EngineError::InvalidConfig(_)
                | EngineError::NotFound(_)
                | EngineError::OverlapSkipped(_)
        )
    }

    /// Wraps the error so it can travel through an `AsyncRead`/`Read` chain
    /// and be recovered intact on the other side.
    pub fn into_io(self) -> io::Error {
        match self {
            EngineError::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<EngineError>())
        {
            return EngineError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<EngineError>()) {
            Some(Ok(engine)) => *engine,
            Some(Err(other)) => EngineError::Io(io::Error::other(other)),
            None => EngineError::Storage("empty I/O error".to_string()),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("record".to_string()),
            other => EngineError::Persistence(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            EngineError::Cancelled
        } else {
            EngineError::Storage(format!("worker task panicked: {err}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
