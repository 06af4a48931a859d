//! Errors - error taxonomy for the stage store and the scanner loops.
//!
//! # Classification
//! - Transient: `SourceMissing` (another worker won the race; retry next tick)
//! - Permanent: `InvalidSpec`, `NotFound`, `Untracked`, `NotMutable`, `NotTerminal`
//! - Fatal: `DestConflict`, `Corrupt` (operator must look at it)
//! - Infrastructure: `Io`, `WriteFailed` (retried with backoff by the loops)

use std::path::PathBuf;

use super::folder::FolderName;
use super::stage::Stage;

/// Operational classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Fatal,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid scan spec: {0}")]
    InvalidSpec(String),

    #[error("no task folder at {path}")]
    NotFound { path: PathBuf },

    #[error("task {folder} is not in any stage")]
    Untracked { folder: FolderName },

    #[error("task record at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to write task record at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("task {folder} is no longer in {from}")]
    SourceMissing { folder: FolderName, from: Stage },

    #[error("task {folder} already exists in {to}; refusing to overwrite")]
    DestConflict { folder: FolderName, to: Stage },

    #[error("task {folder} in state {state} can no longer be modified")]
    NotMutable { folder: FolderName, state: String },

    #[error("task {folder} is in {stage}, which is not a terminal stage")]
    NotTerminal { folder: FolderName, stage: Stage },

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::SourceMissing { .. } => ErrorKind::Transient,
            StoreError::DestConflict { .. } | StoreError::Corrupt { .. } => ErrorKind::Fatal,
            StoreError::Io { .. } | StoreError::WriteFailed { .. } => ErrorKind::Infrastructure,
            StoreError::InvalidSpec(_)
            | StoreError::NotFound { .. }
            | StoreError::Untracked { .. }
            | StoreError::NotMutable { .. }
            | StoreError::NotTerminal { .. } => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_io(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

/// Failure reported by a processing collaborator.
///
/// The reason string is stored verbatim on the task record when the task is
/// moved to the failure stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("processing failed: {reason}")]
pub struct ProcessingError {
    pub reason: String,
}

impl ProcessingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Reasons a scanner loop stops on its own.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// A structural store error the loop must not guess its way around.
    #[error("{worker} worker halted: {source}")]
    Halted {
        worker: &'static str,
        #[source]
        source: StoreError,
    },

    /// Startup recovery could not reconcile the active stage.
    #[error("{worker} worker could not recover its active stage: {source}")]
    Recovery {
        worker: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{worker} worker task aborted: {reason}")]
    Aborted { worker: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder() -> FolderName {
        FolderName::parse("scan-x").unwrap()
    }

    #[test]
    fn source_missing_is_transient() {
        let err = StoreError::SourceMissing {
            folder: folder(),
            from: Stage::AcqQueue,
        };
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn dest_conflict_is_fatal() {
        let err = StoreError::DestConflict {
            folder: folder(),
            to: Stage::Acq,
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("refusing to overwrite"));
    }

    #[test]
    fn io_is_infrastructure() {
        let err = StoreError::io("/tmp/x", std::io::Error::other("disk"));
        assert!(err.is_io());
        assert!(!err.is_fatal());
    }
}
