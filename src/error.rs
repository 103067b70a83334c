//! Error taxonomy shared across the archive, patching and the evolution loop.

use thiserror::Error;

use crate::archive::ProgramId;

/// Failures surfaced by the program archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("program {0} not found")]
    NotFound(ProgramId),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A patch descriptor that does not select exactly one payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedPatch {
    #[error("patch carries neither a full replacement nor a block mapping")]
    Empty,
    #[error("patch carries both a full replacement and a block mapping")]
    Ambiguous,
}

/// Failure reported by a proposal source or an evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    /// Network errors, rate limits, timeouts. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// The request can never succeed as issued (bad program, bad credentials).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExternalError::Transient(_) => "transient",
            ExternalError::Permanent(_) => "permanent",
        }
    }
}

/// Errors that stop the orchestrator itself, as opposed to aborting one cycle.
#[derive(Debug, Error)]
pub enum EvolveError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("archive holds no programs; seed a root program first")]
    EmptyArchive,
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
