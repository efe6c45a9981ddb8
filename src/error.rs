use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::grid::PointId;
use crate::io::records::RestartRecord;

/// Failure of a single backend evaluation. Local to one point.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected configuration, detected before any dispatch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("unknown energy unit `{0}`")]
    UnknownUnit(String),

    #[error("backend executable `{0}` could not be resolved")]
    ExecutableNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ConfigError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("point {0} is outside the grid")]
    OutOfBounds(PointId),

    #[error("point {id} is not pending (state: {state})")]
    NotPending { id: PointId, state: &'static str },

    #[error("malformed grid: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} holds a {found} record, expected a {expected} record")]
    WrongKind {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },

    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Writing a checkpoint failed. The in-memory state at the time of the
    /// failure travels with the error so the caller can still persist it.
    #[error("checkpoint to {path} failed: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: RecordError,
        record: Box<RestartRecord>,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error("failed to start worker thread: {0}")]
    Worker(std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
