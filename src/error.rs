use camino::Utf8PathBuf;
use thiserror::Error;

use crate::state::Phase;

/// A declared input could not be captured. The up-to-date check for the task
/// is aborted and the task is treated as out of date.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Property '{property}': required path '{path}' does not exist")]
    Missing {
        property: String,
        path: Utf8PathBuf,
    },

    #[error("Property '{property}': couldn't read '{path}'.\n{source}")]
    Io {
        property: String,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Property '{property}': couldn't compile glob pattern.\n{source}")]
    Pattern {
        property: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Property '{property}': couldn't run glob.\n{source}")]
    Glob {
        property: String,
        #[source]
        source: glob::GlobError,
    },

    #[error("Property '{property}': path is not valid UTF-8.\n{source}")]
    NonUtf8Path {
        property: String,
        #[source]
        source: camino::FromPathBufError,
    },
}

/// The history store could not be read or written.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("History store I/O failed.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode execution record for '{key}'.\n{reason}")]
    Encode { key: String, reason: String },

    #[error("Execution record for '{key}' is corrupt.\n{reason}")]
    Corrupt { key: String, reason: String },
}

/// A lifecycle method was called in a state where it is not allowed. This is
/// a bug in the caller and is never recovered from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Illegal call to '{operation}' while task state is {phase:?}")]
pub struct IllegalStateError {
    pub operation: &'static str,
    pub phase: Phase,
}

#[derive(Debug, Error)]
pub enum TaskStateError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    IllegalState(#[from] IllegalStateError),
}

/// Error returned by the [`runner`](crate::runner) helpers.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    State(#[from] TaskStateError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),
}
