#![forbid(unsafe_code)]
//! Error types for sqsh.
//!
//! Defines `SqshError` and a `Result<T>` alias used throughout the
//! workspace. One variant per failure class: I/O, description-file syntax,
//! tree construction, range limits, codec failures, and internal
//! invariant violations.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all sqsh operations.
#[derive(Debug, Error)]
pub enum SqshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{file}:{line}: {msg}")]
    Format {
        file: String,
        line: usize,
        msg: String,
    },

    #[error("{path}: {kind}")]
    Tree { path: String, kind: TreeConflict },

    #[error("value out of range: {0}")]
    Limit(String),

    #[error("compressor failure: {0}")]
    Compress(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SqshError {
    /// Attach the offending path to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Build a `Format` error carrying `filename:line` context.
    pub fn format(file: impl Into<String>, line: usize, msg: impl Into<String>) -> Self {
        Self::Format {
            file: file.into(),
            line,
            msg: msg.into(),
        }
    }

    /// Build a `Tree` error for the node at `path`.
    pub fn tree(path: impl Into<String>, kind: TreeConflict) -> Self {
        Self::Tree {
            path: path.into(),
            kind,
        }
    }
}

/// What went wrong while building or post-processing the filesystem tree.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TreeConflict {
    #[error("name already exists with a different kind")]
    NameConflict,
    #[error("parent is not a directory")]
    ParentNotDirectory,
    #[error("invalid path")]
    InvalidPath,
    #[error("hard link target does not exist")]
    LinkTargetMissing,
    #[error("hard link chain forms a cycle")]
    LinkCycle,
    #[error("hard link target is a directory")]
    LinkToDirectory,
}

/// Result alias using `SqshError`.
pub type Result<T> = std::result::Result<T, SqshError>;
