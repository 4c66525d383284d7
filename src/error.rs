//! Error types for ramforge.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building an image.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or empty package list, unknown builder, colliding command names.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported archive format {0:?} (supported: cpio, cpio.gz)")]
    UnsupportedFormat(String),

    #[error("failed to compile {package}: {cause}")]
    Compile { package: String, cause: String },

    #[error("cannot resolve {}: {reason}", path.display())]
    Resolution { path: PathBuf, reason: String },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn resolution(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Resolution {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from reading or writing an archive stream.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("malformed archive at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ArchiveError {
    pub(crate) fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        ArchiveError::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
