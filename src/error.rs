//! Error types for offheap.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using offheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid combination of arguments or region state.
    Configuration,
    /// A filesystem operation failed.
    Io,
    /// The mapping capability failed to map, unmap or flush.
    Mapping,
    /// The region was already freed or superseded by a grown region.
    Released,
    /// A checked access fell outside the mapped buffer.
    OutOfBounds,
}

/// Main error type for region operations.
///
/// Every variant carries the name of the operation that failed and, for
/// file-backed regions, the backing path.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid arguments for the requested operation.
    #[error("{op}{}: {reason}", at(.path))]
    Configuration {
        /// Operation that rejected its arguments.
        op: &'static str,
        /// Backing path, if any.
        path: Option<PathBuf>,
        /// What was wrong.
        reason: String,
    },

    /// Filesystem failure (create, open, stat, truncate, close).
    #[error("{op}{}: I/O error: {source}", at(.path))]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Backing path, if any.
        path: Option<PathBuf>,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Map, unmap or flush failure.
    #[error("{op}{}: mapping error: {source}{}", at(.path), secondary(.close_error))]
    Mapping {
        /// Operation that failed.
        op: &'static str,
        /// Backing path, if any.
        path: Option<PathBuf>,
        /// Errno reported by the mapping call.
        #[source]
        source: rustix::io::Errno,
        /// Failure to close the backing file, observed during the same `free`.
        close_error: Option<std::io::Error>,
    },

    /// Operation attempted on a region that no longer owns its mapping.
    #[error("{op}{}: region has been {state}", at(.path))]
    RegionReleased {
        /// Operation that was rejected.
        op: &'static str,
        /// Backing path, if any.
        path: Option<PathBuf>,
        /// `"freed"` or `"superseded"`.
        state: &'static str,
    },

    /// Checked access outside the buffer.
    #[error("{op}: {count} bytes at offset {offset} exceed region of {len} bytes")]
    OutOfBounds {
        /// Operation that was rejected.
        op: &'static str,
        /// Start of the requested range.
        offset: usize,
        /// Length of the requested range.
        count: usize,
        /// Length of the region.
        len: usize,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Io { .. } => ErrorKind::Io,
            Error::Mapping { .. } => ErrorKind::Mapping,
            Error::RegionReleased { .. } => ErrorKind::Released,
            Error::OutOfBounds { .. } => ErrorKind::OutOfBounds,
        }
    }

    /// Backing path involved in the failure, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::Configuration { path, .. }
            | Error::Io { path, .. }
            | Error::Mapping { path, .. }
            | Error::RegionReleased { path, .. } => path.as_deref(),
            Error::OutOfBounds { .. } => None,
        }
    }

    pub(crate) fn config(op: &'static str, path: Option<&Path>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            op,
            path: path.map(Path::to_path_buf),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(op: &'static str, path: Option<&Path>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.map(Path::to_path_buf),
            source,
        }
    }

    pub(crate) fn mapping(op: &'static str, path: Option<&Path>, source: rustix::io::Errno) -> Self {
        Error::Mapping {
            op,
            path: path.map(Path::to_path_buf),
            source,
            close_error: None,
        }
    }
}

fn at(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" '{}'", p.display()),
        None => String::new(),
    }
}

fn secondary(close_error: &Option<std::io::Error>) -> String {
    match close_error {
        Some(e) => format!(" (also failed to close backing file: {e})"),
        None => String::new(),
    }
}
