//! Error types for BEAT data exchange

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for data exchange operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for data exchange operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file or socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A shard, data format, algorithm or input does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An on-disk or wire frame could not be parsed
    #[error("Format error: {0}")]
    Format(String),

    /// A checksum file disagrees with the content it covers
    #[error("Checksum mismatch for `{}': expected {expected}, computed {actual}", path.display())]
    ChecksumMismatch {
        /// The file whose content was hashed
        path: PathBuf,
        /// Checksum recorded on disk
        expected: String,
        /// Checksum of the current content
        actual: String,
    },

    /// Shards of one stream leave a gap or overlap
    #[error("Shards are not contiguous: `{}' is followed by `{}'", previous.display(), next.display())]
    ContiguityViolation {
        /// The earlier shard of the offending pair
        previous: PathBuf,
        /// The later shard of the offending pair
        next: PathBuf,
    },

    /// A record declares a different data format than expected
    #[error("Schema mismatch: expected `{expected}', got `{actual}'")]
    SchemaMismatch {
        /// Format the receiver was set up with
        expected: String,
        /// Format carried by the offered record
        actual: String,
    },

    /// An index lies outside the permitted window
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Algorithm code tried to advance a restricted group
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The view server answered with an error frame
    #[error("Remote error ({kind}): {message}")]
    Remote {
        /// Stable error kind sent by the server (`usr` or `sys`)
        kind: String,
        /// Human readable message sent by the server
        message: String,
    },

    /// Failure raised by user code, such as a database view
    #[error("User error: {0:#}")]
    User(#[source] anyhow::Error),

    /// A value cannot be converted to the declared type
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary state serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::Format`], also covers JSON and state decoding failures
    Format,
    /// See [`Error::ChecksumMismatch`]
    ChecksumMismatch,
    /// See [`Error::ContiguityViolation`]
    ContiguityViolation,
    /// See [`Error::SchemaMismatch`] and [`Error::TypeMismatch`]
    SchemaMismatch,
    /// See [`Error::OutOfRange`]
    OutOfRange,
    /// See [`Error::AccessDenied`]
    AccessDenied,
    /// See [`Error::Remote`]
    Remote,
    /// See [`Error::Io`]
    Io,
    /// See [`Error::User`]
    User,
    /// Argument or state misuse
    Usage,
}

impl Error {
    /// Classify this error according to the data exchange taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Format(_) | Error::Json(_) | Error::Serialization(_) => ErrorKind::Format,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::ContiguityViolation { .. } => ErrorKind::ContiguityViolation,
            Error::SchemaMismatch { .. } | Error::TypeMismatch(_) => ErrorKind::SchemaMismatch,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::User(_) => ErrorKind::User,
            Error::InvalidArgument(_) | Error::InvalidOperation(_) => ErrorKind::Usage,
        }
    }

    /// Build a remote error from the kind and message of an `err` frame
    pub fn remote(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build a format error from anything printable
    pub fn format(message: impl fmt::Display) -> Self {
        Error::Format(message.to_string())
    }
}
