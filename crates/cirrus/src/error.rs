//! Error types for the commit protocol.

use snafu::prelude::*;

pub use cirrus_core::error::{ConfigError, ErrorKind, StorageError};

/// Errors raised by commit operations and the job/task lifecycle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CommitError {
    /// A pending-commit record or argument is invalid.
    #[snafu(display("Invalid {what}: {message}"))]
    Validation { what: String, message: String },

    /// A store call failed.
    #[snafu(display("{operation} failed on {path}: {source}"))]
    Storage {
        operation: &'static str,
        path: String,
        source: StorageError,
    },

    /// A listing target turned out to be an object.
    #[snafu(display("Not a directory: {path}"))]
    NotADirectory { path: String },

    /// Failed to serialize a record.
    #[snafu(display("Failed to serialize {path}: {source}"))]
    Serialize {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to parse a persisted record.
    #[snafu(display("Failed to parse {path}: {source}"))]
    Deserialize {
        path: String,
        source: serde_json::Error,
    },

    /// Local filesystem failure in the staging layout.
    #[snafu(display("Local IO failed on {}: {source}", path.display()))]
    LocalIo {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// The job attempt directory already exists at setup.
    #[snafu(display("Job attempt directory already exists: {path}"))]
    JobAttemptExists { path: String },

    /// The destination already exists and the conflict mode is `fail`.
    #[snafu(display("Destination path exists and conflict mode is 'fail': {path}"))]
    DestinationExists { path: String },

    /// Another attempt of the same task already persisted its aggregate.
    #[snafu(display("Task {task} has already been committed to {path}"))]
    DuplicateTaskCommit { task: String, path: String },

    /// Two loaded records finalize the same key.
    #[snafu(display("Multiple pending commits target {key}: {first} and {second}"))]
    DuplicateDestination {
        key: String,
        first: String,
        second: String,
    },

    /// Task recovery after a coordinator restart is not supported.
    #[snafu(display("Cannot recover task {task}: task recovery is not supported"))]
    RecoveryUnsupported { task: String },

    /// An unknown committer name was configured.
    #[snafu(display("Unknown committer '{name}', expected 'magic' or 'staging'"))]
    UnknownCommitter { name: String },

    /// The layout in use cannot perform this operation.
    #[snafu(display("{operation} is not supported by the {layout} committer"))]
    UnsupportedByLayout {
        operation: &'static str,
        layout: &'static str,
    },

    /// Configuration could not be loaded.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },
}

impl CommitError {
    /// Classification used for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommitError::Storage { source, .. } => source.kind(),
            CommitError::LocalIo { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
                _ => ErrorKind::Io,
            },
            CommitError::Validation { .. }
            | CommitError::Deserialize { .. }
            | CommitError::Serialize { .. }
            | CommitError::DuplicateDestination { .. } => ErrorKind::Validation,
            CommitError::NotADirectory { .. } => ErrorKind::BadRequest,
            CommitError::JobAttemptExists { .. }
            | CommitError::DestinationExists { .. }
            | CommitError::DuplicateTaskCommit { .. } => ErrorKind::AlreadyExists,
            CommitError::RecoveryUnsupported { .. } | CommitError::UnsupportedByLayout { .. } => {
                ErrorKind::Unsupported
            }
            CommitError::UnknownCommitter { .. } | CommitError::Config { .. } => {
                ErrorKind::BadRequest
            }
        }
    }

    /// Shorthand for a validation failure.
    pub fn invalid(what: impl Into<String>, message: impl Into<String>) -> Self {
        CommitError::Validation {
            what: what.into(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for CommitError {
    fn from(source: ConfigError) -> Self {
        CommitError::Config { source }
    }
}
