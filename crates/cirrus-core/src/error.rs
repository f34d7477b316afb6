//! Common error types shared across the cirrus crates.
//!
//! Store failures carry an explicit [`ErrorKind`] tag so that retry policy can
//! be decided from a plain enum instead of inspecting backend error types.

use regex::Regex;
use snafu::prelude::*;
use std::sync::LazyLock;

// ============ Error Kinds ============

/// Classification of a failure reported by an object store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host name could not be resolved.
    UnknownHost,
    /// No network route to the store.
    NoRoute,
    /// The operation was interrupted or its worker was cancelled.
    Interrupted,
    /// The request was malformed or rejected as invalid.
    BadRequest,
    /// Object or upload does not exist.
    NotFound,
    /// Create-only write found an existing object.
    AlreadyExists,
    /// The store rejected the request because of request rate.
    Throttled,
    /// Credentials missing or insufficient.
    PermissionDenied,
    /// The backend does not implement the operation.
    Unsupported,
    /// A pending-commit record or argument failed validation.
    Validation,
    /// Any other I/O failure.
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownHost => "unknown_host",
            ErrorKind::NoRoute => "no_route",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Throttled => "throttled",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Substrings of backend messages that identify throttling responses.
// Status codes are matched separately, since messages carry request URLs.
const THROTTLE_MARKERS: &[&str] = &[
    "slowdown",
    "slow down",
    "throttl",
    "toomanyrequests",
    "too many requests",
    "requestlimitexceeded",
];

/// A 429 or 503 reported as a response status, never a bare number.
static THROTTLE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\bstatus(?: code)?|\bhttp)[\s:=]+(?:429|503)\b|\b(?:429|503) (?:service unavailable|slow down)")
        .expect("throttle status pattern is valid")
});

const UNKNOWN_HOST_MARKERS: &[&str] = &[
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no such host",
];

/// Classify a free-form backend message.
fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if THROTTLE_STATUS.is_match(&lower) || THROTTLE_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Throttled
    } else if UNKNOWN_HOST_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::UnknownHost
    } else if lower.contains("no route to host") {
        ErrorKind::NoRoute
    } else if lower.contains("nosuchupload") || lower.contains("not found") {
        ErrorKind::NotFound
    } else {
        ErrorKind::Io
    }
}

/// Map an `object_store` error onto an [`ErrorKind`].
pub fn object_store_kind(err: &object_store::Error) -> ErrorKind {
    use object_store::Error;
    match err {
        Error::NotFound { .. } => ErrorKind::NotFound,
        Error::AlreadyExists { .. } | Error::Precondition { .. } => ErrorKind::AlreadyExists,
        Error::InvalidPath { .. } | Error::UnknownConfigurationKey { .. } => ErrorKind::BadRequest,
        Error::NotSupported { .. } | Error::NotImplemented => ErrorKind::Unsupported,
        Error::PermissionDenied { .. } | Error::Unauthenticated { .. } => {
            ErrorKind::PermissionDenied
        }
        Error::JoinError { .. } => ErrorKind::Interrupted,
        Error::Generic { source, .. } => classify_message(&source.to_string()),
        other => classify_message(&other.to_string()),
    }
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },

    /// Azure configuration error.
    #[snafu(display("Azure configuration error: {source}"))]
    AzureConfig { source: object_store::Error },

    /// The backend has no multipart upload support.
    #[snafu(display("Multipart uploads are not supported by {url}"))]
    MultipartUnsupported { url: String },

    /// Upload id is not known to the store.
    #[snafu(display("No such upload {upload_id} for {path}"))]
    UnknownUpload { path: String, upload_id: String },

    /// Failure reported by a client adapter with an explicit kind.
    #[snafu(display("{kind} failure: {message}"))]
    Remote { kind: ErrorKind, message: String },
}

impl StorageError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidUrl { .. } => ErrorKind::BadRequest,
            StorageError::ObjectStore { source } => object_store_kind(source),
            StorageError::Io { source } => match source.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                _ => ErrorKind::Io,
            },
            StorageError::S3Config { .. }
            | StorageError::GcsConfig { .. }
            | StorageError::AzureConfig { .. } => ErrorKind::BadRequest,
            StorageError::MultipartUnsupported { .. } => ErrorKind::Unsupported,
            StorageError::UnknownUpload { .. } => ErrorKind::NotFound,
            StorageError::Remote { kind, .. } => *kind,
        }
    }

    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// A value is outside its allowed range.
    #[snafu(display("Invalid value for '{field}': {message}"))]
    Invalid { field: String, message: String },
}
