//! Captured result of a per-item operation.

use crate::error::CommitError;

/// Result of an operation that must not fail its caller directly.
///
/// Batch drivers collect these and decide whether and when to surface the
/// captured failure.
#[derive(Debug, Default)]
#[must_use]
pub struct Outcome {
    failure: Option<CommitError>,
}

impl Outcome {
    pub fn success() -> Self {
        Self { failure: None }
    }

    pub fn failure(err: CommitError) -> Self {
        Self { failure: Some(err) }
    }

    pub fn from_result<T>(result: Result<T, CommitError>) -> Self {
        match result {
            Ok(_) => Self::success(),
            Err(err) => Self::failure(err),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn error(&self) -> Option<&CommitError> {
        self.failure.as_ref()
    }

    /// Keep this outcome's failure unless one is already captured.
    pub fn or_capture(self, err: CommitError) -> Self {
        match self.failure {
            Some(_) => self,
            None => Self::failure(err),
        }
    }

    /// Surface the captured failure, if any.
    pub fn into_result(self) -> Result<(), CommitError> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl From<Result<(), CommitError>> for Outcome {
    fn from(result: Result<(), CommitError>) -> Self {
        Self::from_result(result)
    }
}
