//! Internal events for cirrus metrics emission.
//!
//! Each event struct represents a measurable occurrence in the commit
//! protocol or the storage layer beneath it.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Storage events
// ============================================================================

/// Storage operation type.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Head,
    Delete,
    List,
    CreateMultipart,
    PutPart,
    CompleteMultipart,
    AbortMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Head => "head",
            StorageOperation::Delete => "delete",
            StorageOperation::List => "list",
            StorageOperation::CreateMultipart => "create_multipart",
            StorageOperation::PutPart => "put_part",
            StorageOperation::CompleteMultipart => "complete_multipart",
            StorageOperation::AbortMultipart => "abort_multipart",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "cirrus_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "cirrus_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Commit protocol events
// ============================================================================

/// A deferred upload was recorded as a pending commit.
pub struct CommitCreated;

impl InternalEvent for CommitCreated {
    fn emit(self) {
        trace!("Pending commit created");
        counter!("cirrus_commits_created_total").increment(1);
    }
}

/// A pending commit was finalized on the store.
pub struct CommitCompleted {
    pub bytes: u64,
}

impl InternalEvent for CommitCompleted {
    fn emit(self) {
        trace!(bytes = self.bytes, "Commit completed");
        counter!("cirrus_commits_completed_total").increment(1);
        counter!("cirrus_committed_bytes_total").increment(self.bytes);
    }
}

/// Finalizing a pending commit failed.
pub struct CommitFailed;

impl InternalEvent for CommitFailed {
    fn emit(self) {
        trace!("Commit failed");
        counter!("cirrus_commits_failed_total").increment(1);
    }
}

/// A pending upload was aborted.
pub struct CommitAborted;

impl InternalEvent for CommitAborted {
    fn emit(self) {
        trace!("Commit aborted");
        counter!("cirrus_commits_aborted_total").increment(1);
    }
}

/// A finalized object was deleted to roll back a failed batch.
pub struct CommitReverted;

impl InternalEvent for CommitReverted {
    fn emit(self) {
        trace!("Commit reverted");
        counter!("cirrus_commits_reverted_total").increment(1);
    }
}

/// Outcome label for task and job completion.
#[derive(Debug, Clone, Copy)]
pub enum CompletionStatus {
    Committed,
    Failed,
    Aborted,
}

impl CompletionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Committed => "committed",
            CompletionStatus::Failed => "failed",
            CompletionStatus::Aborted => "aborted",
        }
    }
}

/// A task attempt reached a terminal state.
pub struct TaskCompleted {
    pub status: CompletionStatus,
}

impl InternalEvent for TaskCompleted {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Task completed");
        counter!("cirrus_tasks_completed_total", "status" => self.status.as_str()).increment(1);
    }
}

/// A job attempt reached a terminal state.
pub struct JobCompleted {
    pub status: CompletionStatus,
    pub duration: Duration,
}

impl InternalEvent for JobCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Job completed"
        );
        counter!("cirrus_jobs_completed_total", "status" => self.status.as_str()).increment(1);
        histogram!("cirrus_job_commit_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// A store operation is being retried.
pub struct OperationRetried {
    pub operation: &'static str,
    pub kind: &'static str,
}

impl InternalEvent for OperationRetried {
    fn emit(self) {
        trace!(operation = self.operation, kind = self.kind, "Operation retried");
        counter!(
            "cirrus_retries_total",
            "operation" => self.operation,
            "kind" => self.kind
        )
        .increment(1);
    }
}
