//! Cirrus: a deferred multipart-upload commit protocol for object stores.
//!
//! Task output is uploaded as multipart uploads that are deliberately left
//! open. Each one is described by a pending-commit record; job commit
//! completes them all, so no output becomes visible until the job succeeds.
//!
//! - `pending` - pending-commit records and per-task pendingsets
//! - `operations` - commit, abort, revert and upload primitives
//! - `executor` - bounded-parallel batches with abort/revert callbacks
//! - `retry` - error classification and retry policy
//! - `tracker` - the write-path hook that leaves uploads pending
//! - `layout` / `paths` - where attempts keep their work
//! - `coordinator` - the job and task attempt lifecycle

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod layout;
pub mod operations;
pub mod outcome;
pub mod paths;
pub mod pending;
pub mod retry;
pub mod success;
pub mod tracker;

pub use config::{CommitterConfig, CommitterKind, ConflictMode};
pub use coordinator::CommitCoordinator;
pub use error::CommitError;
pub use executor::{TaskExecutor, WorkerPool};
pub use layout::{AttemptLayout, JobContext, TaskAttemptContext, TaskAttemptDir};
pub use operations::{CommitOperations, CommitterStatistics};
pub use outcome::Outcome;
pub use pending::{Pendingset, SinglePendingCommit};
pub use retry::{Idempotency, RetryAction, RetryPolicy};
pub use success::SuccessData;
pub use tracker::{DeferredWriteTracker, DirectPutTracker, PutTracker, tracker_for};

pub use cirrus_core::{
    ErrorKind, ObjectClient, ObjectClientRef, StorageError, StorageProvider, init_tracing,
};
