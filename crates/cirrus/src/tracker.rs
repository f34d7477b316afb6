//! Write-path hooks deciding whether a finished upload is finalized now or
//! left pending for job commit.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use object_store::path::Path;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use cirrus_core::emit;
use cirrus_core::metrics::events::CommitCreated;

use crate::error::{CommitError, ValidationSnafu};
use crate::operations::{CommitOperations, CommitterStatistics, plan_parts};
use crate::paths::{final_destination, is_delayed_write, pending_record_path};
use crate::pending::SinglePendingCommit;

/// Observes one object write and decides how it ends.
#[async_trait]
pub trait PutTracker: Send + Sync + std::fmt::Debug {
    /// Whether the writer must start a multipart upload up front, however
    /// little data it ends up writing.
    fn init(&self) -> bool;

    /// Key the upload is made against.
    fn destination(&self) -> &Path;

    /// Called once every part is uploaded. `Ok(true)` means the writer
    /// should complete the upload itself.
    async fn about_to_complete(
        &self,
        upload_id: &str,
        parts: &[String],
        bytes_written: u64,
    ) -> Result<bool, CommitError>;
}

/// Ordinary writes: finalize immediately.
#[derive(Debug)]
pub struct DirectPutTracker {
    destination: Path,
}

impl DirectPutTracker {
    pub fn new(destination: Path) -> Self {
        Self { destination }
    }
}

#[async_trait]
impl PutTracker for DirectPutTracker {
    fn init(&self) -> bool {
        false
    }

    fn destination(&self) -> &Path {
        &self.destination
    }

    async fn about_to_complete(
        &self,
        _upload_id: &str,
        _parts: &[String],
        _bytes_written: u64,
    ) -> Result<bool, CommitError> {
        Ok(true)
    }
}

/// Writes under `__magic`: the upload targets the final key but is left
/// open, and a `.pending` record is saved next to the magic path.
#[derive(Debug)]
pub struct DeferredWriteTracker {
    ops: CommitOperations,
    /// Path the writer was asked to write.
    original: Path,
    /// Key the upload will be completed at.
    destination: Path,
    /// Where the record is saved.
    pending: Path,
}

impl DeferredWriteTracker {
    pub fn new(ops: CommitOperations, original: Path, destination: Path) -> Self {
        let pending = pending_record_path(&original);
        Self {
            ops,
            original,
            destination,
            pending,
        }
    }

    pub fn pending_path(&self) -> &Path {
        &self.pending
    }
}

#[async_trait]
impl PutTracker for DeferredWriteTracker {
    fn init(&self) -> bool {
        true
    }

    fn destination(&self) -> &Path {
        &self.destination
    }

    async fn about_to_complete(
        &self,
        upload_id: &str,
        parts: &[String],
        bytes_written: u64,
    ) -> Result<bool, CommitError> {
        ensure!(
            !upload_id.is_empty(),
            ValidationSnafu {
                what: "upload id",
                message: format!("empty upload id for {}", self.destination),
            }
        );
        ensure!(
            !parts.is_empty(),
            ValidationSnafu {
                what: "parts",
                message: format!("no parts uploaded for {}", self.destination),
            }
        );

        let mut commit = SinglePendingCommit::new(
            self.ops.client().bucket(),
            &self.destination,
            upload_id,
            parts.to_vec(),
            bytes_written,
        );
        commit.saved = Utc::now().timestamp_millis();
        self.ops.put(&self.pending, commit.to_json()?).await?;

        // A placeholder so listings of the task directory show the file.
        self.ops.put(&self.original, Bytes::new()).await?;

        CommitterStatistics::bump(&self.ops.statistics().commits_created);
        emit!(CommitCreated);
        info!(
            key = %self.destination,
            upload_id,
            bytes = bytes_written,
            "Upload pending commit, record at {}",
            self.pending
        );
        Ok(false)
    }
}

/// Tracker for a write to `path`.
pub fn tracker_for(ops: &CommitOperations, path: &Path) -> Result<Box<dyn PutTracker>, CommitError> {
    if is_delayed_write(path) {
        let destination = final_destination(path)?;
        debug!("Write to {path} deferred to {destination}");
        Ok(Box::new(DeferredWriteTracker::new(
            ops.clone(),
            path.clone(),
            destination,
        )))
    } else {
        Ok(Box::new(DirectPutTracker::new(path.clone())))
    }
}

/// How a write ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The object is visible at this key.
    Visible(Path),
    /// The upload is open; its record is at this path.
    Pending(Path),
}

/// Write `payload` to `path`, consulting the tracker for that path.
///
/// Small ordinary writes become a single put. Anything else is uploaded in
/// parts of at most `part_size`, then completed or left pending as the tracker
/// decides. An upload that fails midway is aborted.
pub async fn write_object(
    ops: &CommitOperations,
    path: &Path,
    payload: Bytes,
    part_size: usize,
) -> Result<WriteOutcome, CommitError> {
    let tracker = tracker_for(ops, path)?;
    let destination = tracker.destination().clone();

    if !tracker.init() && payload.len() <= part_size {
        ops.put(&destination, payload).await?;
        return Ok(WriteOutcome::Visible(destination));
    }

    let upload_id = ops.initiate_upload(&destination).await?;
    let result: Result<WriteOutcome, CommitError> = async {
        let mut tags = Vec::new();
        for part in plan_parts(payload.len() as u64, part_size) {
            let start = part.offset as usize;
            let bytes = payload.slice(start..start + part.size);
            tags.push(ops.upload_part(&destination, &upload_id, &part, bytes).await?);
        }
        if tracker
            .about_to_complete(&upload_id, &tags, payload.len() as u64)
            .await?
        {
            ops.complete_upload(&destination, &upload_id, &tags).await?;
            Ok(WriteOutcome::Visible(destination.clone()))
        } else {
            Ok(WriteOutcome::Pending(pending_record_path(path)))
        }
    }
    .await;

    if let Err(err) = &result {
        warn!(key = %destination, "Write failed, aborting upload {upload_id}: {err}");
        if let Err(abort_err) = ops.abort_upload(&destination, &upload_id).await {
            warn!(key = %destination, "Failed to abort upload {upload_id}: {abort_err}");
        }
    }
    result
}
