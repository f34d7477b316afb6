//! Low-level commit, abort and revert operations on pending commits.
//!
//! Every store call goes through the configured [`RetryPolicy`].

use bytes::Bytes;
use futures::FutureExt;
use object_store::ObjectMeta;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use cirrus_core::emit;
use cirrus_core::metrics::events::{
    CommitAborted, CommitCompleted, CommitCreated, CommitFailed, CommitReverted,
};
use cirrus_core::{ErrorKind, ObjectClientRef};

use crate::error::{CommitError, LocalIoSnafu, NotADirectorySnafu, StorageSnafu};
use crate::executor::{TaskExecutor, WorkerPool};
use crate::outcome::Outcome;
use crate::paths::SUCCESS_MARKER;
use crate::pending::{PENDING_SUFFIX, PENDINGSET_SUFFIX, Pendingset, SinglePendingCommit};
use crate::retry::{Idempotency, RetryPolicy};
use crate::success::SuccessData;

/// Counters kept per committer instance.
#[derive(Debug, Default)]
pub struct CommitterStatistics {
    pub commits_created: AtomicU64,
    pub commits_completed: AtomicU64,
    pub commits_failed: AtomicU64,
    pub commits_aborted: AtomicU64,
    pub commits_reverted: AtomicU64,
    pub bytes_committed: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
}

impl CommitterStatistics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BTreeMap::from([
            ("commits_created".to_string(), read(&self.commits_created)),
            ("commits_completed".to_string(), read(&self.commits_completed)),
            ("commits_failed".to_string(), read(&self.commits_failed)),
            ("commits_aborted".to_string(), read(&self.commits_aborted)),
            ("commits_reverted".to_string(), read(&self.commits_reverted)),
            ("bytes_committed".to_string(), read(&self.bytes_committed)),
            ("tasks_completed".to_string(), read(&self.tasks_completed)),
            ("tasks_failed".to_string(), read(&self.tasks_failed)),
            ("jobs_completed".to_string(), read(&self.jobs_completed)),
            ("jobs_failed".to_string(), read(&self.jobs_failed)),
        ])
    }

    pub(crate) fn task_finished(&self, success: bool) {
        Self::bump(if success {
            &self.tasks_completed
        } else {
            &self.tasks_failed
        });
    }

    pub(crate) fn job_finished(&self, success: bool) {
        Self::bump(if success {
            &self.jobs_completed
        } else {
            &self.jobs_failed
        });
    }
}

/// One part of a planned upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// 1-based part number.
    pub number: usize,
    pub offset: u64,
    pub size: usize,
    pub last: bool,
}

/// Split `length` bytes into parts of at most `part_size`; always at least one.
pub fn plan_parts(length: u64, part_size: usize) -> Vec<PartPlan> {
    let part_size = part_size.max(1) as u64;
    let count = length.div_ceil(part_size).max(1);
    (0..count)
        .map(|index| {
            let offset = index * part_size;
            PartPlan {
                number: index as usize + 1,
                offset,
                size: part_size.min(length - offset) as usize,
                last: index + 1 == count,
            }
        })
        .collect()
}

/// Records that could not be loaded, with the reason.
pub type LoadFailures = Vec<(Path, CommitError)>;

/// Commit primitives over one object client.
#[derive(Debug, Clone)]
pub struct CommitOperations {
    client: ObjectClientRef,
    retry: RetryPolicy,
    stats: Arc<CommitterStatistics>,
}

impl CommitOperations {
    pub fn new(client: ObjectClientRef, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            stats: Arc::new(CommitterStatistics::default()),
        }
    }

    /// Share statistics with another instance.
    pub fn with_statistics(mut self, stats: Arc<CommitterStatistics>) -> Self {
        self.stats = stats;
        self
    }

    pub fn client(&self) -> &ObjectClientRef {
        &self.client
    }

    pub fn statistics(&self) -> &Arc<CommitterStatistics> {
        &self.stats
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ============ Finalize / cancel ============

    /// Complete the upload behind `commit`. Failures are captured, not raised.
    pub async fn commit(&self, commit: &SinglePendingCommit) -> Outcome {
        let result = self.try_commit(commit).await;
        match &result {
            Ok(()) => {
                CommitterStatistics::bump(&self.stats.commits_completed);
                self.stats
                    .bytes_committed
                    .fetch_add(commit.length, Ordering::Relaxed);
                emit!(CommitCompleted {
                    bytes: commit.length
                });
                debug!(key = %commit.destination_key, bytes = commit.length, "Committed");
            }
            Err(err) => {
                CommitterStatistics::bump(&self.stats.commits_failed);
                emit!(CommitFailed);
                warn!(key = %commit.destination_key, upload_id = %commit.upload_id, "Commit failed: {err}");
            }
        }
        Outcome::from_result(result)
    }

    /// [`commit`](Self::commit), raising the captured failure.
    pub async fn commit_or_fail(&self, commit: &SinglePendingCommit) -> Result<(), CommitError> {
        self.commit(commit).await.into_result()
    }

    async fn try_commit(&self, commit: &SinglePendingCommit) -> Result<(), CommitError> {
        commit.validate()?;
        self.complete_upload(&commit.destination(), &commit.upload_id, &commit.etags)
            .await
    }

    /// Finalize a multipart upload with its ordered part tags.
    pub async fn complete_upload(
        &self,
        destination: &Path,
        upload_id: &str,
        tags: &[String],
    ) -> Result<(), CommitError> {
        let client = &self.client;
        self.retry
            .run("complete_upload", Idempotency::Idempotent, || {
                client.complete_upload(destination, upload_id, tags)
            })
            .await
            .context(StorageSnafu {
                operation: "complete upload",
                path: destination.to_string(),
            })
    }

    /// Cancel the upload behind `commit`. Counted as an abort even on failure.
    pub async fn abort_single_commit(&self, commit: &SinglePendingCommit) -> Result<(), CommitError> {
        ensure!(
            !commit.upload_id.is_empty() && !commit.destination_key.is_empty(),
            crate::error::ValidationSnafu {
                what: "pending commit",
                message: format!(
                    "cannot abort '{}' with upload id '{}'",
                    commit.destination_key, commit.upload_id
                ),
            }
        );
        debug!(key = %commit.destination_key, upload_id = %commit.upload_id, "Aborting commit");
        let result = self
            .abort_upload(&commit.destination(), &commit.upload_id)
            .await;
        CommitterStatistics::bump(&self.stats.commits_aborted);
        emit!(CommitAborted);
        result
    }

    /// Cancel a multipart upload by id.
    pub async fn abort_upload(&self, path: &Path, upload_id: &str) -> Result<(), CommitError> {
        let client = &self.client;
        self.retry
            .run("abort_upload", Idempotency::Idempotent, || {
                client.abort_upload(path, upload_id)
            })
            .await
            .context(StorageSnafu {
                operation: "abort upload",
                path: path.to_string(),
            })
    }

    /// Delete the object a commit finalized.
    pub async fn revert_commit(&self, commit: &SinglePendingCommit) -> Result<(), CommitError> {
        let destination = commit.destination();
        info!(key = %destination, "Reverting commit");
        self.delete(&destination).await?;
        CommitterStatistics::bump(&self.stats.commits_reverted);
        emit!(CommitReverted);
        Ok(())
    }

    // ============ Uploads ============

    /// Upload a local file as a multipart upload and leave it pending.
    ///
    /// Parts are uploaded in order. The upload is aborted if any step after
    /// initiation fails.
    pub async fn upload_file_to_pending_commit(
        &self,
        local: &std::path::Path,
        destination: &Path,
        partition: Option<&str>,
        part_size: usize,
    ) -> Result<SinglePendingCommit, CommitError> {
        ensure!(
            part_size > 0,
            crate::error::ValidationSnafu {
                what: "part size",
                message: "must be positive",
            }
        );
        let metadata = tokio::fs::metadata(local)
            .await
            .context(LocalIoSnafu { path: local })?;
        ensure!(
            metadata.is_file(),
            crate::error::ValidationSnafu {
                what: "upload source",
                message: format!("{} is not a file", local.display()),
            }
        );
        let length = metadata.len();
        let plan = plan_parts(length, part_size);

        let upload_id = self.initiate_upload(destination).await?;
        debug!(
            key = %destination,
            upload_id = %upload_id,
            parts = plan.len(),
            "Uploading {} ({length} bytes)",
            local.display()
        );

        match self.upload_parts(local, destination, &upload_id, &plan).await {
            Ok(etags) => {
                let mut commit = SinglePendingCommit::new(
                    self.client.bucket(),
                    destination,
                    upload_id,
                    etags,
                    length,
                );
                if let Some(partition) = partition {
                    commit.text = format!("partition: {partition}");
                }
                CommitterStatistics::bump(&self.stats.commits_created);
                emit!(CommitCreated);
                Ok(commit)
            }
            Err(err) => {
                warn!(key = %destination, "Upload failed, aborting {upload_id}: {err}");
                if let Err(abort_err) = self.abort_upload(destination, &upload_id).await {
                    warn!(key = %destination, "Failed to abort upload {upload_id}: {abort_err}");
                }
                CommitterStatistics::bump(&self.stats.commits_aborted);
                emit!(CommitAborted);
                Err(err)
            }
        }
    }

    /// Start a multipart upload. Not retried on plain I/O failures.
    pub async fn initiate_upload(&self, destination: &Path) -> Result<String, CommitError> {
        let client = &self.client;
        self.retry
            .run("initiate_upload", Idempotency::NotIdempotent, || {
                client.initiate_upload(destination)
            })
            .await
            .context(StorageSnafu {
                operation: "initiate upload",
                path: destination.to_string(),
            })
    }

    async fn upload_parts(
        &self,
        local: &std::path::Path,
        destination: &Path,
        upload_id: &str,
        plan: &[PartPlan],
    ) -> Result<Vec<String>, CommitError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .context(LocalIoSnafu { path: local })?;
        let mut etags = Vec::with_capacity(plan.len());

        for part in plan {
            let mut buffer = vec![0u8; part.size];
            file.read_exact(&mut buffer)
                .await
                .context(LocalIoSnafu { path: local })?;
            let tag = self
                .upload_part(destination, upload_id, part, Bytes::from(buffer))
                .await?;
            etags.push(tag);
        }
        Ok(etags)
    }

    /// Upload one planned part.
    pub async fn upload_part(
        &self,
        destination: &Path,
        upload_id: &str,
        part: &PartPlan,
        bytes: Bytes,
    ) -> Result<String, CommitError> {
        debug!(
            key = %destination,
            part = part.number,
            size = part.size,
            last = part.last,
            "Uploading part"
        );
        let client = &self.client;
        self.retry
            .run("upload_part", Idempotency::Idempotent, || {
                client.upload_part(destination, upload_id, part.number, bytes.clone())
            })
            .await
            .context(StorageSnafu {
                operation: "upload part",
                path: destination.to_string(),
            })
    }

    // ============ Record files ============

    async fn list_records(
        &self,
        dir: &Path,
        recursive: bool,
        suffix: &str,
    ) -> Result<Vec<Path>, CommitError> {
        let client = &self.client;
        if !dir.as_ref().is_empty() {
            let existing = self
                .retry
                .run("head", Idempotency::Idempotent, || client.head(dir))
                .await
                .context(StorageSnafu {
                    operation: "head",
                    path: dir.to_string(),
                })?;
            ensure!(
                existing.is_none(),
                NotADirectorySnafu {
                    path: dir.to_string()
                }
            );
        }

        let listing = self
            .retry
            .run("list", Idempotency::Idempotent, || client.list(dir, recursive))
            .await
            .context(StorageSnafu {
                operation: "list",
                path: dir.to_string(),
            })?;
        Ok(listing
            .into_iter()
            .map(|meta| meta.location)
            .filter(|path| path.filename().is_some_and(|name| name.ends_with(suffix)))
            .collect())
    }

    /// Paths of single pending-commit records under `dir`.
    pub async fn locate_pending(&self, dir: &Path, recursive: bool) -> Result<Vec<Path>, CommitError> {
        self.list_records(dir, recursive, PENDING_SUFFIX).await
    }

    /// Paths of task aggregates directly under `dir`.
    pub async fn locate_pendingsets(&self, dir: &Path) -> Result<Vec<Path>, CommitError> {
        self.list_records(dir, false, PENDINGSET_SUFFIX).await
    }

    async fn read(&self, path: &Path) -> Result<Bytes, CommitError> {
        let client = &self.client;
        self.retry
            .run("get", Idempotency::Idempotent, || client.get(path))
            .await
            .context(StorageSnafu {
                operation: "read record",
                path: path.to_string(),
            })
    }

    pub async fn load_single(&self, path: &Path) -> Result<SinglePendingCommit, CommitError> {
        let bytes = self.read(path).await?;
        SinglePendingCommit::from_json(&bytes, path.as_ref())
    }

    pub async fn load_pendingset(&self, path: &Path) -> Result<Pendingset, CommitError> {
        let bytes = self.read(path).await?;
        Pendingset::from_json(&bytes, path.as_ref())
    }

    /// Load every `.pending` record under `dir`.
    ///
    /// Per-file failures are returned alongside what did load; only a failed
    /// listing is an error.
    pub async fn load_pending(
        &self,
        dir: &Path,
        recursive: bool,
        pool: Option<&WorkerPool>,
    ) -> Result<(Pendingset, LoadFailures), CommitError> {
        let files = self.locate_pending(dir, recursive).await?;
        Ok(self.load_files(files, pool, false).await)
    }

    /// Load every task aggregate directly under `dir`.
    pub async fn load_pendingsets(
        &self,
        dir: &Path,
        pool: Option<&WorkerPool>,
    ) -> Result<(Pendingset, LoadFailures), CommitError> {
        let files = self.locate_pendingsets(dir).await?;
        Ok(self.load_files(files, pool, true).await)
    }

    async fn load_files(
        &self,
        files: Vec<Path>,
        pool: Option<&WorkerPool>,
        aggregates: bool,
    ) -> (Pendingset, LoadFailures) {
        let loaded: Mutex<Vec<(usize, Pendingset)>> = Mutex::new(Vec::new());
        let failures: Mutex<Vec<(usize, Path, CommitError)>> = Mutex::new(Vec::new());

        let mut executor = TaskExecutor::foreach(files.into_iter().enumerate());
        if let Some(pool) = pool {
            executor = executor.execute_with(pool);
        }
        let (loaded_ref, failures_ref) = (&loaded, &failures);
        let all_loaded = executor
            .run(|(index, path)| {
                async move {
                    let result = if aggregates {
                        self.load_pendingset(&path).await
                    } else {
                        self.load_single(&path)
                            .await
                            .map(|commit| Pendingset::from_commits(vec![commit]))
                    };
                    match result {
                        Ok(set) => {
                            lock(loaded_ref).push((index, set));
                            Ok(())
                        }
                        Err(err) => {
                            warn!(path = %path, "Failed to load commit record: {err}");
                            lock(failures_ref).push((index, path, err));
                            Err(())
                        }
                    }
                }
                .boxed()
            })
            .await;
        // Failures are collected above; without rethrow the batch never errs.
        if !matches!(all_loaded, Ok(true)) {
            debug!("Some commit records could not be loaded");
        }

        let mut loaded = loaded.into_inner().unwrap_or_else(|e| e.into_inner());
        loaded.sort_by_key(|(index, _)| *index);
        let mut failures = failures.into_inner().unwrap_or_else(|e| e.into_inner());
        failures.sort_by_key(|(index, _, _)| *index);

        let mut merged = Pendingset::new();
        for (_, set) in loaded {
            merged.extend(set);
        }
        let failures = failures
            .into_iter()
            .map(|(_, path, err)| (path, err))
            .collect();
        (merged, failures)
    }

    /// Abort every pending commit recorded under `dir` and delete the records.
    ///
    /// Record files are deleted whether or not their abort succeeded. The
    /// first failure is captured; it does not stop the sweep.
    pub async fn abort_all_pending(
        &self,
        dir: &Path,
        recursive: bool,
        pool: Option<&WorkerPool>,
    ) -> Outcome {
        let files = match self.locate_pending(dir, recursive).await {
            Ok(files) => files,
            Err(err) if err.kind() == ErrorKind::NotFound => return Outcome::success(),
            Err(err) => return Outcome::failure(err),
        };
        if files.is_empty() {
            debug!("No pending commits under {dir}");
            return Outcome::success();
        }
        info!("Aborting {} pending commits under {dir}", files.len());

        let first: Mutex<Option<(usize, CommitError)>> = Mutex::new(None);
        let first_ref = &first;
        let mut executor = TaskExecutor::foreach(files.into_iter().enumerate());
        if let Some(pool) = pool {
            executor = executor.execute_with(pool);
        }
        let all_aborted = executor
            .run(|(index, path)| {
                async move {
                    let aborted = match self.load_single(&path).await {
                        Ok(commit) => self.abort_single_commit(&commit).await,
                        Err(err) if err.kind() == ErrorKind::NotFound => {
                            // Already aborted and deleted by someone else.
                            debug!(path = %path, "Pending commit record is gone");
                            return Ok(());
                        }
                        Err(err) => Err(err),
                    };
                    let deleted = self.delete(&path).await;
                    match aborted.err().or(deleted.err()) {
                        Some(err) => {
                            warn!(path = %path, "Failed to abort pending commit: {err}");
                            let mut first = lock(first_ref);
                            if first.as_ref().is_none_or(|(seen, _)| index < *seen) {
                                *first = Some((index, err));
                            }
                            Err(())
                        }
                        None => Ok(()),
                    }
                }
                .boxed()
            })
            .await;
        if !matches!(all_aborted, Ok(true)) {
            debug!("Some pending commits under {dir} were not aborted");
        }

        match first.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some((_, err)) => Outcome::failure(err),
            None => Outcome::success(),
        }
    }

    /// Abort outstanding multipart uploads under `path`, whether or not a
    /// record points at them. Returns how many were aborted.
    pub async fn abort_pending_uploads_under(&self, path: &Path) -> Result<usize, CommitError> {
        let client = &self.client;
        let uploads = self
            .retry
            .run("list_uploads", Idempotency::Idempotent, || {
                client.list_uploads(path)
            })
            .await
            .context(StorageSnafu {
                operation: "list uploads",
                path: path.to_string(),
            })?;

        let mut aborted = 0;
        let mut first_failure = None;
        for upload in uploads {
            match self.abort_upload(&upload.path, &upload.upload_id).await {
                Ok(()) => {
                    aborted += 1;
                    emit!(CommitAborted);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(key = %upload.path, "Upload {} already gone", upload.upload_id);
                }
                Err(err) => {
                    warn!(key = %upload.path, "Failed to abort upload {}: {err}", upload.upload_id);
                    first_failure.get_or_insert(err);
                }
            }
        }
        if aborted > 0 {
            info!("Aborted {aborted} outstanding uploads under {path}");
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(aborted),
        }
    }

    // ============ Misc ============

    /// Write the success marker under `output`.
    pub async fn create_success_marker(
        &self,
        output: &Path,
        data: &SuccessData,
    ) -> Result<Path, CommitError> {
        let marker = output.child(SUCCESS_MARKER);
        let json = data.to_json()?;
        self.put(&marker, json).await?;
        info!("Wrote success marker {marker} listing {} files", data.filenames.len());
        Ok(marker)
    }

    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), CommitError> {
        let client = &self.client;
        self.retry
            .run("put", Idempotency::Idempotent, || {
                client.put(path, bytes.clone())
            })
            .await
            .context(StorageSnafu {
                operation: "put",
                path: path.to_string(),
            })
    }

    /// Create-only write; fails with kind `AlreadyExists` if `path` exists.
    pub async fn put_if_absent(&self, path: &Path, bytes: Bytes) -> Result<(), CommitError> {
        let client = &self.client;
        self.retry
            .run("put_if_absent", Idempotency::NotIdempotent, || {
                client.put_if_absent(path, bytes.clone())
            })
            .await
            .context(StorageSnafu {
                operation: "create",
                path: path.to_string(),
            })
    }

    pub async fn delete(&self, path: &Path) -> Result<(), CommitError> {
        let client = &self.client;
        self.retry
            .run("delete", Idempotency::Idempotent, || client.delete(path))
            .await
            .context(StorageSnafu {
                operation: "delete",
                path: path.to_string(),
            })
    }

    pub async fn list(&self, prefix: &Path, recursive: bool) -> Result<Vec<ObjectMeta>, CommitError> {
        let client = &self.client;
        self.retry
            .run("list", Idempotency::Idempotent, || client.list(prefix, recursive))
            .await
            .context(StorageSnafu {
                operation: "list",
                path: prefix.to_string(),
            })
    }

    /// Whether anything exists at or under `path`.
    pub async fn exists(&self, path: &Path) -> Result<bool, CommitError> {
        if !path.as_ref().is_empty() {
            let client = &self.client;
            let object = self
                .retry
                .run("head", Idempotency::Idempotent, || client.head(path))
                .await
                .context(StorageSnafu {
                    operation: "head",
                    path: path.to_string(),
                })?;
            if object.is_some() {
                return Ok(true);
            }
        }
        Ok(!self.list(path, true).await?.is_empty())
    }

    /// Delete everything under `path`, returning the number of objects removed.
    pub async fn delete_prefix(&self, path: &Path) -> Result<usize, CommitError> {
        let client = &self.client;
        self.retry
            .run("delete_prefix", Idempotency::Idempotent, || {
                client.delete_prefix(path)
            })
            .await
            .context(StorageSnafu {
                operation: "delete prefix",
                path: path.to_string(),
            })
    }

    /// [`delete_prefix`](Self::delete_prefix), logging instead of failing.
    pub async fn delete_prefix_quietly(&self, path: &Path) -> usize {
        match self.delete_prefix(path).await {
            Ok(count) => count,
            Err(err) => {
                warn!("Failed to delete {path}: {err}");
                0
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
