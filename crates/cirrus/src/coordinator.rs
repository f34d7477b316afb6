//! Job and task attempt lifecycle.
//!
//! Task attempts: `setup_task -> (writes) -> commit_task | abort_task`.
//! Job attempts: `setup_job -> tasks -> commit_job | abort_job`, with
//! cleanup of working directories after either.
//!
//! Job commit loads every task's pendingset, then completes every pending
//! upload on a worker pool scoped to that one call. If any completion fails,
//! uploads already completed are reverted (deleted), the rest are aborted,
//! and the first failure is returned.

use bytes::Bytes;
use futures::FutureExt;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use cirrus_core::emit;
use cirrus_core::metrics::events::{CompletionStatus, JobCompleted, TaskCompleted};
use cirrus_core::storage::is_under;
use cirrus_core::{ErrorKind, ObjectClientRef, Stopwatch};

use crate::config::{CommitterConfig, CommitterKind, ConflictMode};
use crate::error::{
    CommitError, DestinationExistsSnafu, DuplicateDestinationSnafu, DuplicateTaskCommitSnafu,
    JobAttemptExistsSnafu, LocalIoSnafu, RecoveryUnsupportedSnafu, UnsupportedByLayoutSnafu,
};
use crate::executor::{TaskExecutor, WorkerPool};
use crate::layout::{
    AttemptLayout, JobContext, MagicLayout, StagingLayout, TaskAttemptContext, TaskAttemptDir,
};
use crate::operations::{CommitOperations, CommitterStatistics, lock};
use crate::outcome::Outcome;
use crate::paths::{child_path, magic_dir};
use crate::pending::{Pendingset, SinglePendingCommit};
use crate::retry::RetryPolicy;
use crate::success::SuccessData;
use crate::tracker::write_object;

/// Marker created at job setup; its presence means the attempt is taken.
pub const JOB_MARKER: &str = "_job";

/// Drives one job attempt against one output directory.
#[derive(Debug)]
pub struct CommitCoordinator {
    output: Path,
    job: JobContext,
    config: CommitterConfig,
    upload_uuid: String,
    layout: Arc<dyn AttemptLayout>,
    /// Operations on the destination store.
    ops: CommitOperations,
    /// Operations on the store holding job and task records.
    job_ops: CommitOperations,
}

impl CommitCoordinator {
    /// A coordinator keeping its records on the destination store.
    ///
    /// The staging layout keeps them under `{output}/__magic/{uuid}`.
    pub fn new(
        destination: ObjectClientRef,
        output: Path,
        job: JobContext,
        config: CommitterConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let ops = CommitOperations::new(destination, retry);
        let upload_uuid = config
            .staging
            .upload_uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let layout = build_layout(&config, &output, magic_dir(&output), &upload_uuid);
        info!(
            job = %job.job_id,
            committer = layout.name(),
            "Created committer for {output}"
        );
        Self {
            output,
            job,
            config,
            upload_uuid,
            layout,
            job_ops: ops.clone(),
            ops,
        }
    }

    /// Keep job and task records on a separate store, under `root`.
    ///
    /// Only the staging layout supports this; the magic layout keeps its
    /// records next to the output.
    pub fn with_job_store(mut self, client: ObjectClientRef, root: Path) -> Result<Self, CommitError> {
        ensure!(
            self.config.committer == CommitterKind::Staging,
            UnsupportedByLayoutSnafu {
                operation: "a separate job store",
                layout: self.layout.name(),
            }
        );
        self.job_ops = CommitOperations::new(client, self.ops.retry_policy().clone())
            .with_statistics(self.ops.statistics().clone());
        self.layout = build_layout(&self.config, &self.output, root, &self.upload_uuid);
        Ok(self)
    }

    /// Replace the retry policy on both stores.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        let stats = self.ops.statistics().clone();
        self.ops = CommitOperations::new(self.ops.client().clone(), retry.clone())
            .with_statistics(stats.clone());
        self.job_ops =
            CommitOperations::new(self.job_ops.client().clone(), retry).with_statistics(stats);
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn layout(&self) -> &dyn AttemptLayout {
        self.layout.as_ref()
    }

    pub fn operations(&self) -> &CommitOperations {
        &self.ops
    }

    pub fn statistics(&self) -> &Arc<CommitterStatistics> {
        self.ops.statistics()
    }

    pub fn upload_uuid(&self) -> &str {
        &self.upload_uuid
    }

    pub fn job_attempt_path(&self) -> Path {
        self.layout.job_attempt_path(&self.job)
    }

    pub fn task_attempt_dir(&self, task: &TaskAttemptContext) -> TaskAttemptDir {
        self.layout.task_attempt_dir(&self.job, task)
    }

    // ============ Job setup ============

    /// Claim the job attempt directory, checking the destination first when
    /// the conflict mode is `fail`.
    pub async fn setup_job(&self) -> Result<(), CommitError> {
        let _timer = Stopwatch::start(format!("Setup job {}", self.job.job_id));

        if self.config.conflict_mode == ConflictMode::Fail {
            self.fail_if_destination_exists().await?;
        }

        let attempt = self.job_attempt_path();
        let marker = attempt.child(JOB_MARKER);
        match self
            .job_ops
            .put_if_absent(&marker, Bytes::from(self.job.job_id.clone()))
            .await
        {
            Ok(()) => {
                info!(job = %self.job.job_id, "Job attempt directory is {attempt}");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => JobAttemptExistsSnafu {
                path: attempt.to_string(),
            }
            .fail(),
            Err(err) => Err(err),
        }
    }

    // ============ Task attempts ============

    pub async fn setup_task(&self, task: &TaskAttemptContext) -> Result<(), CommitError> {
        match self.task_attempt_dir(task) {
            TaskAttemptDir::Store(dir) => {
                // Store directories exist once something is written under them.
                debug!(task = %task.attempt_id, "Task attempt directory is {dir}");
                Ok(())
            }
            TaskAttemptDir::Local(dir) => {
                debug!(task = %task.attempt_id, "Task attempt directory is {}", dir.display());
                tokio::fs::create_dir_all(&dir)
                    .await
                    .context(LocalIoSnafu { path: dir })
            }
        }
    }

    /// Whether the task attempt directory exists.
    pub async fn needs_task_commit(&self, task: &TaskAttemptContext) -> Result<bool, CommitError> {
        match self.task_attempt_dir(task) {
            TaskAttemptDir::Store(dir) => self.ops.exists(&dir).await,
            TaskAttemptDir::Local(dir) => tokio::fs::try_exists(&dir)
                .await
                .context(LocalIoSnafu { path: dir }),
        }
    }

    /// Write one output file of a task attempt, at `relative` under the
    /// output directory once committed.
    pub async fn write_task_file(
        &self,
        task: &TaskAttemptContext,
        relative: &str,
        payload: Bytes,
    ) -> Result<(), CommitError> {
        match self.task_attempt_dir(task) {
            TaskAttemptDir::Store(dir) => {
                let path = child_path(&dir, relative);
                write_object(&self.ops, &path, payload, self.config.part_size).await?;
                Ok(())
            }
            TaskAttemptDir::Local(dir) => {
                let path = relative
                    .split('/')
                    .filter(|e| !e.is_empty())
                    .fold(dir, |path, element| path.join(element));
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context(LocalIoSnafu { path: parent })?;
                }
                tokio::fs::write(&path, &payload)
                    .await
                    .context(LocalIoSnafu { path })
            }
        }
    }

    /// Gather the task's pending uploads into one pendingset.
    ///
    /// If any record fails to load or the pendingset cannot be saved, every
    /// upload the task created is aborted.
    pub async fn commit_task(&self, task: &TaskAttemptContext) -> Result<(), CommitError> {
        let _timer = Stopwatch::start(format!("Commit task {}", task.attempt_id));
        let result = match self.task_attempt_dir(task) {
            TaskAttemptDir::Store(dir) => self.commit_store_task(task, &dir).await,
            TaskAttemptDir::Local(dir) => self.commit_local_task(task, &dir).await,
        };

        let status = match &result {
            Ok(()) => CompletionStatus::Committed,
            Err(err) => {
                error!(task = %task.attempt_id, "Task commit failed: {err}");
                CompletionStatus::Failed
            }
        };
        self.statistics().task_finished(result.is_ok());
        emit!(TaskCompleted { status });
        result
    }

    async fn commit_store_task(&self, task: &TaskAttemptContext, dir: &Path) -> Result<(), CommitError> {
        let (loaded, failures) = self.ops.load_pending(dir, true, None).await?;
        if let Some((path, err)) = failures.into_iter().next() {
            warn!(
                task = %task.attempt_id,
                "Failed to load {path}, aborting {} loaded commits",
                loaded.len()
            );
            self.abort_commits(&loaded.commits).await;
            return Err(err);
        }

        info!(task = %task.attempt_id, "Committing {} files", loaded.len());
        self.save_pendingset(task, loaded).await?;
        self.ops.delete_prefix_quietly(dir).await;
        Ok(())
    }

    async fn commit_local_task(
        &self,
        task: &TaskAttemptContext,
        dir: &std::path::Path,
    ) -> Result<(), CommitError> {
        let files = match tokio::fs::try_exists(dir).await {
            Ok(true) => local_files(dir).await?,
            _ => Vec::new(),
        };
        info!(task = %task.attempt_id, "Uploading {} files", files.len());

        let created: Mutex<Vec<(usize, SinglePendingCommit)>> = Mutex::new(Vec::new());
        let pool = WorkerPool::new(self.config.threads);
        let uploaded = TaskExecutor::foreach(files.into_iter().enumerate())
            .execute_with(&pool)
            .stop_on_failure()
            .throw_failure_when_finished()
            .run(|(index, (local, relative))| {
                let created = &created;
                async move {
                    let destination = self.layout.destination_key(&self.output, &relative);
                    let partition = relative.rsplit_once('/').map(|(parent, _)| parent);
                    let commit = self
                        .ops
                        .upload_file_to_pending_commit(
                            &local,
                            &destination,
                            partition,
                            self.config.part_size,
                        )
                        .await?;
                    lock(created).push((index, commit));
                    Ok::<(), CommitError>(())
                }
                .boxed()
            })
            .await;
        pool.shutdown();

        let mut created = created.into_inner().unwrap_or_else(|e| e.into_inner());
        created.sort_by_key(|(index, _)| *index);
        let commits: Vec<SinglePendingCommit> =
            created.into_iter().map(|(_, commit)| commit).collect();

        if let Err(err) = uploaded {
            self.abort_commits(&commits).await;
            return Err(err);
        }

        self.save_pendingset(task, Pendingset::from_commits(commits))
            .await?;
        if let Err(err) = tokio::fs::remove_dir_all(dir).await {
            warn!("Failed to delete {}: {err}", dir.display());
        }
        Ok(())
    }

    /// Persist the task's pendingset; the first attempt of a task to get
    /// here wins.
    async fn save_pendingset(
        &self,
        task: &TaskAttemptContext,
        mut pending: Pendingset,
    ) -> Result<(), CommitError> {
        pending.bind(&self.job.job_id, &task.task_id);
        let path = self.layout.pendingset_path(&self.job, task);

        if let Err(err) = pending.save_new(self.job_ops.client().as_ref(), &path).await {
            warn!(
                task = %task.attempt_id,
                "Failed to save {path}, aborting {} commits: {err}",
                pending.len()
            );
            self.abort_commits(&pending.commits).await;
            return match err.kind() {
                ErrorKind::AlreadyExists => DuplicateTaskCommitSnafu {
                    task: task.task_id.clone(),
                    path: path.to_string(),
                }
                .fail(),
                _ => Err(err),
            };
        }
        info!(
            task = %task.attempt_id,
            "Saved {} pending commits ({} bytes) to {path}",
            pending.len(),
            pending.total_length()
        );
        Ok(())
    }

    /// Abort what the task left pending and delete its directory.
    pub async fn abort_task(&self, task: &TaskAttemptContext) -> Result<(), CommitError> {
        let _timer = Stopwatch::start(format!("Abort task {}", task.attempt_id));
        let outcome = match self.task_attempt_dir(task) {
            TaskAttemptDir::Store(dir) => {
                let outcome = self.ops.abort_all_pending(&dir, true, None).await;
                self.ops.delete_prefix_quietly(&dir).await;
                outcome
            }
            TaskAttemptDir::Local(dir) => {
                // Nothing is uploaded before task commit.
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("Failed to delete {}: {err}", dir.display()),
                }
                Outcome::success()
            }
        };
        self.statistics().task_finished(false);
        emit!(TaskCompleted {
            status: CompletionStatus::Aborted
        });
        outcome.into_result()
    }

    /// Tasks are never recovered after a restart; they must be re-run.
    pub async fn recover_task(&self, task: &TaskAttemptContext) -> Result<(), CommitError> {
        warn!(task = %task.attempt_id, "Task recovery requested");
        RecoveryUnsupportedSnafu {
            task: task.attempt_id.clone(),
        }
        .fail()
    }

    // ============ Job commit ============

    /// Complete every pending upload of the job and write the success marker.
    ///
    /// Working directories are cleaned up whatever the result.
    pub async fn commit_job(&self) -> Result<(), CommitError> {
        let timer = Stopwatch::start(format!("Commit job {}", self.job.job_id));
        let pool = WorkerPool::new(self.config.threads);
        let result = self.commit_job_with(&pool).await;
        pool.shutdown();
        self.cleanup().await;

        let status = match &result {
            Ok(()) => CompletionStatus::Committed,
            Err(err) => {
                error!(job = %self.job.job_id, "Job commit failed: {err}");
                CompletionStatus::Failed
            }
        };
        self.statistics().job_finished(result.is_ok());
        emit!(JobCompleted {
            status,
            duration: timer.elapsed(),
        });
        result
    }

    async fn commit_job_with(&self, pool: &WorkerPool) -> Result<(), CommitError> {
        let pending = match self.precommit(pool).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(job = %self.job.job_id, "Precommit failed, aborting job: {err}");
                if let Err(abort_err) = self.abort_job_uploads(pool).await.into_result() {
                    warn!(job = %self.job.job_id, "Abort after failed precommit failed: {abort_err}");
                }
                return Err(err);
            }
        };

        info!(
            job = %self.job.job_id,
            "Committing {} files ({} bytes)",
            pending.len(),
            pending.total_length()
        );
        self.commit_pending(pool, &pending.commits).await?;

        if self.config.success_marker {
            self.write_success_marker(&pending).await?;
        }
        Ok(())
    }

    /// Load every task's pendingset and resolve destination conflicts.
    async fn precommit(&self, pool: &WorkerPool) -> Result<Pendingset, CommitError> {
        let _timer = Stopwatch::start("Precommit");
        let (pending, failures) = self
            .job_ops
            .load_pendingsets(&self.job_attempt_path(), Some(pool))
            .await?;
        if let Some((path, err)) = failures.into_iter().next() {
            warn!("Failed to load pendingset {path}");
            return Err(err);
        }
        check_unique_destinations(&pending)?;

        match self.config.conflict_mode {
            ConflictMode::Fail => self.fail_if_destination_exists().await?,
            ConflictMode::Replace => self.replace_destination(pool).await?,
            ConflictMode::Append => {}
        }
        Ok(pending)
    }

    async fn commit_pending(
        &self,
        pool: &WorkerPool,
        commits: &[SinglePendingCommit],
    ) -> Result<(), CommitError> {
        let _timer = Stopwatch::start(format!("Committing {} files", commits.len()));
        TaskExecutor::foreach(commits)
            .execute_with(pool)
            .stop_on_failure()
            .throw_failure_when_finished()
            .on_failure(|commit, err: &CommitError| {
                warn!(key = %commit.destination_key, "Commit failed: {err}");
                async {}.boxed()
            })
            // Failed and never-started records alike.
            .abort_with(|commit| self.abort_quietly(commit).boxed())
            .revert_with(|commit| {
                async move {
                    if let Err(err) = self.ops.revert_commit(commit).await {
                        warn!(key = %commit.destination_key, "Failed to revert: {err}");
                    }
                }
                .boxed()
            })
            .run(|commit| async move { self.ops.commit(commit).await.into_result() }.boxed())
            .await
            .map(|_| ())
    }

    async fn abort_quietly(&self, commit: &SinglePendingCommit) {
        if let Err(err) = self.ops.abort_single_commit(commit).await {
            warn!(key = %commit.destination_key, "Failed to abort: {err}");
        }
    }

    async fn abort_commits(&self, commits: &[SinglePendingCommit]) {
        for commit in commits {
            self.abort_quietly(commit).await;
        }
    }

    async fn write_success_marker(&self, pending: &Pendingset) -> Result<(), CommitError> {
        let name = self.layout.name();
        let mut data = SuccessData::new(name, &self.job.job_id).with_description(format!(
            "Job {} committed by the {name} committer",
            self.job.job_id
        ));
        data.add_filenames(pending.commits.iter().map(|c| c.destination_key.as_str()));
        data.add_diagnostic("committer", self.config.committer.as_str());
        data.add_diagnostic("layout", name);
        data.add_diagnostic("threads", self.config.threads.to_string());
        data.add_diagnostic("conflict_mode", self.config.conflict_mode.as_str());
        data.metrics = self.statistics().snapshot();
        self.ops.create_success_marker(&self.output, &data).await?;
        Ok(())
    }

    // ============ Destination conflicts ============

    /// Objects under the output directory, ignoring working directories.
    async fn existing_output(&self) -> Result<Vec<Path>, CommitError> {
        let magic = magic_dir(&self.output);
        let staging = self.layout.staging_root();
        Ok(self
            .ops
            .list(&self.output, true)
            .await?
            .into_iter()
            .map(|meta| meta.location)
            .filter(|path| !is_under(path, &magic) && !is_under(path, &staging))
            .collect())
    }

    async fn fail_if_destination_exists(&self) -> Result<(), CommitError> {
        let existing = self.existing_output().await?;
        ensure!(
            existing.is_empty(),
            DestinationExistsSnafu {
                path: self.output.to_string()
            }
        );
        Ok(())
    }

    async fn replace_destination(&self, pool: &WorkerPool) -> Result<(), CommitError> {
        let existing = self.existing_output().await?;
        if existing.is_empty() {
            return Ok(());
        }
        info!("Replacing {} existing objects under {}", existing.len(), self.output);
        TaskExecutor::foreach(existing)
            .execute_with(pool)
            .throw_failure_when_finished()
            .run(|path| async move { self.ops.delete(&path).await }.boxed())
            .await
            .map(|_| ())
    }

    // ============ Job abort ============

    /// Abort every upload of the job attempt, then clean up.
    ///
    /// Every step runs; the first failure is returned once cleanup is done.
    pub async fn abort_job(&self) -> Result<(), CommitError> {
        let timer = Stopwatch::start(format!("Abort job {}", self.job.job_id));
        let pool = WorkerPool::new(self.config.threads);
        let outcome = self.abort_job_uploads(&pool).await;
        pool.shutdown();
        self.cleanup().await;

        self.statistics().job_finished(false);
        emit!(JobCompleted {
            status: CompletionStatus::Aborted,
            duration: timer.elapsed(),
        });
        outcome.into_result()
    }

    async fn abort_job_uploads(&self, pool: &WorkerPool) -> Outcome {
        let mut outcome = Outcome::success();
        let attempt = self.job_attempt_path();

        match self.job_ops.load_pendingsets(&attempt, Some(pool)).await {
            Ok((pending, failures)) => {
                for (path, err) in failures {
                    warn!("Cannot abort commits in unreadable {path}: {err}");
                    outcome = outcome.or_capture(err);
                }
                info!(job = %self.job.job_id, "Aborting {} pending commits", pending.len());
                let aborted = TaskExecutor::foreach(&pending.commits)
                    .execute_with(pool)
                    .throw_failure_when_finished()
                    .run(|commit| self.ops.abort_single_commit(commit).boxed())
                    .await;
                if let Err(err) = aborted {
                    outcome = outcome.or_capture(err);
                }
            }
            Err(err) => {
                warn!("Failed to list pendingsets under {attempt}: {err}");
                outcome = outcome.or_capture(err);
            }
        }

        // Uncommitted task attempts still hold single records.
        if self.layout.requires_delayed_write_support() {
            let swept = self.ops.abort_all_pending(&attempt, true, Some(pool)).await;
            if let Err(err) = swept.into_result() {
                outcome = outcome.or_capture(err);
            }
        }

        match self.ops.abort_pending_uploads_under(&self.output).await {
            Ok(0) => {}
            Ok(count) => info!("Aborted {count} orphaned uploads under {}", self.output),
            Err(err) => outcome = outcome.or_capture(err),
        }
        outcome
    }

    /// Delete the job's working directories. Failures are logged only.
    pub async fn cleanup(&self) {
        let root = self.layout.staging_root();
        let deleted = self.job_ops.delete_prefix_quietly(&root).await;
        debug!("Deleted {deleted} objects under {root}");

        if let Some(local) = self.layout.local_job_dir() {
            match tokio::fs::remove_dir_all(&local).await {
                Ok(()) => debug!("Deleted {}", local.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to delete {}: {err}", local.display()),
            }
        }
    }
}

fn build_layout(
    config: &CommitterConfig,
    output: &Path,
    job_root: Path,
    upload_uuid: &str,
) -> Arc<dyn AttemptLayout> {
    match config.committer {
        CommitterKind::Magic => Arc::new(MagicLayout::new(output.clone())),
        CommitterKind::Staging => Arc::new(StagingLayout::new(
            job_root,
            config.staging.local_dir.clone(),
            upload_uuid,
            config.staging.unique_filenames,
        )),
    }
}

/// Two records finalizing the same key would silently overwrite each other.
fn check_unique_destinations(pending: &Pendingset) -> Result<(), CommitError> {
    let mut seen: HashMap<&str, &SinglePendingCommit> = HashMap::new();
    for commit in &pending.commits {
        if let Some(first) = seen.insert(commit.destination_key.as_str(), commit) {
            return DuplicateDestinationSnafu {
                key: commit.destination_key.clone(),
                first: first.task_id.clone(),
                second: commit.task_id.clone(),
            }
            .fail();
        }
    }
    Ok(())
}

/// Visible files under `root` with their `/`-separated relative paths,
/// sorted. Names starting with `.` or `_` are skipped.
async fn local_files(root: &std::path::Path) -> Result<Vec<(PathBuf, String)>, CommitError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(LocalIoSnafu { path: &dir })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(LocalIoSnafu { path: &dir })?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .context(LocalIoSnafu { path: &path })?;
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((path, relative));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::{ObjectClient, StorageProvider};
    use tempfile::TempDir;

    async fn store(name: &str) -> ObjectClientRef {
        Arc::new(
            StorageProvider::for_url(&format!("memory://{name}"))
                .await
                .unwrap(),
        )
    }

    fn magic_config() -> CommitterConfig {
        CommitterConfig {
            threads: 0,
            part_size: 100,
            ..CommitterConfig::default()
        }
    }

    fn staging_config(local: &TempDir) -> CommitterConfig {
        let mut config = magic_config();
        config.committer = CommitterKind::Staging;
        config.staging.local_dir = local.path().to_path_buf();
        config.staging.upload_uuid = Some("u1".to_string());
        config
    }

    fn task(n: usize, attempt: usize) -> TaskAttemptContext {
        TaskAttemptContext::new(format!("task_{n:02}"), format!("attempt_{n:02}_{attempt}"))
    }

    #[tokio::test]
    async fn test_magic_job_end_to_end() {
        let client = store("coord-magic-e2e").await;
        let coordinator = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        coordinator.setup_job().await.unwrap();

        let t1 = task(1, 0);
        coordinator.setup_task(&t1).await.unwrap();
        assert!(!coordinator.needs_task_commit(&t1).await.unwrap());
        coordinator
            .write_task_file(&t1, "d=1/part-0000", Bytes::from(vec![1u8; 250]))
            .await
            .unwrap();
        assert!(coordinator.needs_task_commit(&t1).await.unwrap());
        coordinator.commit_task(&t1).await.unwrap();
        assert!(!coordinator.needs_task_commit(&t1).await.unwrap());

        assert!(client.head(&Path::from("out/d=1/part-0000")).await.unwrap().is_none());
        coordinator.commit_job().await.unwrap();

        assert_eq!(
            client.get(&Path::from("out/d=1/part-0000")).await.unwrap().len(),
            250
        );
        let marker = SuccessData::load(client.as_ref(), &Path::from("out/_SUCCESS"))
            .await
            .unwrap();
        assert_eq!(marker.committer, "magic");
        assert_eq!(marker.filenames, vec!["out/d=1/part-0000".to_string()]);
        assert_eq!(marker.diagnostics["conflict_mode"], "append");
        assert!(client.list(&Path::from("out/__magic"), true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setup_job_twice_fails() {
        let client = store("coord-setup-twice").await;
        let coordinator = CommitCoordinator::new(
            client,
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        coordinator.setup_job().await.unwrap();
        let err = coordinator.setup_job().await.unwrap_err();
        assert!(matches!(err, CommitError::JobAttemptExists { .. }));
    }

    #[tokio::test]
    async fn test_conflict_fail_at_setup() {
        let client = store("coord-conflict-fail").await;
        client
            .put(&Path::from("out/existing"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        let config = CommitterConfig {
            conflict_mode: ConflictMode::Fail,
            ..magic_config()
        };
        let coordinator =
            CommitCoordinator::new(client, Path::from("out"), JobContext::new("job-1", 0), config);
        let err = coordinator.setup_job().await.unwrap_err();
        assert!(matches!(err, CommitError::DestinationExists { .. }));
    }

    #[tokio::test]
    async fn test_second_attempt_of_task_loses() {
        let client = store("coord-duplicate-task").await;
        let coordinator = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        coordinator.setup_job().await.unwrap();

        let first = task(1, 0);
        let second = task(1, 1);
        for attempt in [&first, &second] {
            coordinator.setup_task(attempt).await.unwrap();
            coordinator
                .write_task_file(attempt, "part-0000", Bytes::from_static(b"data"))
                .await
                .unwrap();
        }
        coordinator.commit_task(&first).await.unwrap();
        let err = coordinator.commit_task(&second).await.unwrap_err();
        assert!(matches!(err, CommitError::DuplicateTaskCommit { .. }));

        // Only the winner's upload is still open.
        assert_eq!(client.list_uploads(&Path::from("out")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_task_aborts_uploads() {
        let client = store("coord-abort-task").await;
        let coordinator = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        let t1 = task(1, 0);
        coordinator
            .write_task_file(&t1, "a", Bytes::from_static(b"a"))
            .await
            .unwrap();
        coordinator.abort_task(&t1).await.unwrap();

        assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
        assert!(!coordinator.needs_task_commit(&t1).await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_job_sweeps_everything() {
        let client = store("coord-abort-job").await;
        let coordinator = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        coordinator.setup_job().await.unwrap();
        let (committed, running) = (task(1, 0), task(2, 0));
        for t in [&committed, &running] {
            coordinator
                .write_task_file(t, "f", Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        coordinator.commit_task(&committed).await.unwrap();
        // An orphan with no record at all.
        client.initiate_upload(&Path::from("out/orphan")).await.unwrap();

        coordinator.abort_job().await.unwrap();
        assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
        assert!(client.list(&Path::from("out"), true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_task_is_unsupported() {
        let coordinator = CommitCoordinator::new(
            store("coord-recover").await,
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        let err = coordinator.recover_task(&task(1, 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_staging_job_end_to_end() {
        let local = TempDir::new().unwrap();
        let client = store("coord-staging-e2e").await;
        let coordinator = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            staging_config(&local),
        );
        coordinator.setup_job().await.unwrap();

        let t1 = task(1, 0);
        coordinator.setup_task(&t1).await.unwrap();
        assert!(coordinator.needs_task_commit(&t1).await.unwrap());
        coordinator
            .write_task_file(&t1, "d=1/part-0000.csv", Bytes::from(vec![0u8; 120]))
            .await
            .unwrap();
        coordinator
            .write_task_file(&t1, "_hidden", Bytes::from_static(b"skip"))
            .await
            .unwrap();
        coordinator.commit_task(&t1).await.unwrap();
        assert!(!coordinator.needs_task_commit(&t1).await.unwrap());

        coordinator.commit_job().await.unwrap();
        let committed = Path::from("out/d=1/part-0000-u1.csv");
        assert_eq!(client.get(&committed).await.unwrap().len(), 120);
        assert!(client.head(&Path::from("out/_hidden")).await.unwrap().is_none());
        assert!(!local.path().join("u1").exists());
        assert!(client.list(&Path::from("out/__magic"), true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_separate_job_store_only_for_staging() {
        let client = store("coord-job-store").await;
        let magic = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            magic_config(),
        );
        assert!(magic.with_job_store(client.clone(), Path::from("jobs")).is_err());

        let local = TempDir::new().unwrap();
        let staging = CommitCoordinator::new(
            client.clone(),
            Path::from("out"),
            JobContext::new("job-1", 0),
            staging_config(&local),
        )
        .with_job_store(client, Path::from("jobs"))
        .unwrap();
        assert_eq!(
            staging.job_attempt_path(),
            Path::from("jobs/u1/pending-uploads/app-attempt-0000")
        );
    }

    #[test]
    fn test_duplicate_destinations_rejected() {
        let commit = |task: &str| {
            let mut c = SinglePendingCommit::new(
                "b",
                &Path::from("out/same"),
                format!("id-{task}"),
                vec!["t".to_string()],
                1,
            );
            c.bind("job", task);
            c
        };
        let set = Pendingset::from_commits(vec![commit("t1"), commit("t2")]);
        let err = check_unique_destinations(&set).unwrap_err();
        assert!(err.to_string().contains("t1 and t2"));
    }
}
