//! Where job and task attempts keep their work.
//!
//! Two layouts exist. The magic layout keeps everything on the destination
//! store under `__magic`; tasks write through delayed-write paths. The
//! staging layout has tasks write local files that are uploaded at task
//! commit, with records kept on the job store.

use object_store::path::Path;
use std::path::PathBuf;

use crate::paths::{BASE, add_uuid, child_path, magic_dir};
use crate::pending::PENDINGSET_SUFFIX;

/// Identity of one attempt at running a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    /// Application attempt number, starting at 0.
    pub app_attempt: u32,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, app_attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            app_attempt,
        }
    }
}

/// Identity of one attempt at running a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAttemptContext {
    /// Logical task; shared by all attempts of it.
    pub task_id: String,
    /// This attempt.
    pub attempt_id: String,
}

impl TaskAttemptContext {
    pub fn new(task_id: impl Into<String>, attempt_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt_id: attempt_id.into(),
        }
    }
}

/// A task attempt's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAttemptDir {
    /// On the destination store.
    Store(Path),
    /// On local disk.
    Local(PathBuf),
}

pub trait AttemptLayout: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Directory holding the job attempt's task aggregates.
    fn job_attempt_path(&self, job: &JobContext) -> Path;

    fn task_attempt_dir(&self, job: &JobContext, task: &TaskAttemptContext) -> TaskAttemptDir;

    /// Whether tasks write through delayed-write paths on the destination.
    fn requires_delayed_write_support(&self) -> bool;

    /// Store directory removed wholesale at job cleanup.
    fn staging_root(&self) -> Path;

    /// Local directory removed at job cleanup, if any.
    fn local_job_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Final key of a file at `relative` under the output directory.
    fn destination_key(&self, output: &Path, relative: &str) -> Path {
        child_path(output, relative)
    }

    /// Where a task's aggregate record is saved. Keyed by the logical task,
    /// so all attempts of a task contend for the same path.
    fn pendingset_path(&self, job: &JobContext, task: &TaskAttemptContext) -> Path {
        self.job_attempt_path(job)
            .child(format!("{}{PENDINGSET_SUFFIX}", task.task_id))
    }
}

fn attempt_dir(app_attempt: u32) -> String {
    format!("app-attempt-{app_attempt:04}")
}

/// Work kept under `{output}/__magic` on the destination store.
#[derive(Debug, Clone)]
pub struct MagicLayout {
    output: Path,
}

impl MagicLayout {
    pub fn new(output: Path) -> Self {
        Self { output }
    }
}

impl AttemptLayout for MagicLayout {
    fn name(&self) -> &'static str {
        "magic"
    }

    fn job_attempt_path(&self, job: &JobContext) -> Path {
        magic_dir(&self.output).child(attempt_dir(job.app_attempt))
    }

    fn task_attempt_dir(&self, job: &JobContext, task: &TaskAttemptContext) -> TaskAttemptDir {
        TaskAttemptDir::Store(
            self.job_attempt_path(job)
                .child("tasks")
                .child(task.attempt_id.as_str())
                .child(BASE),
        )
    }

    fn requires_delayed_write_support(&self) -> bool {
        true
    }

    fn staging_root(&self) -> Path {
        magic_dir(&self.output)
    }
}

/// Local task output, uploaded at task commit.
#[derive(Debug, Clone)]
pub struct StagingLayout {
    /// Root of this job's records on the job store.
    job_root: Path,
    local_dir: PathBuf,
    upload_uuid: String,
    unique_filenames: bool,
}

impl StagingLayout {
    pub fn new(
        job_root: Path,
        local_dir: PathBuf,
        upload_uuid: impl Into<String>,
        unique_filenames: bool,
    ) -> Self {
        Self {
            job_root,
            local_dir,
            upload_uuid: upload_uuid.into(),
            unique_filenames,
        }
    }

    pub fn upload_uuid(&self) -> &str {
        &self.upload_uuid
    }
}

impl AttemptLayout for StagingLayout {
    fn name(&self) -> &'static str {
        "staging"
    }

    fn job_attempt_path(&self, job: &JobContext) -> Path {
        self.staging_root()
            .child("pending-uploads")
            .child(attempt_dir(job.app_attempt))
    }

    fn task_attempt_dir(&self, job: &JobContext, task: &TaskAttemptContext) -> TaskAttemptDir {
        TaskAttemptDir::Local(
            self.local_dir
                .join(&self.upload_uuid)
                .join("_temporary")
                .join(job.app_attempt.to_string())
                .join("_temporary")
                .join(&task.attempt_id),
        )
    }

    fn requires_delayed_write_support(&self) -> bool {
        false
    }

    fn staging_root(&self) -> Path {
        self.job_root.child(self.upload_uuid.as_str())
    }

    fn local_job_dir(&self) -> Option<PathBuf> {
        Some(self.local_dir.join(&self.upload_uuid))
    }

    fn destination_key(&self, output: &Path, relative: &str) -> Path {
        if self.unique_filenames {
            child_path(output, &add_uuid(relative, &self.upload_uuid))
        } else {
            child_path(output, relative)
        }
    }
}
