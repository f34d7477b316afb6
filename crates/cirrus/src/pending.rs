//! Persisted pending-commit records.
//!
//! A [`SinglePendingCommit`] points at one open multipart upload. A task's
//! records are folded into one [`Pendingset`] at task commit. Both are JSON.

use bytes::Bytes;
use chrono::Utc;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use cirrus_core::ObjectClient;

use crate::error::{CommitError, DeserializeSnafu, SerializeSnafu, StorageSnafu};

/// Suffix of a single pending-commit record.
pub const PENDING_SUFFIX: &str = ".pending";

/// Suffix of a task's aggregate record.
pub const PENDINGSET_SUFFIX: &str = ".pendingset";

/// Format version written into every record.
pub const RECORD_VERSION: u32 = 1;

fn current_version() -> u32 {
    RECORD_VERSION
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One deferred multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinglePendingCommit {
    #[serde(default = "current_version")]
    pub version: u32,
    pub bucket: String,
    pub destination_key: String,
    pub upload_id: String,
    /// Part tags in part-number order.
    pub etags: Vec<String>,
    pub length: u64,
    /// Epoch milliseconds.
    pub created: i64,
    /// Epoch milliseconds.
    #[serde(default)]
    pub saved: i64,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub task_id: String,
    /// Free-form annotation, e.g. `partition: date=2024-01-01`.
    #[serde(default)]
    pub text: String,
    /// Record file this commit was loaded from. Set on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl SinglePendingCommit {
    /// A record for an upload that has just finished writing parts.
    pub fn new(
        bucket: impl Into<String>,
        destination: &Path,
        upload_id: impl Into<String>,
        etags: Vec<String>,
        length: u64,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            bucket: bucket.into(),
            destination_key: destination.to_string(),
            upload_id: upload_id.into(),
            etags,
            length,
            created: now_millis(),
            saved: 0,
            job_id: String::new(),
            task_id: String::new(),
            text: String::new(),
            filename: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Destination as a store path.
    pub fn destination(&self) -> Path {
        Path::from(self.destination_key.as_str())
    }

    pub fn part_count(&self) -> usize {
        self.etags.len()
    }

    /// Stamp the owning job and task.
    pub fn bind(&mut self, job_id: &str, task_id: &str) {
        self.job_id = job_id.to_string();
        self.task_id = task_id.to_string();
    }

    /// Check the record is usable for commit or abort.
    pub fn validate(&self) -> Result<(), CommitError> {
        let invalid = |message: String| CommitError::invalid("pending commit", message);

        if self.version != RECORD_VERSION {
            return Err(invalid(format!("unsupported version {}", self.version)));
        }
        if self.destination_key.is_empty() {
            return Err(invalid("empty destination key".to_string()));
        }
        if self.upload_id.is_empty() {
            return Err(invalid(format!(
                "empty upload id for {}",
                self.destination_key
            )));
        }
        if self.etags.is_empty() {
            return Err(invalid(format!("no parts for {}", self.destination_key)));
        }
        if let Some(index) = self.etags.iter().position(String::is_empty) {
            return Err(invalid(format!(
                "empty tag for part {} of {}",
                index + 1,
                self.destination_key
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Bytes, CommitError> {
        serde_json::to_vec_pretty(self)
            .map(Bytes::from)
            .context(SerializeSnafu {
                path: self.destination_key.clone(),
            })
    }

    /// Parse and validate a record, remembering where it came from.
    pub fn from_json(bytes: &[u8], source: &str) -> Result<Self, CommitError> {
        let mut commit: Self =
            serde_json::from_slice(bytes).context(DeserializeSnafu { path: source })?;
        commit.validate()?;
        commit.filename = Some(source.to_string());
        Ok(commit)
    }

    /// Write the record, stamping the save time.
    pub async fn save(&mut self, client: &dyn ObjectClient, path: &Path) -> Result<(), CommitError> {
        self.saved = now_millis();
        let json = self.to_json()?;
        client.put(path, json).await.context(StorageSnafu {
            operation: "save pending commit",
            path: path.to_string(),
        })
    }

    pub async fn load(client: &dyn ObjectClient, path: &Path) -> Result<Self, CommitError> {
        let bytes = client.get(path).await.context(StorageSnafu {
            operation: "load pending commit",
            path: path.to_string(),
        })?;
        Self::from_json(&bytes, path.as_ref())
    }
}

/// The pending commits of one task attempt, or of a whole job once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pendingset {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub task_id: String,
    pub commits: Vec<SinglePendingCommit>,
    /// Where this set was loaded from.
    #[serde(skip)]
    pub source: Option<String>,
}

impl Pendingset {
    pub fn new() -> Self {
        Self {
            version: RECORD_VERSION,
            ..Default::default()
        }
    }

    pub fn from_commits(commits: Vec<SinglePendingCommit>) -> Self {
        Self {
            commits,
            ..Self::new()
        }
    }

    pub fn add(&mut self, commit: SinglePendingCommit) {
        self.commits.push(commit);
    }

    pub fn extend(&mut self, other: Pendingset) {
        self.commits.extend(other.commits);
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        self.commits.iter().map(|c| c.length).sum()
    }

    /// Stamp every record with the job and task.
    pub fn bind(&mut self, job_id: &str, task_id: &str) {
        self.job_id = job_id.to_string();
        self.task_id = task_id.to_string();
        for commit in &mut self.commits {
            commit.bind(job_id, task_id);
        }
    }

    pub fn validate(&self) -> Result<(), CommitError> {
        if self.version != RECORD_VERSION {
            return Err(CommitError::invalid(
                "pendingset",
                format!("unsupported version {}", self.version),
            ));
        }
        self.commits.iter().try_for_each(SinglePendingCommit::validate)
    }

    pub fn to_json(&self) -> Result<Bytes, CommitError> {
        serde_json::to_vec_pretty(self)
            .map(Bytes::from)
            .context(SerializeSnafu {
                path: self.task_id.clone(),
            })
    }

    pub fn from_json(bytes: &[u8], source: &str) -> Result<Self, CommitError> {
        let mut set: Self =
            serde_json::from_slice(bytes).context(DeserializeSnafu { path: source })?;
        set.validate()?;
        set.source = Some(source.to_string());
        Ok(set)
    }

    /// Persist with a create-only write; an existing set is never replaced.
    pub async fn save_new(
        &mut self,
        client: &dyn ObjectClient,
        path: &Path,
    ) -> Result<(), CommitError> {
        let now = now_millis();
        for commit in &mut self.commits {
            commit.saved = now;
        }
        let json = self.to_json()?;
        client.put_if_absent(path, json).await.context(StorageSnafu {
            operation: "save pendingset",
            path: path.to_string(),
        })
    }

    pub async fn load(client: &dyn ObjectClient, path: &Path) -> Result<Self, CommitError> {
        let bytes = client.get(path).await.context(StorageSnafu {
            operation: "load pendingset",
            path: path.to_string(),
        })?;
        Self::from_json(&bytes, path.as_ref())
    }
}
