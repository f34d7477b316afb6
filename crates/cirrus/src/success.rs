//! The `_SUCCESS` marker written at job commit.
//!
//! Unlike an empty marker, this one is JSON describing the committed job,
//! which lets tests and tools check which committer produced the output.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::BTreeMap;

use cirrus_core::ObjectClient;

use crate::error::{CommitError, DeserializeSnafu, SerializeSnafu, StorageSnafu};

/// Identifies the marker format.
pub const SUCCESS_NAME: &str = "cirrus.commit.SuccessData/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessData {
    pub name: String,
    pub committer: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub job_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub date: String,
    /// Every destination key committed.
    #[serde(default)]
    pub filenames: Vec<String>,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
}

impl SuccessData {
    pub fn new(committer: impl Into<String>, job_id: impl Into<String>) -> Self {
        let now: DateTime<Utc> = Utc::now();
        Self {
            name: SUCCESS_NAME.to_string(),
            committer: committer.into(),
            description: String::new(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            job_id: job_id.into(),
            timestamp: now.timestamp_millis(),
            date: now.to_rfc2822(),
            filenames: Vec::new(),
            diagnostics: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn add_filenames<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        self.filenames.extend(names.into_iter().map(str::to_string));
    }

    pub fn add_diagnostic(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.diagnostics.insert(key.into(), value.into());
    }

    pub fn to_json(&self) -> Result<Bytes, CommitError> {
        serde_json::to_vec_pretty(self)
            .map(Bytes::from)
            .context(SerializeSnafu { path: "_SUCCESS" })
    }

    pub fn from_json(bytes: &[u8], source: &str) -> Result<Self, CommitError> {
        let data: Self = serde_json::from_slice(bytes).context(DeserializeSnafu { path: source })?;
        ensure!(
            data.name == SUCCESS_NAME,
            crate::error::ValidationSnafu {
                what: "success marker",
                message: format!("{source} has unexpected name '{}'", data.name),
            }
        );
        Ok(data)
    }

    /// Read a marker; an empty marker is reported as invalid.
    pub async fn load(client: &dyn ObjectClient, path: &Path) -> Result<Self, CommitError> {
        let bytes = client.get(path).await.context(StorageSnafu {
            operation: "load success marker",
            path: path.to_string(),
        })?;
        ensure!(
            !bytes.is_empty(),
            crate::error::ValidationSnafu {
                what: "success marker",
                message: format!("{path} is empty"),
            }
        );
        Self::from_json(&bytes, path.as_ref())
    }
}
