//! Committer configuration.
//!
//! Loaded from YAML with `${VAR}` interpolation, e.g.
//!
//! ```yaml
//! committer: magic
//! threads: 8
//! conflict_mode: replace
//! part_size: 67108864
//! retry:
//!   limit: 7
//!   interval_ms: 500
//! ```

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cirrus_core::MB;
use cirrus_core::error::{ConfigError, InvalidSnafu};

use crate::error::{CommitError, UnknownCommitterSnafu};

/// Upper bound on the worker pool size.
pub const MAX_THREADS: usize = 1024;

/// Which attempt layout the committer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitterKind {
    /// Tasks write through the `__magic` path on the destination store.
    Magic,
    /// Tasks write to local disk and upload at task commit.
    Staging,
}

impl CommitterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitterKind::Magic => "magic",
            CommitterKind::Staging => "staging",
        }
    }
}

impl std::str::FromStr for CommitterKind {
    type Err = CommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "magic" => Ok(CommitterKind::Magic),
            "staging" | "directory" => Ok(CommitterKind::Staging),
            other => UnknownCommitterSnafu { name: other }.fail(),
        }
    }
}

/// Behaviour when the destination already has content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Fail job setup and job commit if the destination exists.
    Fail,
    /// Write alongside existing content.
    #[default]
    Append,
    /// Delete existing content at job commit, once every task's output loaded.
    Replace,
}

impl ConflictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictMode::Fail => "fail",
            ConflictMode::Append => "append",
            ConflictMode::Replace => "replace",
        }
    }
}

/// Retry settings for store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retries per operation.
    #[serde(default = "default_retry_limit")]
    pub limit: usize,
    /// Base delay between attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,
    /// Random spread applied to backoff delays, as a fraction.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            interval_ms: default_retry_interval_ms(),
            jitter: 0.0,
        }
    }
}

fn default_retry_limit() -> usize {
    7
}

fn default_retry_interval_ms() -> u64 {
    500
}

/// Settings for the staging layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingConfig {
    /// Root of local task attempt directories.
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    /// Identifier woven into staging paths and file names. Random if unset.
    #[serde(default)]
    pub upload_uuid: Option<String>,
    /// Insert the upload identifier into destination file names.
    #[serde(default = "default_true")]
    pub unique_filenames: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            local_dir: default_local_dir(),
            upload_uuid: None,
            unique_filenames: true,
        }
    }
}

fn default_local_dir() -> PathBuf {
    std::env::temp_dir().join("cirrus")
}

fn default_true() -> bool {
    true
}

/// Top-level committer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitterConfig {
    #[serde(default = "default_committer")]
    pub committer: CommitterKind,
    /// Worker pool size for job commit and abort; 0 runs everything inline.
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub conflict_mode: ConflictMode,
    /// Part size for uploading local files.
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Write `_SUCCESS` on job commit.
    #[serde(default = "default_true")]
    pub success_marker: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    /// Options passed to the object store builder.
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

fn default_committer() -> CommitterKind {
    CommitterKind::Magic
}

fn default_threads() -> usize {
    8
}

fn default_part_size() -> usize {
    64 * MB
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            committer: default_committer(),
            threads: default_threads(),
            conflict_mode: ConflictMode::default(),
            part_size: default_part_size(),
            success_marker: true,
            retry: RetryConfig::default(),
            staging: StagingConfig::default(),
            storage_options: HashMap::new(),
        }
    }
}

impl CommitterConfig {
    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = cirrus_core::parse_yaml(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = cirrus_core::load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.threads <= MAX_THREADS,
            InvalidSnafu {
                field: "threads",
                message: format!("{} exceeds the maximum of {MAX_THREADS}", self.threads),
            }
        );
        ensure!(
            self.part_size > 0,
            InvalidSnafu {
                field: "part_size",
                message: "must be positive",
            }
        );
        ensure!(
            (0.0..=1.0).contains(&self.retry.jitter),
            InvalidSnafu {
                field: "retry.jitter",
                message: format!("{} is outside 0.0..=1.0", self.retry.jitter),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CommitterConfig::from_yaml("{}").unwrap();
        assert_eq!(config.committer, CommitterKind::Magic);
        assert_eq!(config.threads, 8);
        assert_eq!(config.conflict_mode, ConflictMode::Append);
        assert_eq!(config.part_size, 64 * MB);
        assert!(config.success_marker);
        assert_eq!(config.retry.limit, 7);
        assert!(config.staging.unique_filenames);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
committer: staging
threads: 0
conflict_mode: replace
part_size: 100
success_marker: false
retry:
  limit: 2
  interval_ms: 5
staging:
  local_dir: /var/tmp/cirrus
  upload_uuid: "0a1b"
storage_options:
  aws_region: eu-west-1
"#;
        let config = CommitterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.committer, CommitterKind::Staging);
        assert_eq!(config.threads, 0);
        assert_eq!(config.conflict_mode, ConflictMode::Replace);
        assert_eq!(config.part_size, 100);
        assert!(!config.success_marker);
        assert_eq!(config.retry.interval_ms, 5);
        assert_eq!(config.staging.upload_uuid.as_deref(), Some("0a1b"));
        assert_eq!(
            config.storage_options.get("aws_region").map(String::as_str),
            Some("eu-west-1")
        );
    }

    #[test]
    fn test_validation() {
        assert!(CommitterConfig::from_yaml("part_size: 0").is_err());
        assert!(CommitterConfig::from_yaml("threads: 5000").is_err());
        assert!(CommitterConfig::from_yaml("unknown_field: 1").is_err());
    }

    #[test]
    fn test_committer_names() {
        assert_eq!("magic".parse::<CommitterKind>().unwrap(), CommitterKind::Magic);
        assert_eq!(
            "directory".parse::<CommitterKind>().unwrap(),
            CommitterKind::Staging
        );
        assert!("partitioned-v2".parse::<CommitterKind>().is_err());
    }
}
