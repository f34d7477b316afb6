//! URL parsing for storage backends.
//!
//! Splits a storage URL into the backend configuration (bucket, region,
//! endpoint, container, directory) and the base key inside it.

use object_store::path::Path;
use regex::{Captures, Regex};
use snafu::OptionExt;
use std::sync::OnceLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{AzureConfig, GcsConfig, LocalConfig, MemoryConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const ABFS_URL: &str = r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$";
const AZURE_HTTPS: &str = r"^https://(?P<account>[a-z0-9]+)\.(blob|dfs)\.core\.windows\.net/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$";

const MEMORY_URL: &str = r"^memory://(?P<name>[A-Za-z0-9\-_\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Memory,
    Local,
}

fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("storage URL pattern is valid"))
                .collect()
        };
        vec![
            (
                Backend::S3,
                compile(&[S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]),
            ),
            (Backend::Gcs, compile(&[GCS_PATH, GCS_VIRTUAL, GCS_URL])),
            (Backend::Azure, compile(&[ABFS_URL, AZURE_HTTPS])),
            (Backend::Memory, compile(&[MEMORY_URL])),
            (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
        ]
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Memory(MemoryConfig),
    Local(LocalConfig),
}

/// A parsed storage URL: where the store is, and the key inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    pub backend: BackendConfig,
    pub key: Path,
}

fn group<'a>(matches: &'a Captures, name: &str, url: &str) -> Result<&'a str, StorageError> {
    matches
        .name(name)
        .map(|m| m.as_str())
        .context(InvalidUrlSnafu { url })
}

impl StorageUrl {
    /// Parse a URL into its backend configuration and base key.
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in matchers() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                let key = matches
                    .name("key")
                    .map(|m| Path::from(m.as_str()))
                    .unwrap_or_default();
                let backend = match backend {
                    Backend::S3 => parse_s3(&matches, url)?,
                    Backend::Gcs => BackendConfig::Gcs(GcsConfig {
                        bucket: group(&matches, "bucket", url)?.to_string(),
                    }),
                    Backend::Azure => BackendConfig::Azure(AzureConfig {
                        account: group(&matches, "account", url)?.to_string(),
                        container: group(&matches, "container", url)?.to_string(),
                    }),
                    Backend::Memory => BackendConfig::Memory(MemoryConfig {
                        name: group(&matches, "name", url)?.to_string(),
                    }),
                    Backend::Local => parse_local(&matches, url)?,
                };
                return Ok(Self { backend, key });
            }
        }

        InvalidUrlSnafu { url }.fail()
    }
}

fn parse_s3(matches: &Captures, url: &str) -> Result<BackendConfig, StorageError> {
    let bucket = group(matches, "bucket", url)?.to_string();

    let region = std::env::var("AWS_DEFAULT_REGION")
        .ok()
        .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

    let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
        matches.name("endpoint").map(|endpoint| {
            let port = matches
                .name("port")
                .and_then(|p| p.as_str().parse::<u16>().ok())
                .unwrap_or(443);
            let protocol = matches
                .name("protocol")
                .map(|p| p.as_str())
                .unwrap_or("https");
            format!("{protocol}://{}:{port}", endpoint.as_str())
        })
    });

    Ok(BackendConfig::S3(S3Config {
        endpoint,
        region,
        bucket,
    }))
}

/// Local URLs name a directory; it becomes the store root and the key is empty.
fn parse_local(matches: &Captures, url: &str) -> Result<BackendConfig, StorageError> {
    let path = group(matches, "path", url)?;
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Ok(BackendConfig::Local(LocalConfig { path }))
}
