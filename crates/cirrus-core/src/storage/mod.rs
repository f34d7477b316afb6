//! Multi-cloud storage abstraction.
//!
//! [`StorageProvider`] implements [`ObjectClient`] over `object_store` for S3,
//! GCS, Azure Blob Storage, the local filesystem and an in-process store.
//!
//! `object_store` cannot enumerate open multipart uploads, so each provider
//! records the uploads it starts in a ledger shared by every provider opened
//! on the same store. `list_uploads` answers from that ledger, which means it
//! only sees uploads started by this process.

mod azure;
mod client;
mod gcs;
mod local;
mod memory;
mod s3;
mod url_parser;

pub use azure::AzureConfig;
pub use client::{MultipartUpload, ObjectClient, ObjectClientRef, is_under};
pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;
pub use url_parser::{BackendConfig, StorageUrl};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Instant, SystemTime};
use tracing::debug;

use crate::emit;
use crate::error::{
    ErrorKind, MultipartUnsupportedSnafu, ObjectStoreSnafu, StorageError, UnknownUploadSnafu,
};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

type UploadLedger = Arc<Mutex<BTreeMap<String, MultipartUpload>>>;

fn ledger_for(canonical_url: &str) -> UploadLedger {
    static LEDGERS: OnceLock<Mutex<HashMap<String, UploadLedger>>> = OnceLock::new();
    let mut ledgers = LEDGERS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    ledgers.entry(canonical_url.to_string()).or_default().clone()
}

fn record<T, E>(operation: StorageOperation, start: Instant, result: &Result<T, E>) {
    emit!(StorageRequest {
        operation,
        status: RequestStatus::from_result(result),
    });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    bucket: String,
    config: BackendConfig,
    base: Path,
    object_store: Arc<dyn ObjectStore>,
    /// Present for backends with multipart upload support.
    multipart_store: Option<Arc<dyn MultipartStore>>,
    canonical_url: String,
    uploads: UploadLedger,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Open the store named by `url`. The key part of the URL is kept as the
    /// base path; operations still take full keys.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let StorageUrl { backend, key } = StorageUrl::parse(url)?;

        let provider = match backend {
            BackendConfig::S3(config) => Self::construct_s3(config, &options)?,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, &options)?,
            BackendConfig::Azure(config) => Self::construct_azure(config, &options)?,
            BackendConfig::Memory(config) => Self::construct_memory(config),
            BackendConfig::Local(config) => Self::construct_local(config).await?,
        };

        Ok(Self {
            base: key,
            ..provider
        })
    }

    /// Open the store named by `url` with no extra options.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    fn assemble(
        bucket: String,
        config: BackendConfig,
        object_store: Arc<dyn ObjectStore>,
        multipart_store: Option<Arc<dyn MultipartStore>>,
        canonical_url: String,
    ) -> Self {
        let uploads = ledger_for(&canonical_url);
        Self {
            bucket,
            config,
            base: Path::default(),
            object_store,
            multipart_store,
            canonical_url,
            uploads,
        }
    }

    /// Key given in the URL this provider was opened with.
    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    fn multipart(&self) -> Result<&Arc<dyn MultipartStore>, StorageError> {
        self.multipart_store.as_ref().context(MultipartUnsupportedSnafu {
            url: self.canonical_url.clone(),
        })
    }

    /// The in-memory ledger is complete, so an unknown id there is a hard error.
    fn check_known_upload(&self, path: &Path, upload_id: &str) -> Result<(), StorageError> {
        if !matches!(self.config, BackendConfig::Memory(_)) {
            return Ok(());
        }
        let uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        ensure!(
            uploads.contains_key(upload_id),
            UnknownUploadSnafu {
                path: path.to_string(),
                upload_id,
            }
        );
        Ok(())
    }

    fn forget_upload(&self, upload_id: &str) {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(upload_id);
    }
}

#[async_trait]
impl ObjectClient for StorageProvider {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = match self.object_store.get(path).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        record(StorageOperation::Get, start, &result);
        result.context(ObjectStoreSnafu)
    }

    async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self.object_store.put(path, PutPayload::from(bytes)).await;
        record(StorageOperation::Put, start, &result);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    async fn put_if_absent(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let start = Instant::now();
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        let result = self
            .object_store
            .put_opts(path, PutPayload::from(bytes.clone()), opts)
            .await;
        record(StorageOperation::Put, start, &result);

        match result {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotImplemented) => {
                // Backends without conditional writes: check, then write.
                debug!("Conditional put unsupported by {}, using head+put", self.canonical_url);
                if self.head(path).await?.is_some() {
                    return Err(StorageError::Remote {
                        kind: ErrorKind::AlreadyExists,
                        message: format!("object already exists at {path}"),
                    });
                }
                self.put(path, bytes).await
            }
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    async fn head(&self, path: &Path) -> Result<Option<ObjectMeta>, StorageError> {
        let start = Instant::now();
        let result = self.object_store.head(path).await;
        record(StorageOperation::Head, start, &result);
        match result {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    async fn list(&self, prefix: &Path, recursive: bool) -> Result<Vec<ObjectMeta>, StorageError> {
        let start = Instant::now();
        let prefix = (!prefix.as_ref().is_empty()).then_some(prefix);
        let result = if recursive {
            self.object_store.list(prefix).try_collect::<Vec<_>>().await
        } else {
            self.object_store
                .list_with_delimiter(prefix)
                .await
                .map(|listing| listing.objects)
        };
        record(StorageOperation::List, start, &result);

        match result {
            Ok(mut objects) => {
                objects.sort_by(|a, b| a.location.cmp(&b.location));
                Ok(objects)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(Vec::new()),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self.object_store.delete(path).await;
        record(StorageOperation::Delete, start, &result);
        match result {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<usize, StorageError> {
        let objects = self.list(prefix, true).await?;
        for meta in &objects {
            self.delete(&meta.location).await?;
        }
        debug!("Deleted {} objects under {prefix}", objects.len());
        Ok(objects.len())
    }

    async fn initiate_upload(&self, path: &Path) -> Result<String, StorageError> {
        let store = self.multipart()?;
        let start = Instant::now();
        let result = store.create_multipart(path).await;
        record(StorageOperation::CreateMultipart, start, &result);
        let upload_id = result.context(ObjectStoreSnafu)?;

        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                upload_id.clone(),
                MultipartUpload {
                    path: path.clone(),
                    upload_id: upload_id.clone(),
                    initiated: SystemTime::now(),
                },
            );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        path: &Path,
        upload_id: &str,
        part_number: usize,
        bytes: Bytes,
    ) -> Result<String, StorageError> {
        let store = self.multipart()?;
        self.check_known_upload(path, upload_id)?;
        let start = Instant::now();
        let upload_id_owned = upload_id.to_string();
        let result = store
            .put_part(
                path,
                &upload_id_owned,
                part_number.saturating_sub(1),
                PutPayload::from(bytes),
            )
            .await;
        record(StorageOperation::PutPart, start, &result);
        let PartId { content_id } = result.context(ObjectStoreSnafu)?;

        // The in-memory store hands back empty part ids.
        if content_id.is_empty() {
            Ok(format!("part-{part_number}"))
        } else {
            Ok(content_id)
        }
    }

    async fn complete_upload(
        &self,
        path: &Path,
        upload_id: &str,
        tags: &[String],
    ) -> Result<(), StorageError> {
        let store = self.multipart()?;
        self.check_known_upload(path, upload_id)?;
        let parts = tags
            .iter()
            .map(|tag| PartId {
                content_id: tag.clone(),
            })
            .collect();
        let start = Instant::now();
        let result = store
            .complete_multipart(path, &upload_id.to_string(), parts)
            .await;
        record(StorageOperation::CompleteMultipart, start, &result);
        result.context(ObjectStoreSnafu)?;
        self.forget_upload(upload_id);
        Ok(())
    }

    async fn abort_upload(&self, path: &Path, upload_id: &str) -> Result<(), StorageError> {
        let store = self.multipart()?;
        self.check_known_upload(path, upload_id)?;
        let start = Instant::now();
        let result = store.abort_multipart(path, &upload_id.to_string()).await;
        record(StorageOperation::AbortMultipart, start, &result);
        result.context(ObjectStoreSnafu)?;
        self.forget_upload(upload_id);
        Ok(())
    }

    async fn list_uploads(&self, prefix: &Path) -> Result<Vec<MultipartUpload>, StorageError> {
        let uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        Ok(uploads
            .values()
            .filter(|upload| is_under(&upload.path, prefix))
            .cloned()
            .collect())
    }
}
