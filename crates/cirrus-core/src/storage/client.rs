//! The store-client seam used by the commit protocol.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectMeta;
use object_store::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::StorageError;

/// An outstanding multipart upload reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub path: Path,
    pub upload_id: String,
    pub initiated: SystemTime,
}

/// Object store operations the commit protocol depends on.
///
/// Paths are full keys within the bucket. Part numbers are 1-based.
#[async_trait]
pub trait ObjectClient: Send + Sync + std::fmt::Debug {
    /// Bucket, container or root directory name.
    fn bucket(&self) -> &str;

    async fn get(&self, path: &Path) -> Result<Bytes, StorageError>;

    async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError>;

    /// Create-only write. Fails with an `AlreadyExists` kind if the object exists.
    async fn put_if_absent(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError>;

    /// Metadata of the object at exactly `path`, if any.
    async fn head(&self, path: &Path) -> Result<Option<ObjectMeta>, StorageError>;

    /// Objects under `prefix`; direct children only unless `recursive`.
    async fn list(&self, prefix: &Path, recursive: bool) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, path: &Path) -> Result<(), StorageError>;

    /// Delete every object under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &Path) -> Result<usize, StorageError>;

    async fn initiate_upload(&self, path: &Path) -> Result<String, StorageError>;

    /// Upload one part and return its tag.
    async fn upload_part(
        &self,
        path: &Path,
        upload_id: &str,
        part_number: usize,
        bytes: Bytes,
    ) -> Result<String, StorageError>;

    async fn complete_upload(
        &self,
        path: &Path,
        upload_id: &str,
        tags: &[String],
    ) -> Result<(), StorageError>;

    async fn abort_upload(&self, path: &Path, upload_id: &str) -> Result<(), StorageError>;

    /// Multipart uploads still open under `prefix`.
    async fn list_uploads(&self, prefix: &Path) -> Result<Vec<MultipartUpload>, StorageError>;
}

/// A shared object client.
pub type ObjectClientRef = Arc<dyn ObjectClient>;

/// Whether `path` lies at or beneath `prefix` on segment boundaries.
pub fn is_under(path: &Path, prefix: &Path) -> bool {
    path.prefix_match(prefix).is_some()
}
