//! Shared helpers for cirrus integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectMeta;
use object_store::path::Path;

use cirrus::config::{CommitterConfig, RetryConfig};
use cirrus_core::{ErrorKind, MultipartUpload, ObjectClient, StorageError, StorageProvider};

/// Store operations a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Put,
    PutIfAbsent,
    Head,
    List,
    Delete,
    DeletePrefix,
    Initiate,
    UploadPart,
    Complete,
    Abort,
    ListUploads,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    /// Only calls whose path contains this fragment.
    key: Option<String>,
    /// Matching calls to let through before failing.
    skip: usize,
    /// Matching calls to fail.
    times: usize,
    kind: ErrorKind,
}

/// An in-memory store that records calls and fails the ones it is told to.
#[derive(Debug)]
pub struct FaultyClient {
    inner: StorageProvider,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<(Op, String)>>,
}

impl FaultyClient {
    pub async fn memory(name: &str) -> Arc<Self> {
        let inner = StorageProvider::for_url(&format!("memory://{name}"))
            .await
            .unwrap();
        Arc::new(Self {
            inner,
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail(&self, op: Op, kind: ErrorKind, times: usize) {
        self.add(op, None, 0, times, kind);
    }

    /// Fail the next `times` calls of `op` on paths containing `key`.
    pub fn fail_key(&self, op: Op, key: &str, kind: ErrorKind, times: usize) {
        self.add(op, Some(key.to_string()), 0, times, kind);
    }

    /// Fail only the `n`th call (1-based) of `op` from now on.
    pub fn fail_nth(&self, op: Op, n: usize, kind: ErrorKind) {
        self.add(op, None, n.saturating_sub(1), 1, kind);
    }

    fn add(&self, op: Op, key: Option<String>, skip: usize, times: usize, kind: ErrorKind) {
        self.faults.lock().unwrap().push(Fault {
            op,
            key,
            skip,
            times,
            kind,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Paths of every recorded call of `op`, in call order.
    pub fn calls(&self, op: Op) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, path)| path.clone())
            .collect()
    }

    /// Every recorded call, in call order.
    pub fn log(&self) -> Vec<(Op, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls(op).len()
    }

    /// Record the call and decide whether it fails.
    fn check(&self, op: Op, path: &Path) -> Result<(), StorageError> {
        let path = path.to_string();
        self.calls.lock().unwrap().push((op, path.clone()));

        let mut faults = self.faults.lock().unwrap();
        for fault in faults.iter_mut() {
            if fault.op != op || fault.times == 0 {
                continue;
            }
            if fault.key.as_ref().is_some_and(|key| !path.contains(key.as_str())) {
                continue;
            }
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            fault.times -= 1;
            return Err(StorageError::Remote {
                kind: fault.kind,
                message: format!("injected {op:?} failure on {path}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectClient for FaultyClient {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        self.check(Op::Get, path)?;
        self.inner.get(path).await
    }

    async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.check(Op::Put, path)?;
        self.inner.put(path, bytes).await
    }

    async fn put_if_absent(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.check(Op::PutIfAbsent, path)?;
        self.inner.put_if_absent(path, bytes).await
    }

    async fn head(&self, path: &Path) -> Result<Option<ObjectMeta>, StorageError> {
        self.check(Op::Head, path)?;
        self.inner.head(path).await
    }

    async fn list(&self, prefix: &Path, recursive: bool) -> Result<Vec<ObjectMeta>, StorageError> {
        self.check(Op::List, prefix)?;
        self.inner.list(prefix, recursive).await
    }

    async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        self.check(Op::Delete, path)?;
        self.inner.delete(path).await
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<usize, StorageError> {
        self.check(Op::DeletePrefix, prefix)?;
        self.inner.delete_prefix(prefix).await
    }

    async fn initiate_upload(&self, path: &Path) -> Result<String, StorageError> {
        self.check(Op::Initiate, path)?;
        self.inner.initiate_upload(path).await
    }

    async fn upload_part(
        &self,
        path: &Path,
        upload_id: &str,
        part_number: usize,
        bytes: Bytes,
    ) -> Result<String, StorageError> {
        self.check(Op::UploadPart, path)?;
        self.inner
            .upload_part(path, upload_id, part_number, bytes)
            .await
    }

    async fn complete_upload(
        &self,
        path: &Path,
        upload_id: &str,
        tags: &[String],
    ) -> Result<(), StorageError> {
        self.check(Op::Complete, path)?;
        self.inner.complete_upload(path, upload_id, tags).await
    }

    async fn abort_upload(&self, path: &Path, upload_id: &str) -> Result<(), StorageError> {
        self.check(Op::Abort, path)?;
        self.inner.abort_upload(path, upload_id).await
    }

    async fn list_uploads(&self, prefix: &Path) -> Result<Vec<MultipartUpload>, StorageError> {
        self.check(Op::ListUploads, prefix)?;
        self.inner.list_uploads(prefix).await
    }
}

/// A synchronous committer config with fast retries.
pub fn test_config(part_size: usize) -> CommitterConfig {
    CommitterConfig {
        threads: 0,
        part_size,
        retry: RetryConfig {
            limit: 3,
            interval_ms: 1,
            jitter: 0.0,
        },
        ..CommitterConfig::default()
    }
}
