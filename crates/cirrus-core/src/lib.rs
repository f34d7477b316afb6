//! cirrus-core: storage, configuration and observability plumbing shared by
//! the cirrus commit protocol.
//!
//! - `storage/` - the [`ObjectClient`] seam and its `object_store` implementation
//! - `metrics/` - internal events recorded through the `metrics` facade
//! - `config/` - YAML loading with environment variable interpolation
//! - `error` - storage and configuration errors, plus the [`ErrorKind`] tag
//! - `tracing` - subscriber setup and phase timing

pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod tracing;

pub use config::{KB, MB, interpolate, load_yaml, parse_yaml};
pub use error::{ConfigError, ErrorKind, StorageError};
pub use storage::{
    MultipartUpload, ObjectClient, ObjectClientRef, StorageProvider, StorageProviderRef,
    StorageUrl,
};
pub use self::tracing::{Stopwatch, init_tracing};
