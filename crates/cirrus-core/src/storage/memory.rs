//! In-process object store.
//!
//! Stores are shared by name, so every provider opened on `memory://name`
//! sees the same objects and the same open uploads.

use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::multipart::MultipartStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::{BackendConfig, StorageProvider};

/// In-memory store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub name: String,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<InMemory>>> {
    static STORES: OnceLock<Mutex<HashMap<String, Arc<InMemory>>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

impl StorageProvider {
    pub(super) fn construct_memory(config: MemoryConfig) -> Self {
        let store = {
            let mut stores = registry().lock().unwrap_or_else(|e| e.into_inner());
            stores
                .entry(config.name.clone())
                .or_insert_with(|| Arc::new(InMemory::new()))
                .clone()
        };

        let multipart_store: Arc<dyn MultipartStore> = store.clone();
        let object_store: Arc<dyn ObjectStore> = store;
        let canonical_url = format!("memory://{}", config.name);

        Self::assemble(
            config.name.clone(),
            BackendConfig::Memory(config),
            object_store,
            Some(multipart_store),
            canonical_url,
        )
    }
}
