//! Azure Blob Storage backend.

use object_store::azure::MicrosoftAzureBuilder;
use object_store::multipart::MultipartStore;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AzureConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// Azure Blob Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
}

impl StorageProvider {
    pub(super) fn construct_azure(
        config: AzureConfig,
        options: &HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(&config.account)
            .with_container_name(&config.container)
            .with_retry(RetryConfig::default());

        for (key, value) in options {
            builder = builder.with_config(key.parse().context(AzureConfigSnafu)?, value.clone());
        }

        let canonical_url = format!(
            "https://{}.blob.core.windows.net/{}",
            config.account, config.container
        );

        let azure_store = Arc::new(builder.build().context(AzureConfigSnafu)?);
        let multipart_store: Arc<dyn MultipartStore> = azure_store.clone();
        let object_store: Arc<dyn ObjectStore> = azure_store;

        Ok(Self::assemble(
            config.container.clone(),
            BackendConfig::Azure(config),
            object_store,
            Some(multipart_store),
            canonical_url,
        ))
    }
}
