//! Backend selection and adapter tuning.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::adapter::StoreAdapter;
use crate::store::listing::ListingStore;
use crate::store::versioned::VersionedStore;
use crate::{Error, Result};

/// Which adapter flavor to layer over the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFlavor {
    /// Current-pointer documents committed with conditional writes.
    #[default]
    Versioned,
    /// Current derived from per-key version listings.
    Listing,
}

/// Adapter tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Payloads at or above this size switch to a multi-part upload.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: usize,

    /// Lock lease duration in seconds.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    /// Lock renewal interval in seconds. Keep it under half the lease.
    #[serde(default = "default_lock_renew_secs")]
    pub lock_renew_secs: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            lock_lease_secs: default_lock_lease_secs(),
            lock_renew_secs: default_lock_renew_secs(),
        }
    }
}

impl StoreOptions {
    pub(crate) fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub(crate) fn lock_renew(&self) -> Duration {
        Duration::from_secs(self.lock_renew_secs)
    }
}

fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024
}

fn default_lock_lease_secs() -> u64 {
    60
}

fn default_lock_renew_secs() -> u64 {
    20
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreBackendConfig {
    /// In-memory storage (for testing)
    Memory,

    /// Local filesystem storage
    Filesystem { path: PathBuf },

    /// AWS S3 and S3-compatible services (MinIO, Ceph RGW, etc.)
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        #[serde(default)]
        allow_http: bool,
    },

    /// Azure Blob Storage
    Azure {
        account_name: String,
        container_name: String,
        #[serde(default)]
        account_key: Option<String>,
    },

    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default)]
        service_account_path: Option<String>,
    },
}

/// Build the underlying object store for a backend configuration.
pub fn create_object_store(config: &StoreBackendConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        StoreBackendConfig::Memory => Ok(Arc::new(InMemory::new())),

        StoreBackendConfig::Filesystem { path } => {
            std::fs::create_dir_all(path)?;
            let store = LocalFileSystem::new_with_prefix(path)
                .map_err(|e| Error::Config(format!("Failed to open filesystem store: {e}")))?;
            Ok(Arc::new(store))
        }

        StoreBackendConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            allow_http,
        } => {
            let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
            if let Some(region) = region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint);
                builder = builder.with_virtual_hosted_style_request(false);
            }
            if let Some(access_key) = access_key_id {
                builder = builder.with_access_key_id(access_key);
            }
            if let Some(secret_key) = secret_access_key {
                builder = builder.with_secret_access_key(secret_key);
            }
            if *allow_http {
                builder = builder.with_allow_http(true);
            }
            let store = builder
                .build()
                .map_err(|e| Error::Config(format!("Failed to create S3 client: {e}")))?;
            info!("created S3 backend for bucket {bucket}");
            Ok(Arc::new(store))
        }

        StoreBackendConfig::Azure {
            account_name,
            container_name,
            account_key,
        } => {
            let mut builder = MicrosoftAzureBuilder::new()
                .with_account(account_name)
                .with_container_name(container_name);
            if let Some(key) = account_key {
                builder = builder.with_access_key(key);
            }
            let store = builder
                .build()
                .map_err(|e| Error::Config(format!("Failed to create Azure client: {e}")))?;
            info!("created Azure backend for account {account_name}, container {container_name}");
            Ok(Arc::new(store))
        }

        StoreBackendConfig::Gcs {
            bucket,
            service_account_path,
        } => {
            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
            if let Some(path) = service_account_path {
                builder = builder.with_service_account_path(path);
            }
            let store = builder
                .build()
                .map_err(|e| Error::Config(format!("Failed to create GCS client: {e}")))?;
            info!("created GCS backend for bucket {bucket}");
            Ok(Arc::new(store))
        }
    }
}

/// Create a store adapter from configuration.
pub fn create_adapter(
    backend: &StoreBackendConfig,
    flavor: StoreFlavor,
    options: StoreOptions,
) -> Result<Arc<dyn StoreAdapter>> {
    let store = create_object_store(backend)?;
    Ok(match flavor {
        StoreFlavor::Versioned => Arc::new(VersionedStore::new(store, options)),
        StoreFlavor::Listing => Arc::new(ListingStore::new(store, options)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_config_round_trips_through_json() {
        let config: StoreBackendConfig = serde_json::from_str(r#"{"type":"memory"}"#).unwrap();
        assert!(matches!(config, StoreBackendConfig::Memory));
    }

    #[test]
    fn s3_config_defaults_optional_fields() {
        let config: StoreBackendConfig =
            serde_json::from_str(r#"{"type":"s3","bucket":"leo-data"}"#).unwrap();
        match config {
            StoreBackendConfig::S3 {
                bucket,
                region,
                allow_http,
                ..
            } => {
                assert_eq!(bucket, "leo-data");
                assert!(region.is_none());
                assert!(!allow_http);
            }
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn options_default_sensibly() {
        let options = StoreOptions::default();
        assert_eq!(options.multipart_threshold, 8 * 1024 * 1024);
        assert!(options.lock_renew() < options.lock_lease() / 2);
    }

    #[tokio::test]
    async fn create_memory_adapter() {
        let adapter =
            create_adapter(&StoreBackendConfig::Memory, StoreFlavor::Versioned, StoreOptions::default())
                .unwrap();
        assert!(adapter.can_compress());
    }
}
