//! Thin partition façades mapping application addressing onto store
//! locations.
//!
//! A document partition addresses records by string path, an object
//! partition by numeric id encoded as a zero-padded path. Both resolve
//! their encryptor lazily on first use and relay every operation to the
//! secure store.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::OnceCell;

use crate::data::{DataWithMetadata, WritePayload};
use crate::location::Location;
use crate::metadata::{AuditInfo, Metadata, Snapshot};
use crate::pipeline::Encryptor;
use crate::secure::{SecureStore, SecureStoreOptions};
use crate::store::LockLease;
use crate::Result;

/// Async factory for a partition's encryptor, called at most once.
pub type EncryptorProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Arc<dyn Encryptor>>>> + Send + Sync>;

/// Per-partition item settings.
#[derive(Clone)]
pub struct ItemConfiguration {
    /// Base path prepended to every item path.
    pub base_path: String,
    /// Options applied to writes and deletes.
    pub options: SecureStoreOptions,
}

impl Default for ItemConfiguration {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            options: SecureStoreOptions::SAVE,
        }
    }
}

impl ItemConfiguration {
    fn join(&self, path: &str) -> String {
        if self.base_path.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.base_path.trim_end_matches('/'), path)
        }
    }
}

struct PartitionCore {
    store: Arc<SecureStore>,
    partition_id: String,
    config: ItemConfiguration,
    provider: Option<EncryptorProvider>,
    encryptor: OnceCell<Option<Arc<dyn Encryptor>>>,
}

impl PartitionCore {
    fn location(&self, path: &str) -> Location {
        Location::new(self.partition_id.clone(), self.config.join(path))
    }

    async fn encryptor(&self) -> Result<Option<Arc<dyn Encryptor>>> {
        match &self.provider {
            None => Ok(None),
            Some(provider) => {
                let resolved = self
                    .encryptor
                    .get_or_try_init(|| provider())
                    .await?;
                Ok(resolved.clone())
            }
        }
    }
}

/// Partition addressing records by string path.
pub struct DocumentPartition {
    core: PartitionCore,
}

impl DocumentPartition {
    pub fn new(
        store: Arc<SecureStore>,
        partition_id: impl Into<String>,
        config: ItemConfiguration,
    ) -> Self {
        Self {
            core: PartitionCore {
                store,
                partition_id: partition_id.into(),
                config,
                provider: None,
                encryptor: OnceCell::new(),
            },
        }
    }

    pub fn with_encryptor_provider(mut self, provider: EncryptorProvider) -> Self {
        self.core.provider = Some(provider);
        self
    }

    pub fn location(&self, path: &str) -> Location {
        self.core.location(path)
    }

    pub async fn save(
        &self,
        path: &str,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Metadata> {
        let encryptor = self.core.encryptor().await?;
        self.core
            .store
            .save_data(
                &self.core.location(path),
                metadata,
                audit,
                None,
                encryptor.as_ref(),
                payload,
                self.core.config.options,
            )
            .await
    }

    pub async fn load(&self, path: &str, snapshot: Option<&str>) -> Result<Option<DataWithMetadata>> {
        let encryptor = self.core.encryptor().await?;
        self.core
            .store
            .load_data(&self.core.location(path), snapshot, encryptor.as_ref())
            .await
    }

    pub async fn get_metadata(
        &self,
        path: &str,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>> {
        self.core
            .store
            .get_metadata(&self.core.location(path), snapshot)
            .await
    }

    pub async fn delete(&self, path: &str, audit: Option<&AuditInfo>) -> Result<()> {
        self.core
            .store
            .delete(&self.core.location(path), audit, None, self.core.config.options)
            .await
    }

    pub async fn find_snapshots(
        &self,
        path: &str,
    ) -> Result<BoxStream<'static, Result<Snapshot>>> {
        self.core.store.find_snapshots(&self.core.location(path)).await
    }

    /// Acquire the item's lock, failing when it is held elsewhere.
    pub async fn lock(&self, path: &str) -> Result<LockLease> {
        self.core.store.lock_required(&self.core.location(path)).await
    }
}

/// Partition addressing records by non-negative numeric id.
pub struct ObjectPartition {
    core: PartitionCore,
}

impl ObjectPartition {
    pub fn new(
        store: Arc<SecureStore>,
        partition_id: impl Into<String>,
        config: ItemConfiguration,
    ) -> Self {
        Self {
            core: PartitionCore {
                store,
                partition_id: partition_id.into(),
                config,
                provider: None,
                encryptor: OnceCell::new(),
            },
        }
    }

    pub fn with_encryptor_provider(mut self, provider: EncryptorProvider) -> Self {
        self.core.provider = Some(provider);
        self
    }

    /// Ids encode as fixed-width zero-padded paths so listings sort
    /// numerically.
    pub fn location(&self, id: i64) -> Location {
        self.core.location(&format!("{:020}.dat", id.max(0)))
    }

    pub async fn save(
        &self,
        id: i64,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Metadata> {
        let encryptor = self.core.encryptor().await?;
        self.core
            .store
            .save_data(
                &self.location(id),
                metadata,
                audit,
                Some(id),
                encryptor.as_ref(),
                payload,
                self.core.config.options,
            )
            .await
    }

    pub async fn load(&self, id: i64, snapshot: Option<&str>) -> Result<Option<DataWithMetadata>> {
        let encryptor = self.core.encryptor().await?;
        self.core
            .store
            .load_data(&self.location(id), snapshot, encryptor.as_ref())
            .await
    }

    pub async fn get_metadata(&self, id: i64, snapshot: Option<&str>) -> Result<Option<Metadata>> {
        self.core.store.get_metadata(&self.location(id), snapshot).await
    }

    pub async fn delete(&self, id: i64, audit: Option<&AuditInfo>) -> Result<()> {
        self.core
            .store
            .delete(&self.location(id), audit, Some(id), self.core.config.options)
            .await
    }

    pub async fn find_snapshots(&self, id: i64) -> Result<BoxStream<'static, Result<Snapshot>>> {
        self.core.store.find_snapshots(&self.location(id)).await
    }

    pub async fn lock(&self, id: i64) -> Result<LockLease> {
        self.core.store.lock_required(&self.location(id)).await
    }
}
