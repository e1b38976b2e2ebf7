//! The engine-facing store façade.
//!
//! Orchestrates the write pipeline (compression, encryption), metadata
//! normalization, soft-delete semantics, locking, and the emission of change
//! events into the index and backup queues.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::data::{DataWithMetadata, WritePayload};
use crate::events::StoreDataDetails;
use crate::location::Location;
use crate::metadata::{keys, now_ticks, AuditInfo, Metadata, Snapshot};
use crate::metrics::StoreMetrics;
use crate::pipeline::{self, Codec, Encryptor};
use crate::queue::QueueClient;
use crate::store::{LockLease, StoreAdapter};
use crate::{Error, Result};

/// Option set controlling a secure-store operation. Members combine by
/// union: `SecureStoreOptions::SAVE | SecureStoreOptions::COMPRESS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureStoreOptions(u8);

impl SecureStoreOptions {
    pub const NONE: Self = Self(0);
    /// Compress the payload when the adapter supports it.
    pub const COMPRESS: Self = Self(1);
    /// Deletes are soft: the record is hidden but its snapshots survive.
    pub const KEEP_DELETES: Self = Self(1 << 1);
    /// Push a change event to the index queue.
    pub const GENERATE_INDEX_EVENT: Self = Self(1 << 2);
    /// Push a change event to the backup queue.
    pub const BACKUP: Self = Self(1 << 3);
    /// The default for writes; index event generation is implied.
    pub const SAVE: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SecureStoreOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SecureStoreOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The secure store façade over a backend adapter.
pub struct SecureStore {
    adapter: Arc<dyn StoreAdapter>,
    index_queue: Option<Arc<dyn QueueClient>>,
    backup_queue: Option<Arc<dyn QueueClient>>,
    metrics: Arc<StoreMetrics>,
}

impl SecureStore {
    pub fn new(adapter: Arc<dyn StoreAdapter>) -> Self {
        Self {
            adapter,
            index_queue: None,
            backup_queue: None,
            metrics: Arc::new(StoreMetrics::new()),
        }
    }

    pub fn with_index_queue(mut self, queue: Arc<dyn QueueClient>) -> Self {
        self.index_queue = Some(queue);
        self
    }

    pub fn with_backup_queue(mut self, queue: Arc<dyn QueueClient>) -> Self {
        self.backup_queue = Some(queue);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn adapter(&self) -> &Arc<dyn StoreAdapter> {
        &self.adapter
    }

    /// Write a new current version. Returns the post-write metadata.
    pub async fn save_data(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        id: Option<i64>,
        encryptor: Option<&Arc<dyn Encryptor>>,
        payload: WritePayload,
        options: SecureStoreOptions,
    ) -> Result<Metadata> {
        let (metadata, payload) = self.prepare_write(metadata, encryptor, payload, options);
        let saved = self.adapter.save_data(loc, metadata, audit, payload).await?;
        self.metrics.record_save(saved.content_length().unwrap_or(0));
        self.emit_events(loc, id, &saved, options).await;
        Ok(saved)
    }

    /// Conditional write; `Ok(None)` when the precondition failed.
    pub async fn try_optimistic_write(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        id: Option<i64>,
        encryptor: Option<&Arc<dyn Encryptor>>,
        payload: WritePayload,
        options: SecureStoreOptions,
    ) -> Result<Option<Metadata>> {
        let (metadata, payload) = self.prepare_write(metadata, encryptor, payload, options);
        let Some(saved) = self
            .adapter
            .try_optimistic_write(loc, metadata, audit, payload)
            .await?
        else {
            return Ok(None);
        };
        self.metrics.record_save(saved.content_length().unwrap_or(0));
        self.emit_events(loc, id, &saved, options).await;
        Ok(Some(saved))
    }

    /// Metadata of the current version or a snapshot. A soft-deleted current
    /// is still visible here; [`load_data`](Self::load_data) hides it.
    pub async fn get_metadata(
        &self,
        loc: &Location,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>> {
        self.adapter.get_metadata(loc, snapshot).await
    }

    /// Read data through the inverse pipeline. `Ok(None)` when missing or
    /// soft-deleted (unless a snapshot is addressed explicitly).
    pub async fn load_data(
        &self,
        loc: &Location,
        snapshot: Option<&str>,
        encryptor: Option<&Arc<dyn Encryptor>>,
    ) -> Result<Option<DataWithMetadata>> {
        let Some(data) = self.adapter.load_data(loc, snapshot).await? else {
            return Ok(None);
        };
        let codec = data.metadata.compressed().and_then(Codec::from_name);
        let stream = pipeline::apply_read(data.stream, codec, encryptor);
        self.metrics.record_load();
        Ok(Some(DataWithMetadata {
            metadata: data.metadata,
            stream,
        }))
    }

    /// Update only metadata, preserving the current content.
    pub async fn save_metadata(
        &self,
        loc: &Location,
        metadata: Metadata,
        id: Option<i64>,
        options: SecureStoreOptions,
    ) -> Result<Option<Metadata>> {
        let Some(saved) = self.adapter.save_metadata(loc, metadata).await? else {
            return Ok(None);
        };
        self.emit_events(loc, id, &saved, options).await;
        Ok(Some(saved))
    }

    /// Snapshots of exactly this key, newest first.
    pub async fn find_snapshots(
        &self,
        loc: &Location,
    ) -> Result<BoxStream<'static, Result<Snapshot>>> {
        self.adapter.find_snapshots(loc).await
    }

    /// Live records under the container; soft-deleted ones are filtered out.
    pub async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<BoxStream<'static, Result<(Location, Metadata)>>> {
        let stream = self.adapter.find_files(container, prefix).await?;
        Ok(stream
            .try_filter(|item| future::ready(item.1.deleted().is_none()))
            .boxed())
    }

    /// Delete a record: soft when `KEEP_DELETES` is set, permanent otherwise.
    pub async fn delete(
        &self,
        loc: &Location,
        audit: Option<&AuditInfo>,
        id: Option<i64>,
        options: SecureStoreOptions,
    ) -> Result<()> {
        if options.contains(SecureStoreOptions::KEEP_DELETES) {
            self.adapter.soft_delete(loc, audit).await?;
        } else {
            self.adapter.permanent_delete(loc).await?;
        }
        self.metrics.record_delete();
        debug!("deleted {loc}");

        let mut tombstone = Metadata::new();
        tombstone.set_deleted(now_ticks());
        self.emit_events(loc, id, &tombstone, options).await;
        Ok(())
    }

    /// Acquire the per-key lock. `Ok(None)` when held elsewhere.
    pub async fn lock(&self, loc: &Location) -> Result<Option<LockLease>> {
        self.adapter.lock(loc).await
    }

    /// Acquire the per-key lock, failing when it is held elsewhere.
    pub async fn lock_required(&self, loc: &Location) -> Result<LockLease> {
        self.lock(loc)
            .await?
            .ok_or_else(|| Error::LockHeld(loc.to_string()))
    }

    /// Idempotent container provisioning.
    pub async fn create_container_if_not_exists(&self, container: &str) -> Result<()> {
        self.adapter.create_container_if_not_exists(container).await
    }

    /// Walk the live records and re-emit each as an index event marked with
    /// the transient reindex flag. Returns the number of events emitted.
    pub async fn reindex_all(&self, container: &str, prefix: Option<&str>) -> Result<u64> {
        let queue = self
            .index_queue
            .as_ref()
            .ok_or_else(|| Error::Config("no index queue configured".to_string()))?;
        self.re_emit_all(container, prefix, queue).await
    }

    /// The symmetric operation against the backup queue.
    pub async fn backup_all(&self, container: &str, prefix: Option<&str>) -> Result<u64> {
        let queue = self
            .backup_queue
            .as_ref()
            .ok_or_else(|| Error::Config("no backup queue configured".to_string()))?;
        self.re_emit_all(container, prefix, queue).await
    }

    async fn re_emit_all(
        &self,
        container: &str,
        prefix: Option<&str>,
        queue: &Arc<dyn QueueClient>,
    ) -> Result<u64> {
        let mut files = self.find_files(container, prefix).await?;
        let mut count = 0u64;
        while let Some(item) = files.next().await {
            let (loc, mut metadata) = item?;
            metadata.set_reindex();
            let details = StoreDataDetails::new(&loc, None, metadata);
            queue
                .send_message(details.to_json()?)
                .await
                .map_err(|e| Error::Queue(format!("re-emission for {loc} failed: {e}")))?;
            count += 1;
        }
        debug!("re-emitted {count} events for container {container}");
        Ok(count)
    }

    /// Resolve the codec for a write and stage the pipeline.
    fn prepare_write(
        &self,
        mut metadata: Metadata,
        encryptor: Option<&Arc<dyn Encryptor>>,
        payload: WritePayload,
        options: SecureStoreOptions,
    ) -> (Metadata, WritePayload) {
        let codec = (options.contains(SecureStoreOptions::COMPRESS)
            && self.adapter.can_compress())
        .then_some(Codec::Zstd);
        match codec {
            Some(codec) => metadata.set(keys::COMPRESSED, codec.name()),
            None => {
                metadata.remove(keys::COMPRESSED);
            }
        }
        (metadata, pipeline::apply_write(payload, codec, encryptor))
    }

    /// Push change events after a successful write. Emission failures are
    /// logged and counted; they never roll the write back.
    async fn emit_events(
        &self,
        loc: &Location,
        id: Option<i64>,
        metadata: &Metadata,
        options: SecureStoreOptions,
    ) {
        let targets = [
            (
                SecureStoreOptions::GENERATE_INDEX_EVENT,
                self.index_queue.as_ref(),
                "index",
            ),
            (SecureStoreOptions::BACKUP, self.backup_queue.as_ref(), "backup"),
        ];
        for (flag, queue, kind) in targets {
            if !options.contains(flag) {
                continue;
            }
            let Some(queue) = queue else {
                continue;
            };
            let details = StoreDataDetails::new(loc, id, metadata.clone());
            let body = match details.to_json() {
                Ok(body) => body,
                Err(err) => {
                    warn!("failed to serialize {kind} event for {loc}: {err}");
                    self.metrics.record_event_failure();
                    continue;
                }
            };
            match queue.send_message(body).await {
                Ok(()) => {
                    if kind == "index" {
                        self.metrics.record_index_event();
                    } else {
                        self.metrics.record_backup_event();
                    }
                }
                Err(err) => {
                    warn!("failed to push {kind} event for {loc}: {err}");
                    self.metrics.record_event_failure();
                }
            }
        }
    }
}
