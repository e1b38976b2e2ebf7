//! Native-versioning store flavor.
//!
//! Keeps a current-pointer document per key, committed with the backend's
//! conditional writes, plus one immutable object pair per version. The
//! pointer commit is what makes optimistic writes linearizable per key on
//! backends that honor `If-Match`/`If-None-Match` puts.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{Error as ObjectStoreError, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::{DataWithMetadata, WritePayload};
use crate::location::{validate_container, Location, INTERNAL_PREFIX};
use crate::metadata::{AuditInfo, Metadata, Snapshot};
use crate::store::adapter::StoreAdapter;
use crate::store::config::StoreOptions;
use crate::store::layout::{
    self, build_persisted, delete_all_versions, get_json, map_backend_err, monotonic_now,
    new_version_id, open_stream, put_json, put_json_conditional, snapshots_stream, upload_stream,
    CommitMode,
};
use crate::store::lock::{self, LockLease};
use crate::{Error, Result};

/// The current-pointer document persisted per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentDoc {
    version: String,
    metadata: Metadata,
}

/// Store adapter over a backend with conditional writes.
pub struct VersionedStore {
    store: Arc<dyn ObjectStore>,
    options: StoreOptions,
}

impl VersionedStore {
    pub fn new(store: Arc<dyn ObjectStore>, options: StoreOptions) -> Self {
        info!(
            "created versioned store adapter (multipart threshold {} bytes)",
            options.multipart_threshold
        );
        Self { store, options }
    }

    async fn read_current(&self, loc: &Location) -> Result<Option<(CurrentDoc, Option<String>)>> {
        get_json::<CurrentDoc>(&self.store, &layout::current_path(loc)).await
    }

    /// Upload the payload as a new immutable version and persist its metadata
    /// document. Returns the persisted metadata and version id; the pointer
    /// is not touched.
    async fn write_version(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
        prev_modified: Option<i64>,
    ) -> Result<(Metadata, String)> {
        let modified = monotonic_now(prev_modified);
        let version = new_version_id(modified);
        let data_path = layout::version_data_path(loc, &version);

        let (stream, logical) = payload.into_parts();
        let stored = upload_stream(&self.store, &data_path, stream, self.options.multipart_threshold)
            .await?;
        debug!("wrote version {version} of {loc} ({stored} stored bytes)");

        let persisted = build_persisted(
            metadata,
            audit,
            logical.load(Ordering::Relaxed),
            modified,
            &version,
            true,
        );
        if let Err(err) = put_json(&self.store, &layout::version_meta_path(loc, &version), &persisted).await
        {
            let _ = self.store.delete(&data_path).await;
            return Err(err);
        }
        Ok((persisted, version))
    }

    async fn commit_current(
        &self,
        loc: &Location,
        version: &str,
        metadata: &Metadata,
        mode: CommitMode,
    ) -> Result<Option<String>> {
        let doc = CurrentDoc {
            version: version.to_string(),
            metadata: metadata.clone(),
        };
        put_json_conditional(&self.store, &layout::current_path(loc), &doc, &mode).await
    }

    /// Remove the orphaned version objects left behind by a failed
    /// conditional commit. Best effort.
    async fn discard_version(&self, loc: &Location, version: &str) {
        let _ = self.store.delete(&layout::version_data_path(loc, version)).await;
        let _ = self.store.delete(&layout::version_meta_path(loc, version)).await;
    }

    fn outbound(mut metadata: Metadata, etag: Option<String>) -> Metadata {
        if let Some(etag) = etag {
            metadata.set_etag(etag);
        }
        metadata.strip_internal();
        metadata
    }
}

#[async_trait]
impl StoreAdapter for VersionedStore {
    async fn save_data(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Metadata> {
        loc.validate()?;
        let current = self.read_current(loc).await?;
        let prev_modified = current.as_ref().and_then(|(doc, _)| doc.metadata.modified());

        let (persisted, version) = self
            .write_version(loc, metadata, audit, payload, prev_modified)
            .await?;
        let etag = self
            .commit_current(loc, &version, &persisted, CommitMode::Overwrite)
            .await?;
        Ok(Self::outbound(persisted, etag))
    }

    async fn try_optimistic_write(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Option<Metadata>> {
        loc.validate()?;
        let requested = metadata.etag().map(str::to_string);
        let mode = match requested.as_deref() {
            None => CommitMode::Create,
            Some("*") => CommitMode::Overwrite,
            Some(tag) => CommitMode::IfMatch(tag.to_string()),
        };

        let current = self.read_current(loc).await?;
        let prev_modified = current.as_ref().and_then(|(doc, _)| doc.metadata.modified());

        let (persisted, version) = self
            .write_version(loc, metadata, audit, payload, prev_modified)
            .await?;
        match self.commit_current(loc, &version, &persisted, mode).await? {
            Some(etag) => Ok(Some(Self::outbound(persisted, Some(etag)))),
            None => {
                debug!("optimistic write to {loc} lost its precondition");
                self.discard_version(loc, &version).await;
                Ok(None)
            }
        }
    }

    async fn get_metadata(
        &self,
        loc: &Location,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>> {
        loc.validate()?;
        match snapshot {
            Some(version) => {
                let path = layout::version_meta_path(loc, version);
                match get_json::<Metadata>(&self.store, &path).await? {
                    None => Ok(None),
                    Some((metadata, _)) => Ok(Some(Self::outbound(metadata, None))),
                }
            }
            None => match self.read_current(loc).await? {
                None => Ok(None),
                Some((doc, etag)) => Ok(Some(Self::outbound(doc.metadata, etag))),
            },
        }
    }

    async fn load_data(
        &self,
        loc: &Location,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>> {
        loc.validate()?;
        let (metadata, version) = match snapshot {
            None => match self.read_current(loc).await? {
                None => return Ok(None),
                Some((doc, _)) if doc.metadata.deleted().is_some() => return Ok(None),
                Some((doc, etag)) => (Self::outbound(doc.metadata, etag), doc.version),
            },
            Some(version) => {
                let path = layout::version_meta_path(loc, version);
                match get_json::<Metadata>(&self.store, &path).await? {
                    None => return Ok(None),
                    Some((metadata, _)) => (Self::outbound(metadata, None), version.to_string()),
                }
            }
        };

        let data_path = layout::version_data_path(loc, &version);
        let stream = open_stream(&self.store, &data_path)
            .await?
            .ok_or_else(|| Error::storage(data_path.as_ref(), "version data missing"))?;
        Ok(Some(DataWithMetadata { metadata, stream }))
    }

    async fn find_snapshots(
        &self,
        loc: &Location,
    ) -> Result<BoxStream<'static, Result<Snapshot>>> {
        loc.validate()?;
        snapshots_stream(&self.store, loc).await
    }

    async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<BoxStream<'static, Result<(Location, Metadata)>>> {
        validate_container(container)?;
        let list_prefix = layout::current_prefix(container, prefix);
        let pointer_paths = layout::list_locations(&self.store, &list_prefix).await?;

        let head = format!("{container}/{INTERNAL_PREFIX}/current/");
        let container = container.to_string();
        let entries: Vec<(Location, Path)> = pointer_paths
            .into_iter()
            .filter_map(|path| {
                let base_path = path.as_ref().strip_prefix(&head)?.to_string();
                Some((Location::new(container.clone(), base_path), path))
            })
            .collect();

        let store = Arc::clone(&self.store);
        let stream = stream::iter(entries)
            .then(move |(loc, path)| {
                let store = Arc::clone(&store);
                async move {
                    // Pointers deleted between listing and read are skipped.
                    match get_json::<CurrentDoc>(&store, &path).await? {
                        None => Ok(None),
                        Some((doc, etag)) => Ok(Some((loc, Self::outbound(doc.metadata, etag)))),
                    }
                }
            })
            .try_filter_map(|item| future::ready(Ok(item)))
            .boxed();
        Ok(stream)
    }

    async fn soft_delete(&self, loc: &Location, audit: Option<&AuditInfo>) -> Result<()> {
        loc.validate()?;
        let Some((doc, _)) = self.read_current(loc).await? else {
            return Ok(());
        };
        if doc.metadata.deleted().is_some() {
            return Ok(());
        }

        let prev = doc.metadata;
        let modified = monotonic_now(prev.modified());
        let version = new_version_id(modified);
        let mut tombstone = build_persisted(prev, audit, 0, modified, &version, true);
        tombstone.set_deleted(modified);
        // The tombstone's content is empty and uncompressed.
        tombstone.remove(crate::metadata::keys::COMPRESSED);

        upload_stream(
            &self.store,
            &layout::version_data_path(loc, &version),
            stream::empty().boxed(),
            self.options.multipart_threshold,
        )
        .await?;
        put_json(&self.store, &layout::version_meta_path(loc, &version), &tombstone).await?;
        self.commit_current(loc, &version, &tombstone, CommitMode::Overwrite)
            .await?;
        debug!("soft-deleted {loc}");
        Ok(())
    }

    async fn permanent_delete(&self, loc: &Location) -> Result<()> {
        loc.validate()?;
        delete_all_versions(&self.store, loc).await?;
        let pointer = layout::current_path(loc);
        match self.store.delete(&pointer).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => return Err(map_backend_err(&pointer, e)),
        }
        debug!("permanently deleted {loc}");
        Ok(())
    }

    async fn lock(&self, loc: &Location) -> Result<Option<LockLease>> {
        loc.validate()?;
        lock::acquire(
            Arc::clone(&self.store),
            layout::lock_path(loc),
            self.options.lock_lease(),
            self.options.lock_renew(),
        )
        .await
    }

    async fn save_metadata(
        &self,
        loc: &Location,
        metadata: Metadata,
    ) -> Result<Option<Metadata>> {
        loc.validate()?;
        let Some((doc, _)) = self.read_current(loc).await? else {
            return Ok(None);
        };
        let prev = doc.metadata;
        let modified = monotonic_now(prev.modified());
        let version = new_version_id(modified);

        // Content is preserved: the new version's data is a copy of the
        // current one, so its length and codec carry over too.
        let src = layout::version_data_path(loc, &doc.version);
        let dst = layout::version_data_path(loc, &version);
        self.store
            .copy(&src, &dst)
            .await
            .map_err(|e| map_backend_err(&src, e))?;

        let mut persisted = build_persisted(
            metadata,
            None,
            prev.content_length().unwrap_or(0),
            modified,
            &version,
            true,
        );
        if let Some(codec) = prev.compressed() {
            persisted.set(crate::metadata::keys::COMPRESSED, codec);
        }
        // A metadata-only update never resurrects a soft-deleted record.
        if let Some(deleted) = prev.deleted() {
            persisted.set_deleted(deleted);
        }

        put_json(&self.store, &layout::version_meta_path(loc, &version), &persisted).await?;
        let etag = self
            .commit_current(loc, &version, &persisted, CommitMode::Overwrite)
            .await?;
        Ok(Some(Self::outbound(persisted, etag)))
    }

    async fn create_container_if_not_exists(&self, container: &str) -> Result<()> {
        validate_container(container)?;
        // Containers are key namespaces within the backing store; there is
        // nothing to provision beyond validating the name.
        debug!("container {container} ready");
        Ok(())
    }

    fn can_compress(&self) -> bool {
        true
    }
}
