//! List-versions store flavor.
//!
//! No pointer document: every write is an immutable version object and the
//! current version of a key is the highest-modified version discovered by
//! listing. ETags are synthesized from version ids, so optimistic writes are
//! best-effort compare-then-commit rather than backend-linearized, and no
//! format marker is written.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::ObjectStore;
use tracing::{debug, info};

use crate::data::{DataWithMetadata, WritePayload};
use crate::location::{validate_container, Location, INTERNAL_PREFIX};
use crate::metadata::{AuditInfo, Metadata, Snapshot};
use crate::store::adapter::StoreAdapter;
use crate::store::config::StoreOptions;
use crate::store::layout::{
    self, build_persisted, delete_all_versions, exact_version_ids, get_json, map_backend_err,
    monotonic_now, new_version_id, open_stream, put_json, snapshots_stream, upload_stream,
    META_SUFFIX,
};
use crate::store::lock::{self, LockLease};
use crate::{Error, Result};

/// Store adapter over a backend without conditional writes, deriving the
/// current version from per-key version listings.
pub struct ListingStore {
    store: Arc<dyn ObjectStore>,
    options: StoreOptions,
}

impl ListingStore {
    pub fn new(store: Arc<dyn ObjectStore>, options: StoreOptions) -> Self {
        info!(
            "created listing store adapter (multipart threshold {} bytes)",
            options.multipart_threshold
        );
        Self { store, options }
    }

    /// The highest-modified version of exactly this key, with its metadata.
    async fn read_current(&self, loc: &Location) -> Result<Option<(String, Metadata)>> {
        let Some(version) = exact_version_ids(&self.store, loc).await?.into_iter().next() else {
            return Ok(None);
        };
        let path = layout::version_meta_path(loc, &version);
        let (metadata, _) = get_json::<Metadata>(&self.store, &path)
            .await?
            .ok_or_else(|| Error::storage(path.as_ref(), "version metadata missing"))?;
        Ok(Some((version, metadata)))
    }

    async fn write_version(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
        prev_modified: Option<i64>,
    ) -> Result<Metadata> {
        let modified = monotonic_now(prev_modified);
        let version = new_version_id(modified);
        let data_path = layout::version_data_path(loc, &version);

        let (stream, logical) = payload.into_parts();
        let stored =
            upload_stream(&self.store, &data_path, stream, self.options.multipart_threshold)
                .await?;
        debug!("wrote version {version} of {loc} ({stored} stored bytes)");

        let persisted = build_persisted(
            metadata,
            audit,
            logical.load(Ordering::Relaxed),
            modified,
            &version,
            false,
        );
        if let Err(err) =
            put_json(&self.store, &layout::version_meta_path(loc, &version), &persisted).await
        {
            let _ = self.store.delete(&data_path).await;
            return Err(err);
        }
        Ok(Self::outbound(persisted, version))
    }

    /// This flavor has no backend concurrency tag on the logical record, so
    /// the opaque version id doubles as the ETag.
    fn outbound(mut metadata: Metadata, version: String) -> Metadata {
        metadata.set_etag(version);
        metadata.strip_internal();
        metadata
    }
}

#[async_trait]
impl StoreAdapter for ListingStore {
    async fn save_data(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Metadata> {
        loc.validate()?;
        let prev_modified = self
            .read_current(loc)
            .await?
            .and_then(|(_, m)| m.modified());
        self.write_version(loc, metadata, audit, payload, prev_modified)
            .await
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
        let current = self.read_current(loc).await?;

        // Compare-then-commit: this backend cannot make the check and the
        // write atomic, so a racing writer can still slip in between.
        let precondition_holds = match requested.as_deref() {
            None => current.is_none(),
            Some("*") => true,
            Some(tag) => current
                .as_ref()
                .is_some_and(|(version, _)| version.as_str() == tag),
        };
        if !precondition_holds {
            debug!("optimistic write to {loc} lost its precondition");
            return Ok(None);
        }

        let prev_modified = current.and_then(|(_, m)| m.modified());
        self.write_version(loc, metadata, audit, payload, prev_modified)
            .await
            .map(Some)
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
                    Some((metadata, _)) => Ok(Some(Self::outbound(metadata, version.to_string()))),
                }
            }
            None => match self.read_current(loc).await? {
                None => Ok(None),
                Some((version, metadata)) => Ok(Some(Self::outbound(metadata, version))),
            },
        }
    }

    async fn load_data(
        &self,
        loc: &Location,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>> {
        loc.validate()?;
        let (version, metadata) = match snapshot {
            None => match self.read_current(loc).await? {
                None => return Ok(None),
                Some((_, metadata)) if metadata.deleted().is_some() => return Ok(None),
                Some(current) => current,
            },
            Some(version) => {
                let path = layout::version_meta_path(loc, version);
                match get_json::<Metadata>(&self.store, &path).await? {
                    None => return Ok(None),
                    Some((metadata, _)) => (version.to_string(), metadata),
                }
            }
        };

        let data_path = layout::version_data_path(loc, &version);
        let stream = open_stream(&self.store, &data_path)
            .await?
            .ok_or_else(|| Error::storage(data_path.as_ref(), "version data missing"))?;
        Ok(Some(DataWithMetadata {
            metadata: Self::outbound(metadata, version),
            stream,
        }))
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
        let list_prefix = layout::versions_root(container, prefix);
        let entries = layout::list_locations(&self.store, &list_prefix).await?;

        // Group version metadata entries by base path and keep the highest
        // version id of each, which is the current one.
        let head = format!("{container}/{INTERNAL_PREFIX}/v/");
        let mut current: BTreeMap<String, String> = BTreeMap::new();
        for entry in entries {
            let Some(rest) = entry.as_ref().strip_prefix(&head) else {
                continue;
            };
            let Some(stripped) = rest.strip_suffix(META_SUFFIX) else {
                continue;
            };
            let Some((base_path, version)) = stripped.rsplit_once('/') else {
                continue;
            };
            match current.entry(base_path.to_string()) {
                Entry::Occupied(mut slot) => {
                    if slot.get().as_str() < version {
                        slot.insert(version.to_string());
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(version.to_string());
                }
            }
        }

        let container = container.to_string();
        let items: Vec<(Location, String)> = current
            .into_iter()
            .map(|(base_path, version)| (Location::new(container.clone(), base_path), version))
            .collect();
        let store = Arc::clone(&self.store);
        let stream = stream::iter(items)
            .then(move |(loc, version)| {
                let store = Arc::clone(&store);
                async move {
                    let path = layout::version_meta_path(&loc, &version);
                    // Versions vacuumed between listing and read are skipped.
                    match get_json::<Metadata>(&store, &path).await? {
                        None => Ok(None),
                        Some((metadata, _)) => {
                            Ok(Some((loc, Self::outbound(metadata, version))))
                        }
                    }
                }
            })
            .try_filter_map(|item| future::ready(Ok(item)))
            .boxed();
        Ok(stream)
    }

    async fn soft_delete(&self, loc: &Location, audit: Option<&AuditInfo>) -> Result<()> {
        loc.validate()?;
        let Some((_, prev)) = self.read_current(loc).await? else {
            return Ok(());
        };
        if prev.deleted().is_some() {
            return Ok(());
        }

        let modified = monotonic_now(prev.modified());
        let version = new_version_id(modified);
        let mut tombstone = build_persisted(prev, audit, 0, modified, &version, false);
        tombstone.set_deleted(modified);
        tombstone.remove(crate::metadata::keys::COMPRESSED);

        upload_stream(
            &self.store,
            &layout::version_data_path(loc, &version),
            stream::empty().boxed(),
            self.options.multipart_threshold,
        )
        .await?;
        put_json(&self.store, &layout::version_meta_path(loc, &version), &tombstone).await?;
        debug!("soft-deleted {loc}");
        Ok(())
    }

    async fn permanent_delete(&self, loc: &Location) -> Result<()> {
        loc.validate()?;
        delete_all_versions(&self.store, loc).await?;
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
        let Some((current_version, prev)) = self.read_current(loc).await? else {
            return Ok(None);
        };
        let modified = monotonic_now(prev.modified());
        let version = new_version_id(modified);

        let src = layout::version_data_path(loc, &current_version);
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
            false,
        );
        if let Some(codec) = prev.compressed() {
            persisted.set(crate::metadata::keys::COMPRESSED, codec);
        }
        if let Some(deleted) = prev.deleted() {
            persisted.set_deleted(deleted);
        }

        put_json(&self.store, &layout::version_meta_path(loc, &version), &persisted).await?;
        Ok(Some(Self::outbound(persisted, version)))
    }

    async fn create_container_if_not_exists(&self, container: &str) -> Result<()> {
        validate_container(container)?;
        debug!("container {container} ready");
        Ok(())
    }

    fn can_compress(&self) -> bool {
        false
    }
}
