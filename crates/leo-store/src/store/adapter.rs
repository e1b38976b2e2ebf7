//! Backend store adapter trait definition.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::data::{DataWithMetadata, WritePayload};
use crate::location::Location;
use crate::metadata::{AuditInfo, Metadata, Snapshot};
use crate::store::lock::LockLease;
use crate::Result;

/// Abstracts one cloud object store: data I/O, snapshot listing, metadata,
/// soft-delete markers, optimistic conditional writes, lease locks and
/// prefix listing.
///
/// Missing objects surface as `Ok(None)`, never as errors. Failed optimistic
/// preconditions surface as `Ok(None)` from [`try_optimistic_write`].
///
/// [`try_optimistic_write`]: StoreAdapter::try_optimistic_write
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Persist a new current version from the payload stream and return the
    /// post-write metadata (assigned `Snapshot`, `ETag`, `Modified` and
    /// `ContentLength`). The full user-visible metadata set is overwritten,
    /// never merged. A payload error must leave no observable partial object.
    async fn save_data(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Metadata>;

    /// As [`save_data`], but the commit is conditional on `metadata`'s `ETag`:
    /// absent means create-only, `"*"` means unconditional, anything else
    /// must match the current tag. `Ok(None)` on a failed precondition, with
    /// no side effects.
    ///
    /// [`save_data`]: StoreAdapter::save_data
    async fn try_optimistic_write(
        &self,
        loc: &Location,
        metadata: Metadata,
        audit: Option<&AuditInfo>,
        payload: WritePayload,
    ) -> Result<Option<Metadata>>;

    /// Metadata of the current version, or of `snapshot` when given.
    /// A soft-deleted current is still returned; hiding it is the caller's
    /// decision ([`load_data`] hides it).
    ///
    /// [`load_data`]: StoreAdapter::load_data
    async fn get_metadata(&self, loc: &Location, snapshot: Option<&str>)
        -> Result<Option<Metadata>>;

    /// Lazy data stream plus metadata. `Ok(None)` when missing, or when no
    /// snapshot was requested and the current version is soft-deleted.
    async fn load_data(
        &self,
        loc: &Location,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>>;

    /// Versions stored for exactly this key (strict descendants excluded),
    /// newest first.
    async fn find_snapshots(
        &self,
        loc: &Location,
    ) -> Result<BoxStream<'static, Result<Snapshot>>>;

    /// Current versions under the container, optionally narrowed to a path
    /// prefix. Soft-deleted items may be included; the secure store filters
    /// them.
    async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<BoxStream<'static, Result<(Location, Metadata)>>>;

    /// Append a zero-length current version carrying the deletion marker and
    /// the prior user metadata. Succeeds silently when the object is missing.
    async fn soft_delete(&self, loc: &Location, audit: Option<&AuditInfo>) -> Result<()>;

    /// Remove the current version and every snapshot. Missing target is not
    /// an error.
    async fn permanent_delete(&self, loc: &Location) -> Result<()>;

    /// Acquire a lease on the lock object for this key. `Ok(None)` when the
    /// lock is held elsewhere. The lease auto-renews until released.
    async fn lock(&self, loc: &Location) -> Result<Option<LockLease>>;

    /// Metadata-only update preserving the current content and its logical
    /// length. `Ok(None)` when the target does not exist.
    async fn save_metadata(&self, loc: &Location, metadata: Metadata)
        -> Result<Option<Metadata>>;

    /// Idempotent container provisioning.
    async fn create_container_if_not_exists(&self, container: &str) -> Result<()>;

    /// Whether payload compression is worthwhile on this backend.
    fn can_compress(&self) -> bool;
}
