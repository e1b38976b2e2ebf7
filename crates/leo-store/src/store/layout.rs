//! Adapter-private key layout and backend helpers shared by both store
//! flavors.
//!
//! Everything an adapter writes lives under `{container}/.leo/`:
//!
//! ```text
//! {container}/.leo/current/{base_path}        current pointer (versioned flavor)
//! {container}/.leo/v/{base_path}/{version}        immutable version data
//! {container}/.leo/v/{base_path}/{version}.meta   metadata captured at creation
//! {container}/.leo/lock/{base_path}           lease object
//! ```
//!
//! Version ids are `{modified:020}-{random}` so the lexicographic order of
//! ids is the modified order, and a path listing never needs a sidecar read
//! to sort.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use object_store::path::Path;
use object_store::{
    Error as ObjectStoreError, ObjectStore, PutMode, PutOptions, PutPayload, WriteMultipart,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::data::ByteStream;
use crate::location::{Location, INTERNAL_PREFIX};
use crate::metadata::{self, keys, AuditInfo, Metadata, Snapshot};
use crate::retry::with_transient_retry;
use crate::{Error, Result};

pub(crate) const META_SUFFIX: &str = ".meta";

pub(crate) fn current_path(loc: &Location) -> Path {
    Path::from(format!(
        "{}/{}/current/{}",
        loc.container, INTERNAL_PREFIX, loc.base_path
    ))
}

pub(crate) fn current_prefix(container: &str, prefix: Option<&str>) -> Path {
    match prefix {
        Some(p) if !p.is_empty() => {
            Path::from(format!("{container}/{INTERNAL_PREFIX}/current/{p}"))
        }
        _ => Path::from(format!("{container}/{INTERNAL_PREFIX}/current")),
    }
}

pub(crate) fn version_prefix(loc: &Location) -> Path {
    Path::from(format!(
        "{}/{}/v/{}",
        loc.container, INTERNAL_PREFIX, loc.base_path
    ))
}

pub(crate) fn versions_root(container: &str, prefix: Option<&str>) -> Path {
    match prefix {
        Some(p) if !p.is_empty() => Path::from(format!("{container}/{INTERNAL_PREFIX}/v/{p}")),
        _ => Path::from(format!("{container}/{INTERNAL_PREFIX}/v")),
    }
}

pub(crate) fn version_data_path(loc: &Location, version: &str) -> Path {
    Path::from(format!(
        "{}/{}/v/{}/{}",
        loc.container, INTERNAL_PREFIX, loc.base_path, version
    ))
}

pub(crate) fn version_meta_path(loc: &Location, version: &str) -> Path {
    Path::from(format!(
        "{}/{}/v/{}/{}{}",
        loc.container, INTERNAL_PREFIX, loc.base_path, version, META_SUFFIX
    ))
}

pub(crate) fn lock_path(loc: &Location) -> Path {
    Path::from(format!(
        "{}/{}/lock/{}",
        loc.container, INTERNAL_PREFIX, loc.base_path
    ))
}

/// Mint a version id whose lexicographic order is the modified order.
pub(crate) fn new_version_id(modified: i64) -> String {
    format!("{:020}-{:08x}", modified.max(0), rand::random::<u32>())
}

/// Modified tick embedded in a version id.
pub(crate) fn version_modified(id: &str) -> Option<i64> {
    id.split('-').next()?.parse().ok()
}

/// Next modified tick, strictly after the previous one for this key.
pub(crate) fn monotonic_now(prev: Option<i64>) -> i64 {
    let now = metadata::now_ticks();
    match prev {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    }
}

/// Map a backend error that is not a precondition/not-found case.
/// Untyped backend failures are treated as transient so the retry policy can
/// have a go at them; everything else wraps the offending path.
pub(crate) fn map_backend_err(path: &Path, err: ObjectStoreError) -> Error {
    match err {
        ObjectStoreError::Generic { source, .. } => {
            Error::Transient(format!("{}: {source}", path.as_ref()))
        }
        other => Error::storage(path.as_ref(), other),
    }
}

/// Fetch and deserialize a JSON document, returning its backend ETag.
/// `Ok(None)` when the object does not exist.
pub(crate) async fn get_json<T: DeserializeOwned>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
) -> Result<Option<(T, Option<String>)>> {
    with_transient_retry("get", || async move {
        match store.get(path).await {
            Ok(result) => {
                let etag = result.meta.e_tag.clone();
                let bytes = result.bytes().await.map_err(|e| map_backend_err(path, e))?;
                let doc = serde_json::from_slice(&bytes)?;
                Ok(Some((doc, etag)))
            }
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_backend_err(path, e)),
        }
    })
    .await
}

/// Serialize and write a JSON document unconditionally.
pub(crate) async fn put_json<T: Serialize>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    doc: &T,
) -> Result<()> {
    let body = Bytes::from(serde_json::to_vec(doc)?);
    with_transient_retry("put", || {
        let body = body.clone();
        async move {
            store
                .put(path, PutPayload::from_bytes(body))
                .await
                .map_err(|e| map_backend_err(path, e))?;
            Ok(())
        }
    })
    .await
}

/// Conditional commit modes for pointer-style objects.
#[derive(Debug, Clone)]
pub(crate) enum CommitMode {
    Overwrite,
    Create,
    IfMatch(String),
}

/// Write a JSON document under a commit mode. `Ok(None)` when the
/// precondition failed; `Ok(Some(etag))` on success.
pub(crate) async fn put_json_conditional<T: Serialize>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    doc: &T,
    mode: &CommitMode,
) -> Result<Option<String>> {
    let body = Bytes::from(serde_json::to_vec(doc)?);
    let put_mode = match mode {
        CommitMode::Overwrite => PutMode::Overwrite,
        CommitMode::Create => PutMode::Create,
        CommitMode::IfMatch(etag) => PutMode::Update(object_store::UpdateVersion {
            e_tag: Some(etag.clone()),
            version: None,
        }),
    };
    match store
        .put_opts(path, PutPayload::from_bytes(body), PutOptions::from(put_mode))
        .await
    {
        Ok(result) => Ok(Some(
            result
                .e_tag
                .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>())),
        )),
        Err(ObjectStoreError::AlreadyExists { .. })
        | Err(ObjectStoreError::Precondition { .. }) => Ok(None),
        // If-Match against a vanished object is a failed precondition too.
        Err(ObjectStoreError::NotFound { .. }) if matches!(mode, CommitMode::IfMatch(_)) => {
            Ok(None)
        }
        Err(e) => Err(map_backend_err(path, e)),
    }
}

/// Stream a payload into an object. Payloads that fit below `threshold` go up
/// as a single put; larger ones switch to a multi-part upload. Returns the
/// stored byte count. On failure the partially written object is removed on a
/// best-effort basis so it is never observable.
pub(crate) async fn upload_stream(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    stream: ByteStream,
    threshold: usize,
) -> Result<u64> {
    match upload_stream_inner(store, path, stream, threshold).await {
        Ok(stored) => Ok(stored),
        Err(err) => {
            let _ = store.delete(path).await;
            Err(err)
        }
    }
}

async fn upload_stream_inner(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    mut stream: ByteStream,
    threshold: usize,
) -> Result<u64> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        if buffer.len() >= threshold {
            return upload_multipart(store, path, buffer, stream).await;
        }
    }
    let stored = buffer.len() as u64;
    store
        .put(path, PutPayload::from_bytes(buffer.freeze()))
        .await
        .map_err(|e| map_backend_err(path, e))?;
    Ok(stored)
}

async fn upload_multipart(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    buffered: BytesMut,
    mut rest: ByteStream,
) -> Result<u64> {
    debug!("multi-part upload to {}", path);
    let upload = store
        .put_multipart(path)
        .await
        .map_err(|e| map_backend_err(path, e))?;
    let mut writer = WriteMultipart::new(upload);
    let mut stored = buffered.len() as u64;
    writer.write(&buffered);
    while let Some(chunk) = rest.next().await {
        let chunk = chunk?;
        stored += chunk.len() as u64;
        writer
            .wait_for_capacity(8)
            .await
            .map_err(|e| map_backend_err(path, e))?;
        writer.write(&chunk);
    }
    writer.finish().await.map_err(|e| map_backend_err(path, e))?;
    Ok(stored)
}

/// Open a lazy read stream over an object. `Ok(None)` when missing.
pub(crate) async fn open_stream(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
) -> Result<Option<ByteStream>> {
    match store.get(path).await {
        Ok(result) => {
            let path = path.clone();
            Ok(Some(
                result
                    .into_stream()
                    .map(move |chunk| chunk.map_err(|e| map_backend_err(&path, e)))
                    .boxed(),
            ))
        }
        Err(ObjectStoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(map_backend_err(path, e)),
    }
}

/// Collect the object paths under a prefix, with the transient retry.
pub(crate) async fn list_locations(
    store: &Arc<dyn ObjectStore>,
    prefix: &Path,
) -> Result<Vec<Path>> {
    with_transient_retry("list", || async move {
        let mut listing = store.list(Some(prefix));
        let mut paths = Vec::new();
        while let Some(item) = listing.next().await {
            paths.push(item.map_err(|e| map_backend_err(prefix, e))?.location);
        }
        Ok(paths)
    })
    .await
}

/// Version ids stored for exactly this key, newest first. Entries for child
/// paths (strict descendants) carry a `/` in their remainder and are skipped.
pub(crate) async fn exact_version_ids(
    store: &Arc<dyn ObjectStore>,
    loc: &Location,
) -> Result<Vec<String>> {
    let prefix = version_prefix(loc);
    let entries = list_locations(store, &prefix).await?;

    let head = format!("{}/", prefix.as_ref());
    let mut ids: Vec<String> = entries
        .iter()
        .filter_map(|location| {
            let rest = location.as_ref().strip_prefix(&head)?;
            if rest.contains('/') {
                return None;
            }
            rest.strip_suffix(META_SUFFIX).map(str::to_string)
        })
        .collect();
    ids.sort_unstable();
    ids.reverse();
    Ok(ids)
}

/// Lazy newest-first snapshot listing for exactly this key.
pub(crate) async fn snapshots_stream(
    store: &Arc<dyn ObjectStore>,
    loc: &Location,
) -> Result<futures::stream::BoxStream<'static, Result<Snapshot>>> {
    let ids = exact_version_ids(store, loc).await?;
    let items: Vec<(String, Path)> = ids
        .into_iter()
        .map(|id| {
            let path = version_meta_path(loc, &id);
            (id, path)
        })
        .collect();
    let store = Arc::clone(store);
    let stream = stream::iter(items)
        .then(move |(id, path)| {
            let store = Arc::clone(&store);
            async move {
                let (mut meta, _) = get_json::<Metadata>(&store, &path)
                    .await?
                    .ok_or_else(|| Error::storage(path.as_ref(), "snapshot metadata missing"))?;
                let modified = meta.modified().or_else(|| version_modified(&id)).unwrap_or(0);
                meta.strip_internal();
                Ok(Snapshot {
                    id,
                    modified,
                    metadata: meta,
                })
            }
        })
        .boxed();
    Ok(stream)
}

/// Delete every version object stored for exactly this key. Missing objects
/// are ignored.
pub(crate) async fn delete_all_versions(
    store: &Arc<dyn ObjectStore>,
    loc: &Location,
) -> Result<()> {
    for id in exact_version_ids(store, loc).await? {
        for path in [version_data_path(loc, &id), version_meta_path(loc, &id)] {
            match store.delete(&path).await {
                Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
                Err(e) => return Err(map_backend_err(&path, e)),
            }
        }
    }
    Ok(())
}

/// Assemble the metadata persisted with a new version: the caller's
/// user-visible set plus the computed keys. A write overwrites the full
/// user-visible set, so nothing from a prior version is merged in here.
pub(crate) fn build_persisted(
    caller: Metadata,
    audit: Option<&AuditInfo>,
    logical_length: u64,
    modified: i64,
    version: &str,
    with_marker: bool,
) -> Metadata {
    let mut persisted = caller;
    persisted.strip_computed();
    persisted.set_content_length(logical_length);
    persisted.set_modified(modified);
    persisted.set_snapshot(version);
    if let Some(audit) = audit {
        persisted.set_audit(audit);
    }
    if with_marker {
        persisted.set(keys::STORE_VERSION, crate::metadata::STORE_VERSION_VALUE);
    }
    persisted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ids_sort_by_modified() {
        let older = new_version_id(1_000);
        let newer = new_version_id(2_000);
        assert!(newer > older);
        assert_eq!(version_modified(&older), Some(1_000));
    }

    #[test]
    fn monotonic_now_never_goes_backwards() {
        let now = metadata::now_ticks();
        assert_eq!(monotonic_now(Some(now + 1_000_000)), now + 1_000_001);
        assert!(monotonic_now(None) >= now);
    }

    #[test]
    fn persisted_metadata_overwrites_computed_keys() {
        let caller = Metadata::from([
            ("user", "value"),
            (keys::ETAG, "stale"),
            (keys::CONTENT_LENGTH, "999"),
        ]);
        let persisted = build_persisted(caller, None, 42, 7, "v-1", true);
        assert_eq!(persisted.content_length(), Some(42));
        assert_eq!(persisted.modified(), Some(7));
        assert_eq!(persisted.snapshot(), Some("v-1"));
        assert_eq!(persisted.etag(), None);
        assert_eq!(persisted.get("user"), Some("value"));
        assert!(persisted.get(keys::STORE_VERSION).is_some());
    }
}
