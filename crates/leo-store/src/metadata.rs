//! The typed bag of named attributes carried with every blob.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Reserved metadata keys.
pub mod keys {
    /// Decimal byte count of the logical (pre-encryption, pre-compression) payload.
    pub const CONTENT_LENGTH: &str = "ContentLength";
    /// Last-modified timestamp in epoch ticks, monotonic within a key.
    pub const MODIFIED: &str = "Modified";
    /// Media type.
    pub const CONTENT_TYPE: &str = "ContentType";
    /// Backend-assigned opaque version id.
    pub const SNAPSHOT: &str = "Snapshot";
    /// Backend-assigned opaque concurrency tag.
    pub const ETAG: &str = "ETag";
    /// Presence marks soft-deleted; value is the tick of the deletion.
    pub const DELETED: &str = "LeoDeleted";
    /// Application-type discriminator used by the index listener.
    pub const TYPE: &str = "Type";
    /// Transient marker on synthetic re-emission into the index queue.
    pub const REINDEX: &str = "Reindex";
    /// Write-audit information, JSON-encoded.
    pub const AUDIT: &str = "Audit";
    /// Codec applied by the write pipeline, needed to invert reads.
    pub const COMPRESSED: &str = "Compressed";
    /// Adapter-private format marker. Must never leak to consumers.
    pub const STORE_VERSION: &str = "leo-store-version";
}

/// Value written under [`keys::STORE_VERSION`] by the versioned adapter.
pub(crate) const STORE_VERSION_VALUE: &str = "2.0";

/// Current time in epoch ticks (microseconds since the Unix epoch).
pub fn now_ticks() -> i64 {
    Utc::now().timestamp_micros()
}

/// Who performed a write, recorded with the object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    /// Principal id of the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    /// Display name of the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// String-keyed metadata with typed accessors for the reserved keys.
///
/// Non-reserved keys pass through writes verbatim; a write always overwrites
/// the full user-visible set (no merge).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get(keys::CONTENT_LENGTH)?.parse().ok()
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.set(keys::CONTENT_LENGTH, length.to_string());
    }

    pub fn modified(&self) -> Option<i64> {
        self.get(keys::MODIFIED)?.parse().ok()
    }

    pub fn set_modified(&mut self, ticks: i64) {
        self.set(keys::MODIFIED, ticks.to_string());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(keys::CONTENT_TYPE)
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.get(keys::SNAPSHOT)
    }

    pub fn set_snapshot(&mut self, id: impl Into<String>) {
        self.set(keys::SNAPSHOT, id);
    }

    pub fn etag(&self) -> Option<&str> {
        self.get(keys::ETAG)
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.set(keys::ETAG, etag);
    }

    /// Tick of the soft deletion, when this record is soft-deleted.
    pub fn deleted(&self) -> Option<i64> {
        self.get(keys::DELETED)?.parse().ok()
    }

    pub fn set_deleted(&mut self, ticks: i64) {
        self.set(keys::DELETED, ticks.to_string());
    }

    pub fn type_name(&self) -> Option<&str> {
        self.get(keys::TYPE)
    }

    pub fn reindex(&self) -> bool {
        self.get(keys::REINDEX)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn set_reindex(&mut self) {
        self.set(keys::REINDEX, "true");
    }

    pub fn clear_reindex(&mut self) {
        self.remove(keys::REINDEX);
    }

    pub fn audit(&self) -> Option<AuditInfo> {
        serde_json::from_str(self.get(keys::AUDIT)?).ok()
    }

    pub fn set_audit(&mut self, audit: &AuditInfo) {
        if let Ok(json) = serde_json::to_string(audit) {
            self.set(keys::AUDIT, json);
        }
    }

    pub(crate) fn compressed(&self) -> Option<&str> {
        self.get(keys::COMPRESSED)
    }

    /// Drop adapter-private keys before metadata crosses the outbound boundary.
    pub(crate) fn strip_internal(&mut self) {
        self.0.remove(keys::STORE_VERSION);
    }

    /// Drop the keys computed by the adapter on every write, keeping the
    /// caller-supplied set (user keys plus content type, type and audit).
    pub(crate) fn strip_computed(&mut self) {
        for key in [
            keys::CONTENT_LENGTH,
            keys::MODIFIED,
            keys::SNAPSHOT,
            keys::ETAG,
            keys::DELETED,
            keys::STORE_VERSION,
        ] {
            self.0.remove(key);
        }
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Metadata {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// An immutable prior version of a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Backend-assigned opaque version id.
    pub id: String,
    /// Modified tick captured at creation.
    pub modified: i64,
    /// Metadata captured at creation.
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_round_trip() {
        let mut metadata = Metadata::new();
        metadata.set_content_length(1024);
        metadata.set_modified(42);
        metadata.set("metadata1", "somemetadata");

        assert_eq!(metadata.content_length(), Some(1024));
        assert_eq!(metadata.modified(), Some(42));
        assert_eq!(metadata.get("metadata1"), Some("somemetadata"));
        assert!(metadata.deleted().is_none());
    }

    #[test]
    fn strip_internal_removes_the_marker_only() {
        let mut metadata = Metadata::from([
            (keys::STORE_VERSION, STORE_VERSION_VALUE),
            ("user", "kept"),
        ]);
        metadata.strip_internal();
        assert!(metadata.get(keys::STORE_VERSION).is_none());
        assert_eq!(metadata.get("user"), Some("kept"));
    }

    #[test]
    fn audit_round_trips_through_json() {
        let mut metadata = Metadata::new();
        let audit = AuditInfo {
            by: Some("user-1".to_string()),
            name: Some("User One".to_string()),
        };
        metadata.set_audit(&audit);
        assert_eq!(metadata.audit(), Some(audit));
    }

    #[test]
    fn reindex_flag_parses_and_clears() {
        let mut metadata = Metadata::new();
        assert!(!metadata.reindex());
        metadata.set_reindex();
        assert!(metadata.reindex());
        metadata.clear_reindex();
        assert!(!metadata.reindex());
    }
}
