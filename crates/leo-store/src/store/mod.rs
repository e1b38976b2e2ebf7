//! Backend store adapters.
//!
//! Two flavors conform to the same [`StoreAdapter`] contract:
//!
//! - [`VersionedStore`] keeps a conditional-write current pointer per key
//!   (backends with native optimistic concurrency);
//! - [`ListingStore`] derives the current version from per-key listings
//!   (backends without conditional writes).
//!
//! Both are generic over any [`object_store::ObjectStore`], so the in-memory
//! store backs hermetic tests while S3, Azure, GCS and the local filesystem
//! serve production.

mod adapter;
mod config;
mod layout;
mod listing;
mod lock;
mod versioned;

pub use adapter::StoreAdapter;
pub use config::{create_adapter, create_object_store, StoreBackendConfig, StoreFlavor, StoreOptions};
pub use listing::ListingStore;
pub use lock::LockLease;
pub use versioned::VersionedStore;
