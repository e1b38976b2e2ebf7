//! Leo Store
//!
//! An encrypted, versioned object-storage engine layered over cloud blob
//! backends, with a queue-driven index listener that fans change events out
//! to pluggable indexers.
//!
//! The engine-facing entry points are [`SecureStore`] (writes through an
//! optional compress-and-encrypt pipeline, snapshots, soft deletes,
//! optimistic concurrency, per-key locks, change-event emission) and
//! [`IndexListener`] (per-logical-key serialized dispatch with cross-key
//! parallelism and at-least-once redelivery). [`DocumentPartition`] and
//! [`ObjectPartition`] add application-level addressing sugar on top.

pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod listener;
pub mod location;
pub mod metadata;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod queue;
pub mod secure;
pub mod store;

mod retry;

pub use config::{LeoConfig, ListenerSettings};
pub use data::{ByteStream, DataWithMetadata, WritePayload};
pub use error::{Error, Result};
pub use events::StoreDataDetails;
pub use listener::{ErrorSink, IndexListener, Indexer, ListenerConfig};
pub use location::Location;
pub use metadata::{AuditInfo, Metadata, Snapshot};
pub use metrics::{MetricsReport, StoreMetrics};
pub use partition::{DocumentPartition, EncryptorProvider, ItemConfiguration, ObjectPartition};
pub use pipeline::{Codec, Encryptor};
pub use queue::{LeasedMessage, MemoryQueue, QueueClient};
pub use secure::{SecureStore, SecureStoreOptions};
pub use store::{
    create_adapter, ListingStore, LockLease, StoreAdapter, StoreBackendConfig, StoreFlavor,
    StoreOptions, VersionedStore,
};
