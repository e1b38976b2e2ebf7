//! Byte stream plumbing shared by the adapters and the secure store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};

use crate::metadata::Metadata;
use crate::Result;

/// A finite, single-consumer stream of byte chunks. Completion and errors are
/// signaled through the stream items; consumers must drain it or drop it.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// The read projection: a lazy byte stream plus the record's metadata.
pub struct DataWithMetadata {
    pub metadata: Metadata,
    pub stream: ByteStream,
}

impl DataWithMetadata {
    /// Drain the stream into a single buffer.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for DataWithMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWithMetadata")
            .field("metadata", &self.metadata)
            .field("stream", &"<lazy>")
            .finish()
    }
}

/// The write-side payload handed to a store adapter.
///
/// `logical` observes the logical (pre-compression, pre-encryption) byte
/// count; the count is final once the stream has been drained, which happens
/// before the adapter commits metadata.
pub struct WritePayload {
    stream: ByteStream,
    logical: Arc<AtomicU64>,
}

impl WritePayload {
    /// Payload from a fully materialized buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let logical = Arc::new(AtomicU64::new(data.len() as u64));
        Self {
            stream: stream::once(async move { Ok(data) }).boxed(),
            logical,
        }
    }

    /// Payload from a caller stream; chunk lengths are counted as the stream
    /// is consumed.
    pub fn from_stream<S>(source: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes>> + Send + 'static,
    {
        let logical = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&logical);
        let stream = source
            .inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
            })
            .boxed();
        Self { stream, logical }
    }

    /// Logical bytes observed so far; the full count once drained.
    pub fn logical_len(&self) -> u64 {
        self.logical.load(Ordering::Relaxed)
    }

    /// Apply a stream transform (compression, encryption) without disturbing
    /// the logical counter.
    pub(crate) fn map_stream<F>(self, transform: F) -> Self
    where
        F: FnOnce(ByteStream) -> ByteStream,
    {
        Self {
            stream: transform(self.stream),
            logical: self.logical,
        }
    }

    /// Split into the stored-byte stream and the logical counter.
    pub(crate) fn into_parts(self) -> (ByteStream, Arc<AtomicU64>) {
        (self.stream, self.logical)
    }
}

impl std::fmt::Debug for WritePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePayload")
            .field("logical", &self.logical_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_bytes_counts_immediately() {
        let payload = WritePayload::from_bytes(Bytes::from(vec![0u8; 512]));
        assert_eq!(payload.logical_len(), 512);
    }

    #[tokio::test]
    async fn from_stream_counts_on_drain() {
        let chunks = vec![Ok(Bytes::from(vec![1u8; 100])), Ok(Bytes::from(vec![2u8; 50]))];
        let payload = WritePayload::from_stream(stream::iter(chunks));
        assert_eq!(payload.logical_len(), 0);

        let (mut stream, logical) = payload.into_parts();
        while stream.next().await.is_some() {}
        assert_eq!(logical.load(Ordering::Relaxed), 150);
    }
}
