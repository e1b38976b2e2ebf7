//! Streaming transforms between caller bytes and the backend adapter.
//!
//! Write order: caller bytes -> compression -> encryption -> backend.
//! Read order is the inverse: backend -> decryption -> decompression.

mod compression;
mod encryption;

pub use compression::{compress, compress_with_level, decompress, Codec, DEFAULT_ZSTD_LEVEL};
pub use encryption::Encryptor;

use std::sync::Arc;

use crate::data::{ByteStream, WritePayload};

/// Compose the write-side pipeline over a payload.
pub(crate) fn apply_write(
    payload: WritePayload,
    codec: Option<Codec>,
    encryptor: Option<&Arc<dyn Encryptor>>,
) -> WritePayload {
    let payload = match codec {
        Some(codec) if codec != Codec::None => {
            payload.map_stream(|stream| compression::compress_stream(stream, codec))
        }
        _ => payload,
    };
    match encryptor {
        Some(encryptor) => {
            let encryptor = Arc::clone(encryptor);
            payload.map_stream(move |stream| encryptor.encrypt(stream))
        }
        None => payload,
    }
}

/// Compose the read-side pipeline over a stored-byte stream.
pub(crate) fn apply_read(
    stream: ByteStream,
    codec: Option<Codec>,
    encryptor: Option<&Arc<dyn Encryptor>>,
) -> ByteStream {
    let stream = match encryptor {
        Some(encryptor) => encryptor.decrypt(stream),
        None => stream,
    };
    match codec {
        Some(codec) if codec != Codec::None => compression::decompress_stream(stream, codec),
        _ => stream,
    }
}
