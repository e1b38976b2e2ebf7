//! Payload compression codecs.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::data::ByteStream;
use crate::{Error, Result};

/// Default compression level for zstd
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Codec applied to a logical payload before encryption and upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    None,
    #[default]
    Zstd,
    Lz4,
}

impl Codec {
    /// Name recorded in metadata so reads can invert the write pipeline.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "none" => Some(Codec::None),
            "zstd" => Some(Codec::Zstd),
            "lz4" => Some(Codec::Lz4),
            _ => None,
        }
    }
}

/// Compress data using the specified codec
pub fn compress(data: &[u8], codec: Codec) -> Result<Vec<u8>> {
    compress_with_level(data, codec, DEFAULT_ZSTD_LEVEL)
}

/// Compress data using the specified codec and compression level
pub fn compress_with_level(data: &[u8], codec: Codec, level: i32) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Zstd => compress_zstd_with_level(data, level),
        Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
    }
}

/// Decompress data using the specified codec
pub fn decompress(data: &[u8], codec: Codec) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Zstd => decompress_zstd(data),
        Codec::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Compression(format!("Failed to decompress lz4 data: {}", e))),
    }
}

fn compress_zstd_with_level(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)
        .map_err(|e| Error::Compression(format!("Failed to create zstd encoder: {}", e)))?;

    encoder
        .write_all(data)
        .map_err(|e| Error::Compression(format!("Failed to write to zstd encoder: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| Error::Compression(format!("Failed to finish zstd compression: {}", e)))
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(data)
        .map_err(|e| Error::Compression(format!("Failed to create zstd decoder: {}", e)))?;

    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Compression(format!("Failed to decompress zstd data: {}", e)))?;

    Ok(output)
}

/// Buffer the stream and emit the compressed payload as a single chunk.
pub(crate) fn compress_stream(mut source: ByteStream, codec: Codec) -> ByteStream {
    stream::once(async move {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = source.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let compressed = compress(&buffer, codec)?;
        Ok(Bytes::from(compressed))
    })
    .boxed()
}

/// Buffer the stream and emit the decompressed payload as a single chunk.
pub(crate) fn decompress_stream(mut source: ByteStream, codec: Codec) -> ByteStream {
    stream::once(async move {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = source.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let decompressed = decompress(&buffer, codec)?;
        Ok(Bytes::from(decompressed))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_roundtrip() {
        let data = b"some payload worth compressing, repeated repeated repeated";
        let compressed = compress(data, Codec::Zstd).unwrap();
        let decompressed = decompress(&compressed, Codec::Zstd).unwrap();
        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn lz4_roundtrip() {
        let data = b"another payload, this one for lz4";
        let compressed = compress(data, Codec::Lz4).unwrap();
        let decompressed = decompress(&compressed, Codec::Lz4).unwrap();
        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn codec_names_round_trip() {
        for codec in [Codec::None, Codec::Zstd, Codec::Lz4] {
            assert_eq!(Codec::from_name(codec.name()), Some(codec));
        }
        assert_eq!(Codec::from_name("gzip"), None);
    }
}
