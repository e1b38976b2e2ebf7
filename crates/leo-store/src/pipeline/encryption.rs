//! Streaming encryption seam.
//!
//! Key management and the concrete cipher live outside the engine; the store
//! only consumes this contract. When no encryptor is supplied, bytes pass
//! through untouched.

use crate::data::ByteStream;

/// A streaming authenticated-encryption transform.
///
/// Implementations map a plaintext chunk stream to a ciphertext chunk stream
/// and back. Chunk boundaries on the two sides need not correspond; the only
/// requirement is `decrypt(encrypt(s)) == s` for any finite stream `s`.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plain: ByteStream) -> ByteStream;
    fn decrypt(&self, cipher: ByteStream) -> ByteStream;
}
