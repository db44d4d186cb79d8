use crate::builder::ChunkCipherBuilder;
use crate::error::CryptoError;
use aead::inout::InOutBuf;
use aead::{AeadInOut, KeyInit, Nonce, Tag};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use getrandom::fill;
use std::fmt;
use std::sync::Arc;
use stratum_buffer::{BufferMut, BufferPool};

pub type Aes = Aes256Gcm;
pub type ChaCha = ChaCha20Poly1305;

/// AEAD algorithms a [`ChunkCipher`] can run on worker threads.
pub trait ChunkAead: AeadInOut + KeyInit + Send + Sync + 'static {}
impl<T: AeadInOut + KeyInit + Send + Sync + 'static> ChunkAead for T {}

/// Chunk payload format version.
pub const PAYLOAD_VERSION_V1: u8 = 1;

/// Header layout: `[version: u8][flags: u8]`
pub const HEADER_LEN: usize = 2;

/// AEAD nonce length (96-bit).
pub const NONCE_LEN: usize = 12;

/// AEAD tag length (128-bit).
pub const TAG_LEN: usize = 16;

/// Bytes a sealed payload adds on top of its plaintext.
pub const OVERHEAD: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Authenticated encryption of one chunk into a pool buffer.
///
/// Sealed payloads use the layout:
///
/// ```text
/// [V(1)][FLAGS(1)][NONCE(12)][CIPHERTEXT(N)][TAG(16)]
/// ```
///
/// Every seal draws a fresh random 96-bit nonce. The header bytes followed by the chunk key are
/// passed as associated data, so a payload opened under a different key, or with its version or
/// flags rewritten, fails authentication.
pub struct ChunkCipher<C: ChunkAead = Aes> {
    pub(crate) cipher: Arc<C>,
}

impl<C: ChunkAead> Clone for ChunkCipher<C> {
    fn clone(&self) -> Self {
        Self { cipher: Arc::clone(&self.cipher) }
    }
}

impl<C: ChunkAead> fmt::Debug for ChunkCipher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("algorithm", &std::any::type_name::<C>())
            .finish_non_exhaustive()
    }
}

impl<C: ChunkAead> ChunkCipher<C> {
    /// Returns a new [`ChunkCipherBuilder`].
    #[must_use]
    pub fn builder() -> ChunkCipherBuilder<C> {
        ChunkCipherBuilder::<C>::new()
    }

    fn next_nonce() -> Result<Nonce<C>, CryptoError> {
        let mut nonce = Nonce::<C>::default();
        fill(&mut nonce).map_err(|err| CryptoError::Encryption {
            message: err.to_string().into(),
            context: Some("System RNG unavailable for nonce generation".into()),
        })?;
        Ok(nonce)
    }

    /// Encrypts `plaintext` into a newly allocated buffer.
    ///
    /// # Errors
    /// * [`CryptoError::Encryption`] if nonce generation or the AEAD operation fails. The
    ///   partially written output is freed before returning.
    pub fn seal(
        &self,
        pool: &BufferPool,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<BufferMut, CryptoError> {
        let nonce = Self::next_nonce()?;

        let header = [PAYLOAD_VERSION_V1, 0];
        let mut out = pool.allocate(OVERHEAD + plaintext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let aad = authenticated(&header, associated_data);
        let data = &mut out.as_mut_slice()[HEADER_LEN + NONCE_LEN..];
        let tag = self
            .cipher
            .encrypt_inout_detached(&nonce, &aad, InOutBuf::from(data))
            .map_err(|_| CryptoError::Encryption {
                message: "Encryption failed".into(),
                context: Some("AEAD encryption failed".into()),
            })?;

        out.extend_from_slice(tag.as_slice());
        Ok(out)
    }

    /// Authenticates and decrypts a sealed payload into a newly allocated buffer.
    ///
    /// # Errors
    /// * [`CryptoError::InvalidPayload`] if the payload is truncated or has an unknown version.
    /// * [`CryptoError::Decryption`] if authentication fails. The partially written output is
    ///   freed before returning.
    pub fn open(
        &self,
        pool: &BufferPool,
        payload: &[u8],
        associated_data: &[u8],
    ) -> Result<BufferMut, CryptoError> {
        if payload.len() < OVERHEAD {
            return Err(CryptoError::InvalidPayload {
                message: format!(
                    "Payload too short ({} bytes). Expected at least {OVERHEAD} bytes",
                    payload.len()
                )
                .into(),
                context: None,
            });
        }

        let version = payload[0];
        if version != PAYLOAD_VERSION_V1 {
            return Err(CryptoError::InvalidPayload {
                message: "Unsupported payload version".into(),
                context: Some(format!("version={version}").into()),
            });
        }

        let (header, rest) = payload.split_at(HEADER_LEN);
        let (nonce_slice, rest) = rest.split_at(NONCE_LEN);
        let (ciphertext, tag_slice) = rest.split_at(rest.len() - TAG_LEN);

        let nonce: Nonce<C> = nonce_slice.try_into().map_err(|_| CryptoError::Decryption {
            message: "Invalid nonce length".into(),
            context: None,
        })?;
        let tag: Tag<C> = tag_slice.try_into().map_err(|_| CryptoError::Decryption {
            message: "Invalid tag length".into(),
            context: None,
        })?;

        let aad = authenticated(header, associated_data);
        let mut out = pool.allocate(ciphertext.len());
        out.extend_from_slice(ciphertext);
        self.cipher
            .decrypt_inout_detached(
                &nonce,
                &aad,
                InOutBuf::from(out.as_mut_slice()),
                &tag,
            )
            .map_err(|_| CryptoError::Decryption {
                message: "Decryption failed".into(),
                context: Some("AEAD authentication failed".into()),
            })?;

        Ok(out)
    }
}

/// Associated data actually bound into the tag: `[V][FLAGS]` then the caller's bytes.
fn authenticated(header: &[u8], associated_data: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + associated_data.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(associated_data);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ChunkCipher<ChaCha> {
        ChunkCipher::builder().derived_key("ikm", "salt", "bucket-a").unwrap().build().unwrap()
    }

    #[test]
    fn test_nonce_sequence() {
        let n1 = ChunkCipher::<ChaCha>::next_nonce().unwrap();
        let n2 = ChunkCipher::<ChaCha>::next_nonce().unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_seal_layout() {
        let pool = BufferPool::new();
        let sealed = cipher().seal(&pool, b"chunk", b"key").unwrap();

        assert_eq!(sealed.len(), OVERHEAD + 5);
        assert_eq!(sealed[0], PAYLOAD_VERSION_V1);
        assert_eq!(sealed[1], 0);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let pool = BufferPool::new();
        let cipher = cipher();
        let sealed = cipher.seal(&pool, b"chunk bytes", b"key").unwrap().freeze();
        let opened = cipher.open(&pool, &sealed, b"key").unwrap().freeze();

        assert_eq!(&*opened, b"chunk bytes");
        drop((sealed, opened));
        assert!(pool.is_quiescent());
    }

    #[test]
    fn test_open_with_wrong_key_frees_output() {
        let pool = BufferPool::new();
        let cipher = cipher();
        let sealed = cipher.seal(&pool, b"chunk", b"key-0").unwrap().freeze();

        let result = cipher.open(&pool, &sealed, b"key-1");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
        assert_eq!(pool.stats().live_allocations(), 1, "only the sealed input remains");
    }

    #[test]
    fn test_rewritten_flags_fail_authentication() {
        let pool = BufferPool::new();
        let cipher = cipher();
        let mut sealed = cipher.seal(&pool, b"chunk", b"key").unwrap();
        sealed.as_mut_slice()[1] = 0x80;

        let result = cipher.open(&pool, &sealed, b"key");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
        drop(sealed);
        assert!(pool.is_quiescent());
    }

    #[test]
    fn test_open_rejects_short_and_unknown_payloads() {
        let pool = BufferPool::new();
        let cipher = cipher();
        assert!(matches!(
            cipher.open(&pool, &[1u8; 8], b""),
            Err(CryptoError::InvalidPayload { .. })
        ));

        let mut sealed = cipher.seal(&pool, b"abc", b"").unwrap();
        sealed.as_mut_slice()[0] = 9;
        assert!(matches!(cipher.open(&pool, &sealed, b""), Err(CryptoError::InvalidPayload { .. })));
    }
}
