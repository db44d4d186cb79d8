use crate::cipher::{Aes, ChunkAead, ChunkCipher};
use crate::error::CryptoError;
use aead::Key;
use hkdf::Hkdf;
use private::Sealed;
use sha2::Sha256;
use std::marker::PhantomData;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_INFO_PREFIX: &[u8] = b"stratum_chunk_v1:";

#[derive(Debug, Default, ZeroizeOnDrop)]
pub struct NoKey;
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub struct WithKey {
    key: [u8; 32],
}

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoKey {}
impl Sealed for WithKey {}

/// A builder for [`ChunkCipher`].
///
/// Raw key material is zeroed when the builder is dropped or built.
#[allow(private_bounds)]
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub struct ChunkCipherBuilder<C: ChunkAead = Aes, K: Sealed + ZeroizeOnDrop = NoKey> {
    #[zeroize(skip)]
    _cipher: PhantomData<C>,
    keys: K,
}

impl<C: ChunkAead> Default for ChunkCipherBuilder<C> {
    fn default() -> Self {
        Self { _cipher: PhantomData, keys: NoKey }
    }
}

impl<C: ChunkAead> ChunkCipherBuilder<C> {
    #[must_use = "Builder must be given a key before use"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the chunk key with HKDF-SHA256.
    ///
    /// # Arguments
    /// * `ikm`: Input keying material.
    /// * `salt`: Uniquifies keys across deployments.
    /// * `scope`: Binds the key to a bucket, tenant or similar namespace.
    ///
    /// # Errors
    /// Returns [`CryptoError::InvalidConfiguration`] if expansion fails.
    pub fn derived_key(
        self,
        ikm: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
        scope: impl AsRef<[u8]>,
    ) -> Result<ChunkCipherBuilder<C, WithKey>, CryptoError> {
        let (_, hk) = Hkdf::<Sha256>::extract(Some(salt.as_ref()), ikm.as_ref());
        let mut key = [0u8; 32];

        let mut info = Vec::from(KEY_INFO_PREFIX);
        info.extend_from_slice(scope.as_ref());
        hk.expand(&info, &mut key).map_err(|_| CryptoError::InvalidConfiguration {
            message: "HKDF expansion failed for chunk key".into(),
            context: None,
        })?;
        info.zeroize();

        Ok(ChunkCipherBuilder { _cipher: PhantomData, keys: WithKey { key } })
    }

    /// Uses `key` as is.
    #[must_use]
    pub fn raw_key(self, key: [u8; 32]) -> ChunkCipherBuilder<C, WithKey> {
        ChunkCipherBuilder { _cipher: PhantomData, keys: WithKey { key } }
    }
}

impl<C: ChunkAead> ChunkCipherBuilder<C, WithKey> {
    /// Finalizes the cipher and zeroes the builder.
    ///
    /// # Errors
    /// Returns [`CryptoError::InvalidConfiguration`] if the key length does not fit `C`.
    pub fn build(mut self) -> Result<ChunkCipher<C>, CryptoError> {
        let key = Key::<C>::try_from(&self.keys.key[..]).map_err(|_| {
            CryptoError::InvalidConfiguration {
                message: format!("Invalid key length {}, must be 32 bytes", self.keys.key.len())
                    .into(),
                context: Some(std::any::type_name::<C>().into()),
            }
        })?;
        let cipher = C::new(&key);

        self.zeroize();

        Ok(ChunkCipher { cipher: Arc::new(cipher) })
    }
}
