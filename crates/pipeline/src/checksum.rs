use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of the bytes a chunk is stored as.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checksum([u8; 32]);

impl Checksum {
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_slice());
        Self(out)
    }

    /// # Errors
    /// Returns [`PipelineError::DataIntegrity`] if `bytes` hash to a different value.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), PipelineError> {
        let actual = Self::of(bytes);
        if actual == *self {
            Ok(())
        } else {
            Err(PipelineError::DataIntegrity {
                message: format!("expected {self}, got {actual}").into(),
                context: None,
            })
        }
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            Checksum::of(b"abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_detects_flip() {
        let checksum = Checksum::of(b"payload");
        assert!(checksum.verify(b"payload").is_ok());
        assert_eq!(checksum.verify(b"paylOad").unwrap_err().kind(), "DataIntegrity");
    }
}
