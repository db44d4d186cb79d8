use crate::checksum::Checksum;
use crate::error::PipelineError;
use crate::transform::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const BLOB_ID_LEN: usize = 21;

/// Identifier of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(Arc<str>);

impl BlobId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(BLOB_ID_LEN).into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlobId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a chunk lives within its blob.
///
/// A simple blob keeps its only chunk at [`ChunkSlot::Root`]. A composite blob keeps data chunks
/// at [`ChunkSlot::Data`] and its manifest at [`ChunkSlot::Root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkSlot {
    Root,
    Data(u32),
}

/// Transport address of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub blob_id: BlobId,
    pub slot: ChunkSlot,
}

impl ChunkKey {
    #[must_use]
    pub const fn new(blob_id: BlobId, slot: ChunkSlot) -> Self {
        Self { blob_id, slot }
    }

    #[must_use]
    pub fn root(blob_id: &BlobId) -> Self {
        Self::new(blob_id.clone(), ChunkSlot::Root)
    }

    #[must_use]
    pub fn data(blob_id: &BlobId, index: u32) -> Self {
        Self::new(blob_id.clone(), ChunkSlot::Data(index))
    }

    /// Bytes bound into each chunk's AEAD tag, so a payload cannot be replayed under another key.
    #[must_use]
    pub fn associated_data(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            ChunkSlot::Root => write!(f, "{}/root", self.blob_id),
            ChunkSlot::Data(index) => write!(f, "{}/{index}", self.blob_id),
        }
    }
}

/// What a stored chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// The whole blob in one chunk.
    Simple,
    /// One data chunk of a composite blob.
    Data,
    /// The manifest of a composite blob.
    Manifest,
}

/// Metadata sent alongside a chunk payload and returned with it on fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub kind: ChunkKind,
    /// Plaintext bytes before compression.
    pub size: u64,
    /// Stored payload bytes.
    pub stored_size: u64,
    /// Checksum of the stored payload.
    pub checksum: Checksum,
    pub compression: Compression,
    pub encrypted: bool,
}

/// Half-open byte range of a blob to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: u64,
    /// `None` reads to the end of the blob.
    pub length: Option<u64>,
}

impl ByteRange {
    #[must_use]
    pub const fn full() -> Self {
        Self { offset: 0, length: None }
    }

    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length: Some(length) }
    }

    #[must_use]
    pub const fn from_offset(offset: u64) -> Self {
        Self { offset, length: None }
    }

    /// Resolves against a blob of `total` bytes into `[start, end)`.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidRange`] if the range starts or ends past the blob.
    pub fn resolve(&self, total: u64) -> Result<(u64, u64), PipelineError> {
        let end = match self.length {
            None => Some(total),
            Some(length) => self.offset.checked_add(length),
        };
        match end {
            Some(end) if self.offset <= total && end <= total => Ok((self.offset, end)),
            _ => Err(PipelineError::InvalidRange {
                message: format!("{self} of a {total}-byte blob").into(),
                context: None,
            }),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(length) => write!(f, "bytes {}+{length}", self.offset),
            None => write!(f, "bytes {}-", self.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        let a = BlobId::generate();
        assert_eq!(a.as_str().len(), BLOB_ID_LEN);
        assert_ne!(a, BlobId::generate());
    }

    #[test]
    fn test_key_display_and_associated_data() {
        let blob = BlobId::from("blob");
        assert_eq!(ChunkKey::root(&blob).to_string(), "blob/root");
        assert_eq!(ChunkKey::data(&blob, 7).associated_data(), b"blob/7".to_vec());
    }

    #[test]
    fn test_range_resolution() {
        assert_eq!(ByteRange::full().resolve(10).unwrap(), (0, 10));
        assert_eq!(ByteRange::new(2, 3).resolve(10).unwrap(), (2, 5));
        assert_eq!(ByteRange::from_offset(10).resolve(10).unwrap(), (10, 10));
        assert_eq!(ByteRange::new(8, 3).resolve(10).unwrap_err().kind(), "InvalidRange");
        assert!(ByteRange::new(u64::MAX, 2).resolve(10).is_err());
        assert!(ByteRange::from_offset(11).resolve(10).is_err());
    }
}
