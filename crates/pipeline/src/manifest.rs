use crate::checksum::Checksum;
use crate::chunk::BlobId;
use crate::error::{PipelineError, PipelineErrorExt};
use serde::{Deserialize, Serialize};

/// One data chunk as recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: u32,
    /// Plaintext bytes.
    pub size: u64,
    /// Stored payload bytes.
    pub stored_size: u64,
    pub checksum: Checksum,
}

/// Metadata chunk of a composite blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobManifest {
    pub blob_id: BlobId,
    pub chunk_size: u64,
    pub total_size: u64,
    pub chunks: Vec<ChunkRecord>,
}

/// Part of one chunk a range download needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    /// Plaintext bytes of the whole chunk.
    pub size: u64,
    /// Offset of the wanted bytes within the chunk.
    pub start: u64,
    pub len: u64,
}

impl BlobManifest {
    /// Builds a manifest from records sorted by index.
    #[must_use]
    pub fn new(blob_id: BlobId, chunk_size: u64, mut chunks: Vec<ChunkRecord>) -> Self {
        chunks.sort_by_key(|record| record.index);
        let total_size = chunks.iter().map(|record| record.size).sum();
        Self { blob_id, chunk_size, total_size, chunks }
    }

    /// # Errors
    /// Returns [`PipelineError::Manifest`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        postcard::to_stdvec(self).context("Postcard encoding failed")
    }

    /// # Errors
    /// * [`PipelineError::Manifest`] if the bytes are not a manifest.
    /// * [`PipelineError::DataIntegrity`] if the chunk list is inconsistent.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        let manifest: Self = postcard::from_bytes(bytes).context("Postcard decoding failed")?;
        manifest.check()?;
        Ok(manifest)
    }

    fn check(&self) -> Result<(), PipelineError> {
        let contiguous =
            self.chunks.iter().enumerate().all(|(i, record)| u32::try_from(i) == Ok(record.index));
        let sized = self
            .chunks
            .iter()
            .try_fold(0u64, |total, record| total.checked_add(record.size))
            .is_some_and(|total| total == self.total_size);
        if contiguous && sized {
            Ok(())
        } else {
            Err(PipelineError::integrity(format!("inconsistent manifest for blob {}", self.blob_id)))
        }
    }

    /// Chunks intersecting `[start, end)` and the part of each that falls inside it.
    #[must_use]
    pub fn spans(&self, start: u64, end: u64) -> Vec<ChunkSpan> {
        let mut offset = 0u64;
        let mut spans = Vec::new();
        for record in &self.chunks {
            let chunk_end = offset + record.size;
            let lo = start.max(offset);
            let hi = end.min(chunk_end);
            if lo < hi {
                spans.push(ChunkSpan {
                    index: record.index,
                    size: record.size,
                    start: lo - offset,
                    len: hi - lo,
                });
            }
            offset = chunk_end;
        }
        spans
    }
}
