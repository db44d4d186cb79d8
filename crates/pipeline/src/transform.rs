use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stratum_buffer::{Buffer, BufferPool};

/// A synchronous stage that consumes one buffer and produces a new one.
///
/// `apply` takes `input` by value: on success the input has been released and the output is a
/// fresh allocation; on failure both the input and anything the transform allocated have been
/// released before the error is returned.
pub trait ChunkTransform: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns [`PipelineError::Transform`] when the stage cannot produce output.
    fn apply(&self, pool: &BufferPool, input: Buffer) -> Result<Buffer, PipelineError>;
}

/// Chunk compression algorithm, recorded per stored chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    /// The compressing stage, or `None` when chunks are stored as is.
    #[must_use]
    pub fn compressor(self) -> Option<Arc<dyn ChunkTransform>> {
        match self {
            Self::None => None,
            Self::Lz4 => Some(Arc::new(Lz4Compress)),
        }
    }

    /// The reversing stage for chunks of at most `max_size` plaintext bytes.
    #[must_use]
    pub fn decompressor(self, max_size: usize) -> Option<Arc<dyn ChunkTransform>> {
        match self {
            Self::None => None,
            Self::Lz4 => Some(Arc::new(Lz4Decompress::bounded(max_size))),
        }
    }
}

/// LZ4 block compression with a prepended size header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compress;

/// Reverses [`Lz4Compress`].
///
/// The size header is checked against `max_size` before the output is allocated.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Decompress {
    max_size: usize,
}

impl Lz4Decompress {
    #[must_use]
    pub const fn bounded(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for Lz4Decompress {
    fn default() -> Self {
        Self::bounded(usize::MAX)
    }
}

impl ChunkTransform for Lz4Compress {
    fn name(&self) -> &'static str {
        "lz4-compress"
    }

    fn apply(&self, pool: &BufferPool, input: Buffer) -> Result<Buffer, PipelineError> {
        let compressed = lz4_flex::compress_prepend_size(&input);
        input.release();
        Ok(pool.from_vec(compressed))
    }
}

impl ChunkTransform for Lz4Decompress {
    fn name(&self) -> &'static str {
        "lz4-decompress"
    }

    fn apply(&self, pool: &BufferPool, input: Buffer) -> Result<Buffer, PipelineError> {
        if let Some(header) = input.first_chunk::<4>() {
            let declared = usize::try_from(u32::from_le_bytes(*header)).unwrap_or(usize::MAX);
            if declared > self.max_size {
                input.release();
                return Err(PipelineError::transform(format!(
                    "LZ4 header declares {declared} bytes, at most {} expected",
                    self.max_size
                )));
            }
        }

        let decompressed = lz4_flex::decompress_size_prepended(&input);
        input.release();
        decompressed
            .map(|bytes| pool.from_vec(bytes))
            .map_err(|err| PipelineError::transform(format!("LZ4 stream invalid: {err}")))
    }
}
