//! # Stratum pipeline
//!
//! Splits byte streams into fixed-size chunks, compresses and encrypts them and hands them to a
//! [`ChunkTransport`]; on download it reverses the process and delivers the requested byte range
//! to a [`ChunkSink`] in order.
//!
//! Every buffer crossing a thread boundary has exactly one owner. Stages consume their input by
//! value and return a fresh output; whichever path ends an operation (success, failure, timeout,
//! cancellation) releases what the operation still holds exactly once.
//!
//! ## Blob layout
//!
//! * A blob that fits in one chunk is **simple**: its chunk is stored at [`ChunkSlot::Root`].
//! * A larger blob is **composite**: data chunks at [`ChunkSlot::Data`] and a [`BlobManifest`]
//!   at [`ChunkSlot::Root`].
//!
//! ## Configuration
//!
//! [`load_config`] reads a [`PipelineConfig`] from an optional file overlaid by `STRATUM__*`
//! environment variables.

mod checksum;
mod chunk;
mod config;
mod download;
mod error;
mod manifest;
mod orchestrator;
mod transform;
mod transport;
mod upload;

pub use checksum::Checksum;
pub use chunk::{BlobId, ByteRange, ChunkDescriptor, ChunkKey, ChunkKind, ChunkSlot};
pub use config::{PipelineConfig, load_config};
pub use error::{PipelineError, PipelineErrorExt};
pub use manifest::{BlobManifest, ChunkRecord, ChunkSpan};
pub use orchestrator::{BlobHandle, DownloadSummary, Pipeline, PipelineBuilder, UploadStream};
pub use stratum_channel::ChunkSink;
pub use transform::{ChunkTransform, Compression, Lz4Compress, Lz4Decompress};
pub use transport::{
    ChunkTransport, FetchCallback, FetchedChunk, Fault, MemoryTransport, SendCallback, reseal,
};
