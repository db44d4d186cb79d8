//! Facade crate for the stratum blob pipeline.
//! Re-exports the pipeline and the infrastructure crates it is built from.
//! Keep this crate thin: it should compose other crates, not implement data-path logic.
//!
//! ## Usage
//! - Add `stratum`; disable default features to drop the bundled logger.
//! - Build a [`Pipeline`](pipeline::Pipeline) over your
//!   [`ChunkTransport`](pipeline::ChunkTransport), or start from [`pipeline_from_config`].
//!
//! ```no_run
//! use stratum::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), PipelineError> {
//! let pool = BufferPool::new();
//! let transport = Arc::new(MemoryTransport::new(pool.clone())?);
//! let pipeline = stratum::pipeline_from_config(transport, Some("stratum.toml"))?.pool(pool).build()?;
//! let UploadStream { channel, handle } = pipeline.upload()?;
//! channel.write_with_callback(pipeline.pool().copy_from_slice(b"hello"), |_| {});
//! channel.finish();
//! let _blob_id = handle.wait()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

pub use stratum_buffer as buffer;
pub use stratum_channel as channel;
pub use stratum_crypto as crypto;
#[cfg(feature = "logger")]
pub use stratum_logger as logger;
pub use stratum_pipeline as pipeline;

/// The types most callers need.
pub mod prelude {
    pub use stratum_buffer::{Buffer, BufferMut, BufferPool};
    pub use stratum_channel::{ChunkSink, ChunkTransferChannel, Taken, TransferFailure};
    pub use stratum_crypto::{Aes, ChaCha, ChunkCipher};
    pub use stratum_pipeline::{
        BlobHandle, BlobId, ByteRange, ChunkTransport, Compression, DownloadSummary,
        MemoryTransport, Pipeline, PipelineBuilder, PipelineConfig, PipelineError, UploadStream,
    };
}

/// Build-time enabled features (by Cargo feature).
pub const ENABLED: &[&str] = &[
    #[cfg(feature = "logger")]
    "logger",
];

#[must_use]
pub fn is_enabled(name: &str) -> bool {
    ENABLED.contains(&name)
}

/// Starts a [`PipelineBuilder`](pipeline::PipelineBuilder) configured from `path` and the
/// `STRATUM__*` environment.
///
/// # Errors
/// Returns an error if the configuration cannot be loaded.
pub fn pipeline_from_config(
    transport: Arc<dyn pipeline::ChunkTransport>,
    path: Option<impl AsRef<Path>>,
) -> Result<pipeline::PipelineBuilder, pipeline::PipelineError> {
    let config = pipeline::load_config(path)?;
    Ok(pipeline::Pipeline::builder(transport).config(config))
}
