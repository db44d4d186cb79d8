use crate::cipher::{Aes, ChunkAead, ChunkCipher};
use crate::error::CryptoError;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use stratum_buffer::{Buffer, BufferMut, BufferPool};
use tracing::trace;

/// A transform that reads one borrowed buffer and produces one new buffer.
///
/// Implementations allocate their output from `pool`. If they fail after allocating, dropping the
/// unfrozen [`BufferMut`] frees it.
pub trait CryptoTransform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Transforms `input` under `associated_data`.
    ///
    /// # Errors
    /// Returns the transform's failure; no output survives an error.
    fn apply(
        &self,
        pool: &BufferPool,
        input: &Buffer,
        associated_data: &[u8],
    ) -> Result<BufferMut, CryptoError>;
}

/// Seals chunks with a [`ChunkCipher`].
pub struct Encrypt<C: ChunkAead = Aes>(pub ChunkCipher<C>);

/// Opens chunks sealed by [`Encrypt`].
pub struct Decrypt<C: ChunkAead = Aes>(pub ChunkCipher<C>);

impl<C: ChunkAead> CryptoTransform for Encrypt<C> {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    fn apply(
        &self,
        pool: &BufferPool,
        input: &Buffer,
        associated_data: &[u8],
    ) -> Result<BufferMut, CryptoError> {
        self.0.seal(pool, input, associated_data)
    }
}

impl<C: ChunkAead> CryptoTransform for Decrypt<C> {
    fn name(&self) -> &'static str {
        "decrypt"
    }

    fn apply(
        &self,
        pool: &BufferPool,
        input: &Buffer,
        associated_data: &[u8],
    ) -> Result<BufferMut, CryptoError> {
        self.0.open(pool, input, associated_data)
    }
}

impl<C: ChunkAead> fmt::Debug for Encrypt<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Encrypt").field(&self.0).finish()
    }
}

impl<C: ChunkAead> fmt::Debug for Decrypt<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Decrypt").field(&self.0).finish()
    }
}

impl<C: ChunkAead> ChunkCipher<C> {
    /// Shares this cipher as an encrypting job transform.
    #[must_use]
    pub fn encryptor(&self) -> Arc<dyn CryptoTransform> {
        Arc::new(Encrypt(self.clone()))
    }

    /// Shares this cipher as a decrypting job transform.
    #[must_use]
    pub fn decryptor(&self) -> Arc<dyn CryptoTransform> {
        Arc::new(Decrypt(self.clone()))
    }
}

pub type JobCallback = Box<dyn FnOnce(Result<JobResult, CryptoError>) + Send>;

/// One unit of crypto work. Owns its input until it runs or is closed.
pub struct CryptoJob {
    input: Buffer,
    transform: Arc<dyn CryptoTransform>,
    associated_data: Vec<u8>,
    callback: JobCallback,
}

impl fmt::Debug for CryptoJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoJob")
            .field("input", &self.input)
            .field("transform", &self.transform.name())
            .field("associated_data", &self.associated_data.len())
            .finish_non_exhaustive()
    }
}

impl CryptoJob {
    pub fn new(
        input: Buffer,
        transform: Arc<dyn CryptoTransform>,
        associated_data: impl Into<Vec<u8>>,
        callback: impl FnOnce(Result<JobResult, CryptoError>) + Send + 'static,
    ) -> Self {
        Self { input, transform, associated_data: associated_data.into(), callback: Box::new(callback) }
    }

    #[must_use]
    pub fn transform_name(&self) -> &'static str {
        self.transform.name()
    }

    /// Runs the transform and reports through the callback.
    ///
    /// The input is released before the callback runs, on success and on failure.
    pub(crate) fn run(self, pool: &BufferPool) -> bool {
        let Self { input, transform, associated_data, callback } = self;
        let name = transform.name();

        let result = transform
            .apply(pool, &input, &associated_data)
            .map(|output| JobResult { output: output.freeze() });
        trace!(transform = name, input = %input.id(), ok = result.is_ok(), "Crypto job ran");
        input.release();

        let ok = result.is_ok();
        callback(result);
        ok
    }

    /// Releases the input and fails the callback with [`CryptoError::Aborted`].
    pub(crate) fn close(self, reason: impl Into<Cow<'static, str>>) {
        let Self { input, transform, callback, .. } = self;
        let reason = reason.into();
        trace!(transform = transform.name(), input = %input.id(), %reason, "Crypto job closed");
        input.release();
        callback(Err(CryptoError::Aborted { message: reason, context: None }));
    }
}

/// Output of a successful job. Must be consumed exactly once.
#[derive(Debug)]
#[must_use = "a job result must be extracted or discarded"]
pub struct JobResult {
    output: Buffer,
}

impl JobResult {
    /// Takes ownership of the output buffer.
    pub fn extract(self) -> Buffer {
        self.output
    }

    /// Releases the output buffer. Returns `true` if that freed it.
    pub fn discard(self) -> bool {
        self.output.release()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.output.readable_bytes()
    }
}
