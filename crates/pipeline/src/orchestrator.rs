//! # Operation orchestrator
//!
//! A [`Pipeline`] wires a transport, a crypto executor and the chunk transforms together and
//! starts upload and download operations. Each operation owns its chunks, runs one driver thread
//! and resolves its [`BlobHandle`] exactly once: the first completion or the first fatal error
//! wins a compare-and-swap on the operation's done flag.

use crate::chunk::{BlobId, ByteRange};
use crate::config::PipelineConfig;
use crate::download::DownloadOperation;
use crate::error::PipelineError;
use crate::transform::{ChunkTransform, Compression};
use crate::transport::ChunkTransport;
use crate::upload::UploadOperation;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Instant;
use stratum_buffer::BufferPool;
use stratum_channel::{ChunkSink, ChunkTransferChannel};
use stratum_crypto::{ChunkAead, ChunkCipher, CryptoJobExecutor, CryptoTransform};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Completion state shared by every thread working on one operation.
pub(crate) struct OperationCore<T> {
    done: AtomicBool,
    outcome: Mutex<Option<oneshot::Sender<Result<T, PipelineError>>>>,
    settled: Mutex<bool>,
    settled_cv: Condvar,
    deadline: Option<Instant>,
}

impl<T> fmt::Debug for OperationCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCore")
            .field("done", &self.is_done())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<T> OperationCore<T> {
    pub(crate) fn new(config: &PipelineConfig) -> (Self, oneshot::Receiver<Result<T, PipelineError>>) {
        let (tx, rx) = oneshot::channel();
        let deadline = config.operation_timeout().and_then(|timeout| Instant::now().checked_add(timeout));
        let core = Self {
            done: AtomicBool::new(false),
            outcome: Mutex::new(Some(tx)),
            settled: Mutex::new(false),
            settled_cv: Condvar::new(),
            deadline,
        };
        (core, rx)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Claims the right to resolve the operation. Only the first caller gets `true`.
    pub(crate) fn begin_finish(&self) -> bool {
        self.done.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Resolves the caller's handle. Must follow a winning [`begin_finish`](Self::begin_finish).
    pub(crate) fn settle(&self, result: Result<T, PipelineError>) {
        if let Some(tx) = self.outcome.lock().take() {
            // The caller may have dropped its handle.
            tx.send(result).ok();
        }
        *self.settled.lock() = true;
        self.settled_cv.notify_all();
    }

    pub(crate) const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Blocks until the operation settles or its deadline passes. Returns `true` if it settled.
    pub(crate) fn wait_settled(&self) -> bool {
        let mut settled = self.settled.lock();
        while !*settled {
            match self.deadline {
                Some(deadline) => {
                    if self.settled_cv.wait_until(&mut settled, deadline).timed_out() {
                        return *settled;
                    }
                },
                None => self.settled_cv.wait(&mut settled),
            }
        }
        true
    }
}

/// Aborts an operation from outside.
pub(crate) trait Cancel: Send + Sync {
    fn cancel(&self);
}

/// Caller's view of one operation: a future resolving to its single outcome.
///
/// Await it from async code or call [`wait`](Self::wait) from a plain thread. Dropping the
/// handle does not stop the operation; call [`cancel`](Self::cancel) for that.
#[must_use = "an operation's outcome is only observable through its handle"]
pub struct BlobHandle<T> {
    blob_id: BlobId,
    receiver: oneshot::Receiver<Result<T, PipelineError>>,
    canceller: Arc<dyn Cancel>,
}

impl<T> fmt::Debug for BlobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle").field("blob_id", &self.blob_id).finish_non_exhaustive()
    }
}

impl<T> BlobHandle<T> {
    pub(crate) fn new(
        blob_id: BlobId,
        receiver: oneshot::Receiver<Result<T, PipelineError>>,
        canceller: Arc<dyn Cancel>,
    ) -> Self {
        Self { blob_id, receiver, canceller }
    }

    #[must_use]
    pub const fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    /// Aborts the operation. It resolves with [`PipelineError::Cancelled`] unless it already
    /// finished.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Blocks the current thread until the operation resolves.
    ///
    /// # Errors
    /// Returns the operation's failure.
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context; await the handle there.
    pub fn wait(self) -> Result<T, PipelineError> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(abandoned()))
    }
}

impl<T> Future for BlobHandle<T> {
    type Output = Result<T, PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| result.unwrap_or_else(|_| Err(abandoned())))
    }
}

fn abandoned() -> PipelineError {
    PipelineError::Internal { message: "operation ended without an outcome".into(), context: None }
}

/// Outcome of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub blob_id: BlobId,
    /// Plaintext size of the whole blob.
    pub total_size: u64,
    pub bytes_delivered: u64,
    pub chunks_delivered: u32,
}

/// An upload in progress: write the blob into `channel`, call
/// [`finish`](ChunkTransferChannel::finish), then await `handle`.
#[derive(Debug)]
pub struct UploadStream {
    pub channel: ChunkTransferChannel,
    pub handle: BlobHandle<BlobId>,
}

/// Components every operation of a [`Pipeline`] shares.
pub(crate) struct Stages {
    pub(crate) config: PipelineConfig,
    pub(crate) pool: BufferPool,
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) executor: Arc<CryptoJobExecutor>,
    pub(crate) encryptor: Option<Arc<dyn CryptoTransform>>,
    pub(crate) decryptor: Option<Arc<dyn CryptoTransform>>,
    pub(crate) compressor: Option<Arc<dyn ChunkTransform>>,
    decompressor: Option<Arc<dyn ChunkTransform>>,
}

impl fmt::Debug for Stages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stages")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("executor", &self.executor)
            .field("encryptor", &self.encryptor.as_ref().map(|t| t.name()))
            .field("decryptor", &self.decryptor.as_ref().map(|t| t.name()))
            .field("compressor", &self.compressor.as_ref().map(|t| t.name()))
            .field("decompressor", &self.decompressor.as_ref().map(|t| t.name()))
            .finish_non_exhaustive()
    }
}

impl Stages {
    /// Stage that reverses `compression` for a chunk of `size` plaintext bytes, if any.
    pub(crate) fn decompressor_for(
        &self,
        compression: Compression,
        size: u64,
    ) -> Option<Arc<dyn ChunkTransform>> {
        match compression {
            Compression::None => None,
            other => self.decompressor.clone().or_else(|| {
                other.decompressor(usize::try_from(size).unwrap_or(usize::MAX))
            }),
        }
    }
}

/// Entry point for chunked uploads and downloads.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use stratum_buffer::BufferPool;
/// use stratum_crypto::{Aes, ChunkCipher};
/// use stratum_pipeline::{MemoryTransport, Pipeline};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = BufferPool::new();
/// let transport = Arc::new(MemoryTransport::new(pool.clone())?);
/// let cipher = ChunkCipher::<Aes>::builder().derived_key("ikm", "salt", "bucket")?.build()?;
/// let pipeline = Pipeline::builder(transport).pool(pool.clone()).cipher(&cipher).build()?;
///
/// let upload = pipeline.upload()?;
/// upload.channel.write(pool.copy_from_slice(b"hello"));
/// upload.channel.finish();
/// let blob_id = upload.handle.wait()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Arc<Stages>,
}

impl Pipeline {
    #[must_use]
    pub fn builder(transport: Arc<dyn ChunkTransport>) -> PipelineBuilder {
        PipelineBuilder {
            transport,
            config: PipelineConfig::default(),
            pool: None,
            executor: None,
            encryptor: None,
            decryptor: None,
            compressor: None,
            decompressor: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.stages.config
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.stages.pool
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<CryptoJobExecutor> {
        &self.stages.executor
    }

    /// Starts an upload of a new blob.
    ///
    /// # Errors
    /// * [`PipelineError::InvalidConfiguration`] if the input channel cannot be created.
    /// * [`PipelineError::Internal`] if the filler thread cannot be spawned.
    pub fn upload(&self) -> Result<UploadStream, PipelineError> {
        let blob_id = BlobId::generate();
        let channel = ChunkTransferChannel::with_capacity(self.stages.config.channel_capacity)
            .map_err(|err| PipelineError::InvalidConfiguration {
                message: err.to_string().into(),
                context: Some("channel_capacity".into()),
            })?;
        let (operation, receiver) =
            UploadOperation::new(blob_id.clone(), Arc::clone(&self.stages), channel.clone());
        let operation = Arc::new(operation);

        let filler = Arc::clone(&operation);
        spawn(format!("stratum-upload-{}", short(&blob_id)), move || filler.run_filler())?;

        info!(blob = %blob_id, "Upload started");
        let handle = BlobHandle::new(blob_id, receiver, operation);
        Ok(UploadStream { channel, handle })
    }

    /// Starts a download of `range` of `blob_id`, delivering chunks to `sink` in order.
    ///
    /// # Errors
    /// Returns [`PipelineError::Internal`] if the driver thread cannot be spawned.
    pub fn download(
        &self,
        blob_id: &BlobId,
        range: ByteRange,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<BlobHandle<DownloadSummary>, PipelineError> {
        let (operation, receiver) =
            DownloadOperation::new(blob_id.clone(), range, Arc::clone(&self.stages), sink);
        let operation = Arc::new(operation);

        let driver = Arc::clone(&operation);
        spawn(format!("stratum-download-{}", short(blob_id)), move || driver.run_driver())?;

        info!(blob = %blob_id, %range, "Download started");
        Ok(BlobHandle::new(blob_id.clone(), receiver, operation))
    }

    /// Shuts the crypto executor down. Operations still running fail with
    /// [`PipelineError::Cancelled`] once they need it.
    pub fn shutdown(&self) {
        self.stages.executor.shutdown();
    }
}

fn short(blob_id: &BlobId) -> &str {
    blob_id.as_str().get(..8).unwrap_or(blob_id.as_str())
}

fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> Result<(), PipelineError> {
    thread::Builder::new().name(name).spawn(body).map(drop).map_err(|err| PipelineError::Internal {
        message: format!("failed to spawn operation thread: {err}").into(),
        context: None,
    })
}

/// Builds a [`Pipeline`].
pub struct PipelineBuilder {
    transport: Arc<dyn ChunkTransport>,
    config: PipelineConfig,
    pool: Option<BufferPool>,
    executor: Option<Arc<CryptoJobExecutor>>,
    encryptor: Option<Arc<dyn CryptoTransform>>,
    decryptor: Option<Arc<dyn CryptoTransform>>,
    compressor: Option<Arc<dyn ChunkTransform>>,
    decompressor: Option<Arc<dyn ChunkTransform>>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("encrypted", &self.encryptor.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Pool every stage allocates from. Defaults to the executor's pool, or a new one.
    #[must_use]
    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Shares an existing executor instead of starting one per pipeline.
    #[must_use]
    pub fn executor(mut self, executor: Arc<CryptoJobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Encrypts uploads and decrypts downloads with `cipher`.
    #[must_use]
    pub fn cipher<C: ChunkAead>(self, cipher: &ChunkCipher<C>) -> Self {
        self.encryptor(cipher.encryptor()).decryptor(cipher.decryptor())
    }

    #[must_use]
    pub fn encryptor(mut self, encryptor: Arc<dyn CryptoTransform>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    #[must_use]
    pub fn decryptor(mut self, decryptor: Arc<dyn CryptoTransform>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Replaces the stage implementing the configured [`Compression`].
    #[must_use]
    pub fn compressor(mut self, compressor: Arc<dyn ChunkTransform>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    #[must_use]
    pub fn decompressor(mut self, decompressor: Arc<dyn ChunkTransform>) -> Self {
        self.decompressor = Some(decompressor);
        self
    }

    /// # Errors
    /// * [`PipelineError::InvalidConfiguration`] if the config is out of range, or a compression
    ///   stage is given while compression is disabled.
    /// * [`PipelineError::Transform`] if the crypto executor cannot start.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let Self { transport, config, pool, executor, encryptor, decryptor, compressor, decompressor } =
            self;
        config.validate()?;

        if config.compression == Compression::None && compressor.is_some() {
            return Err(PipelineError::InvalidConfiguration {
                message: "a compressor was given but compression is none".into(),
                context: None,
            });
        }
        let compressor = compressor.or_else(|| config.compression.compressor());

        let (pool, executor) = match (pool, executor) {
            (pool, Some(executor)) => {
                (pool.unwrap_or_else(|| executor.pool().clone()), executor)
            },
            (pool, None) => {
                let pool = pool.unwrap_or_default();
                let executor = CryptoJobExecutor::new(config.crypto_workers, pool.clone())?;
                (pool, Arc::new(executor))
            },
        };

        debug!(
            chunk_size = config.chunk_size,
            compression = ?config.compression,
            encrypted = encryptor.is_some(),
            "Pipeline built"
        );
        let stages = Stages {
            config,
            pool,
            transport,
            executor,
            encryptor,
            decryptor,
            compressor,
            decompressor,
        };
        Ok(Pipeline { stages: Arc::new(stages) })
    }
}
