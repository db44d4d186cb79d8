#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use stratum_buffer::{Buffer, BufferMut, BufferPool};
use stratum_channel::ChannelError;
use stratum_crypto::{ChaCha, ChunkCipher, CryptoError, CryptoTransform};
use stratum_logger::Logger;
use stratum_pipeline::*;

pub const CHUNK: usize = 64;
pub const SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Harness {
    pub pool: BufferPool,
    pub transport: Arc<MemoryTransport>,
    pub pipeline: Pipeline,
}

#[must_use]
pub fn config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: CHUNK,
        take_timeout_ms: 10,
        operation_timeout_ms: 10_000,
        crypto_workers: 2,
        ..PipelineConfig::default()
    }
}

#[must_use]
pub fn setup_cipher() -> ChunkCipher<ChaCha> {
    ChunkCipher::builder()
        .derived_key("master-secret-123", "unique-salt", "bucket-01")
        .unwrap()
        .build()
        .expect("Cipher setup failed")
}

/// Pipeline over a fresh in-memory transport sharing one pool.
pub fn harness(
    config: PipelineConfig,
    configure: impl FnOnce(PipelineBuilder) -> PipelineBuilder,
) -> Harness {
    Logger::for_tests();
    let pool = BufferPool::new();
    let transport = Arc::new(MemoryTransport::new(pool.clone()).unwrap());
    let builder = Pipeline::builder(transport.clone()).config(config).pool(pool.clone());
    let pipeline = configure(builder).build().unwrap();
    Harness { pool, transport, pipeline }
}

/// Compressed and encrypted with the default stages.
pub fn sealed_harness() -> Harness {
    let cipher = setup_cipher();
    harness(config(), |builder| builder.cipher(&cipher))
}

/// Deterministic bytes with enough repetition for LZ4 to bite.
#[must_use]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from((i / 3) % 251).unwrap()).collect()
}

/// Writes `bytes` in `piece`-sized buffers, finishes the stream and returns the handle.
pub fn start_upload(harness: &Harness, bytes: &[u8], piece: usize) -> BlobHandle<BlobId> {
    let UploadStream { channel, handle } = harness.pipeline.upload().unwrap();
    for part in bytes.chunks(piece.max(1)) {
        drop(channel.write(harness.pool.copy_from_slice(part)));
    }
    channel.finish();
    handle
}

pub fn upload(harness: &Harness, bytes: &[u8], piece: usize) -> Result<BlobId, PipelineError> {
    start_upload(harness, bytes, piece).wait()
}

pub fn download(
    harness: &Harness,
    blob_id: &BlobId,
    range: ByteRange,
) -> (Result<DownloadSummary, PipelineError>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let result = harness.pipeline.download(blob_id, range, sink.clone()).unwrap().wait();
    (result, sink)
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Polls until every buffer of `pool` is released.
pub fn wait_quiescent(pool: &BufferPool, timeout: Duration) -> bool {
    wait_until(timeout, || pool.is_quiescent())
}

pub fn assert_quiescent(pool: &BufferPool) {
    assert!(wait_quiescent(pool, SETTLE), "buffers leaked: {:?}", pool.stats());
}

/// Copies every delivered chunk and releases it.
#[derive(Debug, Default)]
pub struct CollectingSink {
    chunks: Mutex<Vec<(u32, Vec<u8>)>>,
    ended: AtomicBool,
}

impl CollectingSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.lock().iter().flat_map(|(_, bytes)| bytes.clone()).collect()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.chunks.lock().iter().map(|(index, _)| *index).collect()
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl ChunkSink for CollectingSink {
    fn deliver(&self, index: u32, buffer: Buffer, _: Option<Instant>) -> Result<(), ChannelError> {
        self.chunks.lock().push((index, buffer.to_vec()));
        buffer.release();
        Ok(())
    }

    fn end_of_stream(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// Accepts `accept` chunks, then refuses.
#[derive(Debug)]
pub struct FailingSink {
    pub accept: usize,
    pub delivered: AtomicUsize,
}

impl ChunkSink for FailingSink {
    fn deliver(&self, _index: u32, buffer: Buffer, _: Option<Instant>) -> Result<(), ChannelError> {
        buffer.release();
        if self.delivered.fetch_add(1, Ordering::SeqCst) < self.accept {
            Ok(())
        } else {
            Err(ChannelError::Rejected { message: "sink is full".into(), context: None })
        }
    }
}

/// Releases what it is given, but holds the driver in the first `deliver` until opened.
#[derive(Debug, Default)]
pub struct GatedSink {
    entered: AtomicBool,
    open: Mutex<bool>,
    opened: Condvar,
    pub delivered: AtomicUsize,
}

impl GatedSink {
    /// Polls until the first delivery is blocked in the sink.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.entered.load(Ordering::SeqCst))
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl ChunkSink for GatedSink {
    fn deliver(&self, _index: u32, buffer: Buffer, _: Option<Instant>) -> Result<(), ChannelError> {
        buffer.release();
        if !self.entered.swap(true, Ordering::SeqCst) {
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Delegates to `inner` and counts calls.
pub struct Counting<T: ?Sized> {
    pub inner: Arc<T>,
    pub calls: Arc<AtomicUsize>,
}

impl<T: ?Sized> std::fmt::Debug for Counting<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counting").field("calls", &self.calls).finish_non_exhaustive()
    }
}

impl<T: ?Sized> Counting<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChunkTransform for Counting<dyn ChunkTransform> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn apply(&self, pool: &BufferPool, input: Buffer) -> Result<Buffer, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(pool, input)
    }
}

impl CryptoTransform for Counting<dyn CryptoTransform> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn apply(&self, pool: &BufferPool, input: &Buffer, aad: &[u8]) -> Result<BufferMut, CryptoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(pool, input, aad)
    }
}

/// Compression stage that fails on its `fail_on`-th call (zero based).
#[derive(Debug, Default)]
pub struct FailingCompress {
    pub fail_on: usize,
    pub calls: AtomicUsize,
}

impl ChunkTransform for FailingCompress {
    fn name(&self) -> &'static str {
        "failing-compress"
    }

    fn apply(&self, pool: &BufferPool, input: Buffer) -> Result<Buffer, PipelineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            input.release();
            return Err(PipelineError::Transform { message: "compressor broke".into(), context: None });
        }
        Lz4Compress.apply(pool, input)
    }
}

/// Allocates and fills its output, then fails. Both buffers are released before returning.
#[derive(Debug, Default)]
pub struct DecompressFailsAfterAlloc {
    pub allocated: AtomicUsize,
}

impl ChunkTransform for DecompressFailsAfterAlloc {
    fn name(&self) -> &'static str {
        "decompress-fails-after-alloc"
    }

    fn apply(&self, pool: &BufferPool, input: Buffer) -> Result<Buffer, PipelineError> {
        let mut output = pool.allocate(input.readable_bytes() * 2);
        output.extend_from_slice(&input);
        self.allocated.fetch_add(1, Ordering::SeqCst);
        drop(output);
        input.release();
        Err(PipelineError::Transform { message: "truncated stream".into(), context: None })
    }
}

/// Encryption stage that always fails.
#[derive(Debug)]
pub struct FailingEncrypt;

impl CryptoTransform for FailingEncrypt {
    fn name(&self) -> &'static str {
        "failing-encrypt"
    }

    fn apply(&self, _: &BufferPool, _: &Buffer, _: &[u8]) -> Result<BufferMut, CryptoError> {
        Err(CryptoError::Encryption { message: "key unavailable".into(), context: None })
    }
}
