//! # Upload chunk pipeline
//!
//! One filler thread per upload takes stream buffers from the input channel and cuts them into
//! chunks with [`Buffer::split_to`]. Each full chunk is coalesced, compressed, keyed, encrypted on
//! the crypto pool and sent; completions arrive on the transport thread.
//!
//! ```text
//! Free -> Building -> [AwaitingTypeResolution] -> [Encrypting] -> Ready -> Complete
//!                         any non-terminal state -> Aborted
//! ```
//!
//! The first chunk cannot be keyed until the stream either yields another byte (composite blob,
//! chunk stored at `Data(0)` plus a manifest at `Root`) or finishes (simple blob, stored at
//! `Root`). It parks in `AwaitingTypeResolution` until then.

use crate::checksum::Checksum;
use crate::chunk::{BlobId, ChunkDescriptor, ChunkKey, ChunkKind};
use crate::error::{PipelineError, PipelineErrorExt};
use crate::manifest::{BlobManifest, ChunkRecord};
use crate::orchestrator::{Cancel, OperationCore, Stages};
use crate::transform::Compression;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use stratum_buffer::{Buffer, BufferPool, HeldBuffer};
use stratum_channel::{ChunkTransferChannel, Taken, TransferFailure};
use stratum_crypto::{CryptoError, CryptoJob, JobResult};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadState {
    /// Created, holds nothing yet.
    Free,
    Building,
    AwaitingTypeResolution,
    Encrypting,
    Ready,
    Complete,
    Aborted,
}

impl UploadState {
    const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Simple,
    Composite,
}

type Target = (ChunkKey, ChunkKind);

#[derive(Debug)]
struct UploadChunk {
    index: u32,
    plain_size: u64,
    compression: Compression,
    state: Mutex<UploadState>,
    held: HeldBuffer,
    target: OnceLock<Target>,
    encrypted: AtomicBool,
    descriptor: OnceLock<ChunkDescriptor>,
    attempts: AtomicU32,
}

impl UploadChunk {
    fn new(index: u32, plain_size: u64, compression: Compression) -> Self {
        Self {
            index,
            plain_size,
            compression,
            state: Mutex::new(UploadState::Free),
            held: HeldBuffer::empty(),
            target: OnceLock::new(),
            encrypted: AtomicBool::new(false),
            descriptor: OnceLock::new(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Moves `buffer` into the chunk: `Free -> Building`.
    fn fill(&self, buffer: Buffer) {
        if !self.transition(&[UploadState::Free], UploadState::Building) {
            buffer.release();
            return;
        }
        if let Err(buffer) = self.held.replace(buffer) {
            buffer.release();
        }
    }

    fn transition(&self, from: &[UploadState], to: UploadState) -> bool {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            trace!(index = self.index, current = ?*state, next = ?to, "Chunk transition refused");
            return false;
        }
        debug!(index = self.index, from = ?*state, to = ?to, "Upload chunk transition");
        *state = to;
        true
    }

    /// Moves a live chunk to `Aborted` and releases what it holds. Returns `true` if this call
    /// released the buffer.
    fn abort(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = UploadState::Aborted;
            }
        }
        self.held.release()
    }

    /// Descriptor of the stored payload, computed over the first payload sent.
    fn descriptor(&self, kind: ChunkKind, payload: &Buffer) -> &ChunkDescriptor {
        self.descriptor.get_or_init(|| ChunkDescriptor {
            kind,
            size: self.plain_size,
            stored_size: payload.readable_bytes() as u64,
            checksum: Checksum::of(payload),
            compression: self.compression,
            encrypted: self.encrypted.load(Ordering::Acquire),
        })
    }
}

/// Stream bytes collected for the chunk currently being filled.
#[derive(Debug, Default)]
struct Accumulator {
    index: u32,
    pieces: Vec<Buffer>,
    filled: usize,
}

impl Accumulator {
    fn take(&mut self) -> Result<(u32, Vec<Buffer>), PipelineError> {
        let index = self.index;
        self.index = index.checked_add(1).ok_or("blob exceeds the chunk index range")?;
        self.filled = 0;
        Ok((index, mem::take(&mut self.pieces)))
    }

    fn release(&mut self) {
        for piece in self.pieces.drain(..) {
            piece.release();
        }
        self.filled = 0;
    }
}

#[derive(Debug, Default)]
struct LayoutSlot {
    resolved: Option<Layout>,
    parked: Option<Arc<UploadChunk>>,
}

#[derive(Debug, Default)]
struct Progress {
    total: Option<u32>,
    records: Vec<ChunkRecord>,
    root_done: bool,
    manifest_started: bool,
}

enum Next {
    Wait,
    Succeed,
    Manifest(u32, Vec<ChunkRecord>),
}

#[derive(Debug)]
pub(crate) struct UploadOperation {
    core: OperationCore<BlobId>,
    blob_id: BlobId,
    stages: Arc<Stages>,
    channel: ChunkTransferChannel,
    chunks: Mutex<BTreeMap<u32, Arc<UploadChunk>>>,
    layout: Mutex<LayoutSlot>,
    progress: Mutex<Progress>,
}

impl Cancel for UploadOperation {
    fn cancel(&self) {
        self.fail(PipelineError::cancelled("upload cancelled by caller"));
    }
}

impl UploadOperation {
    pub(crate) fn new(
        blob_id: BlobId,
        stages: Arc<Stages>,
        channel: ChunkTransferChannel,
    ) -> (Self, oneshot::Receiver<Result<BlobId, PipelineError>>) {
        let (core, receiver) = OperationCore::new(&stages.config);
        let operation = Self {
            core,
            blob_id,
            stages,
            channel,
            chunks: Mutex::new(BTreeMap::new()),
            layout: Mutex::new(LayoutSlot::default()),
            progress: Mutex::new(Progress::default()),
        };
        (operation, receiver)
    }

    /// Filler thread body: drains the input channel, then waits for the operation to settle and
    /// enforces its deadline.
    pub(crate) fn run_filler(self: Arc<Self>) {
        let timeout = self.stages.config.take_timeout();
        let mut accumulator = Accumulator::default();

        loop {
            if self.core.is_done() {
                break;
            }
            if self.core.deadline_passed() {
                self.fail(PipelineError::timeout().within("filling chunks"));
                break;
            }

            match self.channel.take(timeout) {
                Ok(Taken::Timeout) => {},
                Ok(Taken::Buffer(buffer)) => {
                    let len = buffer.readable_bytes();
                    match self.absorb(&mut accumulator, buffer) {
                        Ok(()) => {
                            self.channel.acknowledge(None);
                            trace!(blob = %self.blob_id, len, "Stream buffer consumed");
                        },
                        Err(err) => {
                            self.channel.acknowledge(Some(TransferFailure::new(err.to_string())));
                            self.fail(err);
                            break;
                        },
                    }
                },
                Ok(Taken::Finished) => {
                    if let Err(err) = self.finish_stream(&mut accumulator) {
                        self.fail(err);
                    }
                    break;
                },
                Err(err) => {
                    self.fail(PipelineError::from(err).within("input channel"));
                    break;
                },
            }
        }

        accumulator.release();
        if !self.core.wait_settled() {
            self.fail(PipelineError::timeout().within("awaiting chunk completions"));
        }
        trace!(blob = %self.blob_id, "Filler stopped");
    }

    /// Cuts `buffer` into the current chunk, sealing every chunk it fills. Consumes the
    /// consumer's handle.
    fn absorb(
        self: &Arc<Self>,
        accumulator: &mut Accumulator,
        mut buffer: Buffer,
    ) -> Result<(), PipelineError> {
        let chunk_size = self.stages.config.chunk_size;
        while !buffer.is_empty() {
            if accumulator.index == 1 && accumulator.filled == 0 {
                self.resolve_layout(Layout::Composite);
            }

            let room = chunk_size - accumulator.filled;
            let piece = buffer.split_to(room.min(buffer.readable_bytes()))?;
            accumulator.filled += piece.readable_bytes();
            accumulator.pieces.push(piece);

            if accumulator.filled == chunk_size {
                let (index, pieces) = accumulator.take()?;
                self.seal(index, pieces)?;
            }
        }
        buffer.release();
        Ok(())
    }

    fn finish_stream(self: &Arc<Self>, accumulator: &mut Accumulator) -> Result<(), PipelineError> {
        // An empty stream still produces one empty chunk.
        let pending = accumulator.filled > 0 || accumulator.index == 0;
        let total = accumulator
            .index
            .checked_add(u32::from(pending))
            .ok_or("blob exceeds the chunk index range")?;

        if total == 1 {
            self.resolve_layout(Layout::Simple);
        }
        if pending {
            let (index, pieces) = accumulator.take()?;
            self.seal(index, pieces)?;
        }

        self.progress.lock().total = Some(total);
        debug!(blob = %self.blob_id, chunks = total, "Stream finished");
        self.check_complete();
        Ok(())
    }

    /// Turns collected pieces into a chunk and moves it on as far as the layout allows.
    fn seal(self: &Arc<Self>, index: u32, pieces: Vec<Buffer>) -> Result<(), PipelineError> {
        let stages = &self.stages;
        let plain = coalesce(&stages.pool, pieces);
        let plain_size = plain.readable_bytes() as u64;

        let (stored, compression) = match &stages.compressor {
            Some(compressor) => (
                compressor.apply(&stages.pool, plain).context(format!("compressing chunk {index}"))?,
                stages.config.compression,
            ),
            None => (plain, Compression::None),
        };
        trace!(blob = %self.blob_id, index, plain_size, stored = stored.readable_bytes(), "Chunk sealed");

        let chunk = Arc::new(UploadChunk::new(index, plain_size, compression));
        chunk.fill(stored);
        if !self.register(&chunk) {
            return Ok(());
        }

        let layout = {
            let mut slot = self.layout.lock();
            match slot.resolved {
                Some(layout) => layout,
                None => {
                    chunk.transition(&[UploadState::Building], UploadState::AwaitingTypeResolution);
                    slot.parked = Some(chunk);
                    return Ok(());
                },
            }
        };
        self.dispatch(&chunk, layout);
        Ok(())
    }

    /// Adds `chunk` to the operation, or aborts it if the operation already finished.
    fn register(&self, chunk: &Arc<UploadChunk>) -> bool {
        {
            let mut chunks = self.chunks.lock();
            if !self.core.is_done() {
                chunks.insert(chunk.index, Arc::clone(chunk));
                return true;
            }
        }
        chunk.abort();
        false
    }

    fn resolve_layout(self: &Arc<Self>, layout: Layout) {
        let parked = {
            let mut slot = self.layout.lock();
            if slot.resolved.is_some() {
                return;
            }
            slot.resolved = Some(layout);
            slot.parked.take()
        };
        debug!(blob = %self.blob_id, ?layout, "Blob layout resolved");
        if let Some(chunk) = parked {
            self.dispatch(&chunk, layout);
        }
    }

    fn dispatch(self: &Arc<Self>, chunk: &Arc<UploadChunk>, layout: Layout) {
        let target = match layout {
            Layout::Simple => (ChunkKey::root(&self.blob_id), ChunkKind::Simple),
            Layout::Composite => (ChunkKey::data(&self.blob_id, chunk.index), ChunkKind::Data),
        };
        if chunk.target.set(target).is_err() {
            warn!(blob = %self.blob_id, index = chunk.index, "Chunk keyed twice");
            return;
        }

        let Some(encryptor) = self.stages.encryptor.clone() else {
            self.send_ready(chunk);
            return;
        };
        let from = [UploadState::Building, UploadState::AwaitingTypeResolution];
        if !chunk.transition(&from, UploadState::Encrypting) {
            return;
        }
        // Released by an abort in the meantime.
        let Some(input) = chunk.held.retain() else { return };
        let Some((key, _)) = chunk.target.get() else { return };

        let operation = Arc::clone(self);
        let encrypted = Arc::clone(chunk);
        let job = CryptoJob::new(input, encryptor, key.associated_data(), move |result| {
            operation.on_encrypted(&encrypted, result);
        });
        self.stages.executor.submit(job);
    }

    /// Runs on the crypto worker that finished the job.
    fn on_encrypted(
        self: &Arc<Self>,
        chunk: &Arc<UploadChunk>,
        result: Result<JobResult, CryptoError>,
    ) {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                self.fail(PipelineError::from(err).within(format!("encrypting chunk {}", chunk.index)));
                return;
            },
        };
        if self.core.is_done() {
            output.discard();
            return;
        }

        chunk.encrypted.store(true, Ordering::Release);
        match chunk.held.replace(output.extract()) {
            Ok(plain) => {
                if let Some(plain) = plain {
                    plain.release();
                }
                self.send_ready(chunk);
            },
            Err(sealed) => {
                sealed.release();
            },
        }
    }

    fn send_ready(self: &Arc<Self>, chunk: &Arc<UploadChunk>) {
        let from = [UploadState::Building, UploadState::AwaitingTypeResolution, UploadState::Encrypting];
        if !chunk.transition(&from, UploadState::Ready) {
            return;
        }
        if let Some(payload) = chunk.held.retain() {
            self.send(chunk, payload);
        }
    }

    fn send(self: &Arc<Self>, chunk: &Arc<UploadChunk>, payload: Buffer) {
        let Some((key, kind)) = chunk.target.get() else {
            payload.release();
            self.fail(PipelineError::from("chunk sent before it was keyed"));
            return;
        };
        let descriptor = chunk.descriptor(*kind, &payload).clone();
        let attempt = chunk.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(%key, attempt, refs = payload.ref_count(), "Sending chunk");

        let operation = Arc::clone(self);
        let sent = Arc::clone(chunk);
        self.stages.transport.send(
            key.clone(),
            descriptor,
            payload,
            Box::new(move |result: Result<(), PipelineError>| operation.on_sent(&sent, result)),
        );
    }

    /// Runs on the transport's completion thread.
    fn on_sent(self: &Arc<Self>, chunk: &Arc<UploadChunk>, result: Result<(), PipelineError>) {
        let err = match result {
            Ok(()) => {
                if chunk.transition(&[UploadState::Ready], UploadState::Complete) {
                    chunk.held.release();
                    self.complete_chunk(chunk);
                }
                return;
            },
            Err(err) => err,
        };

        let attempts = chunk.attempts.load(Ordering::Acquire);
        if err.is_retryable() && attempts < self.stages.config.max_send_attempts && !self.core.is_done() {
            warn!(blob = %self.blob_id, index = chunk.index, attempts, "Resubmitting chunk: {err}");
            // The sent payload is gone; resend a fresh copy of what the chunk holds.
            let copy = chunk.held.with(|held| held.map(|buffer| self.stages.pool.copy_from_slice(buffer)));
            if let Some(copy) = copy {
                self.send(chunk, copy);
            }
            return;
        }
        self.fail(err.within(format!("sending chunk {} after {attempts} attempts", chunk.index)));
    }

    fn complete_chunk(self: &Arc<Self>, chunk: &UploadChunk) {
        let (Some((key, kind)), Some(descriptor)) = (chunk.target.get(), chunk.descriptor.get()) else {
            self.fail(PipelineError::from("completed chunk has no descriptor"));
            return;
        };
        {
            let mut progress = self.progress.lock();
            match kind {
                ChunkKind::Data => progress.records.push(ChunkRecord {
                    index: chunk.index,
                    size: descriptor.size,
                    stored_size: descriptor.stored_size,
                    checksum: descriptor.checksum,
                }),
                ChunkKind::Simple | ChunkKind::Manifest => progress.root_done = true,
            }
        }
        debug!(%key, ?kind, "Chunk stored");
        self.check_complete();
    }

    fn check_complete(self: &Arc<Self>) {
        let next = {
            let mut progress = self.progress.lock();
            match progress.total {
                None => Next::Wait,
                Some(_) if progress.root_done => Next::Succeed,
                Some(total)
                    if total > 1
                        && !progress.manifest_started
                        && u32::try_from(progress.records.len()) == Ok(total) =>
                {
                    progress.manifest_started = true;
                    Next::Manifest(total, progress.records.clone())
                },
                Some(_) => Next::Wait,
            }
        };

        match next {
            Next::Wait => {},
            Next::Succeed => self.succeed(),
            Next::Manifest(index, records) => {
                if let Err(err) = self.send_manifest(index, records) {
                    self.fail(err);
                }
            },
        }
    }

    /// Stores the manifest at `Root`. It is neither compressed nor encrypted.
    fn send_manifest(self: &Arc<Self>, index: u32, records: Vec<ChunkRecord>) -> Result<(), PipelineError> {
        let chunk_size = self.stages.config.chunk_size as u64;
        let manifest = BlobManifest::new(self.blob_id.clone(), chunk_size, records);
        let bytes = manifest.encode()?;

        let chunk = Arc::new(UploadChunk::new(index, bytes.len() as u64, Compression::None));
        chunk.fill(self.stages.pool.from_vec(bytes));
        if chunk.target.set((ChunkKey::root(&self.blob_id), ChunkKind::Manifest)).is_err() {
            return Err(PipelineError::from("manifest chunk keyed twice"));
        }
        if !self.register(&chunk) {
            return Ok(());
        }
        debug!(blob = %self.blob_id, chunks = manifest.chunks.len(), size = manifest.total_size, "Sending manifest");
        self.send_ready(&chunk);
        Ok(())
    }

    fn succeed(&self) {
        if !self.core.begin_finish() {
            return;
        }
        self.channel.close();
        let chunks = self.chunks.lock().len();
        info!(blob = %self.blob_id, chunks, "Upload complete");
        self.core.settle(Ok(self.blob_id.clone()));
    }

    /// Resolves the upload with `err` once, closing the input channel and releasing every chunk.
    fn fail(&self, err: PipelineError) {
        if !self.core.begin_finish() {
            trace!(blob = %self.blob_id, kind = err.kind(), "Upload already finished");
            return;
        }
        let drained = self.channel.close();
        let chunks: Vec<_> = self.chunks.lock().values().cloned().collect();
        let released = chunks.iter().filter(|chunk| chunk.abort()).count();
        warn!(blob = %self.blob_id, kind = err.kind(), drained, released, "Upload aborted: {err}");
        self.core.settle(Err(err));
    }
}

/// Joins a chunk's pieces into one buffer. A single piece is used as is.
fn coalesce(pool: &BufferPool, mut pieces: Vec<Buffer>) -> Buffer {
    if pieces.len() == 1
        && let Some(piece) = pieces.pop()
    {
        return piece;
    }
    let len = pieces.iter().map(Buffer::readable_bytes).sum();
    let mut joined = pool.allocate(len);
    for piece in pieces {
        joined.extend_from_slice(&piece);
        piece.release();
    }
    joined.freeze()
}
