//! # Download chunk pipeline
//!
//! One driver thread per download fetches the root chunk, plans which chunks the requested range
//! needs and keeps up to `max_parallel_fetches` of them in flight. Payloads are verified on the
//! transport thread and decrypted on the crypto pool; the driver decompresses, range-filters and
//! delivers them to the sink in chunk order.
//!
//! ```text
//! Fetching -> Received -> [Decrypting] -> Decompressing -> Filtering -> Delivered
//!                              any state -> Failed
//! ```
//!
//! Buffers waiting between stages are parked in two per-operation maps (decrypted and ready).
//! Whatever is parked when the operation fails is released by the single winning cleanup.

use crate::chunk::{BlobId, ByteRange, ChunkKey, ChunkKind};
use crate::error::{PipelineError, PipelineErrorExt};
use crate::manifest::{BlobManifest, ChunkSpan};
use crate::orchestrator::{Cancel, DownloadSummary, OperationCore, Stages};
use crate::transform::Compression;
use crate::transport::FetchedChunk;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use stratum_buffer::Buffer;
use stratum_channel::ChunkSink;
use stratum_crypto::{CryptoError, CryptoJob, JobResult};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownloadState {
    Fetching,
    Received,
    Decrypting,
    Decompressing,
    Filtering,
    Delivered,
    Failed,
}

#[derive(Debug)]
struct Slot {
    key: ChunkKey,
    span: ChunkSpan,
    state: DownloadState,
}

#[derive(Debug)]
struct Decrypted {
    compression: Compression,
    buffer: Buffer,
}

#[derive(Debug, Default)]
struct Book {
    root: Option<FetchedChunk>,
    slots: Vec<Slot>,
    /// Decrypted, awaiting decompression.
    decrypted: BTreeMap<usize, Decrypted>,
    /// Filtered, awaiting delivery.
    ready: BTreeMap<usize, Buffer>,
    next_fetch: usize,
    next_deliver: usize,
    total_size: u64,
    bytes_delivered: u64,
}

enum Work {
    Stop,
    Decompress(usize, Decrypted),
    Deliver(usize, Buffer),
    Finish,
}

pub(crate) struct DownloadOperation {
    core: OperationCore<DownloadSummary>,
    blob_id: BlobId,
    range: ByteRange,
    stages: Arc<Stages>,
    sink: Arc<dyn ChunkSink>,
    book: Mutex<Book>,
    wake: Condvar,
}

impl fmt::Debug for DownloadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOperation")
            .field("blob_id", &self.blob_id)
            .field("range", &self.range)
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl Cancel for DownloadOperation {
    fn cancel(&self) {
        self.fail(PipelineError::cancelled("download cancelled by caller"));
    }
}

impl DownloadOperation {
    pub(crate) fn new(
        blob_id: BlobId,
        range: ByteRange,
        stages: Arc<Stages>,
        sink: Arc<dyn ChunkSink>,
    ) -> (Self, oneshot::Receiver<Result<DownloadSummary, PipelineError>>) {
        let (core, receiver) = OperationCore::new(&stages.config);
        let operation = Self {
            core,
            blob_id,
            range,
            stages,
            sink,
            book: Mutex::new(Book::default()),
            wake: Condvar::new(),
        };
        (operation, receiver)
    }

    pub(crate) fn run_driver(self: Arc<Self>) {
        if let Err(err) = self.drive() {
            self.fail(err);
        }
        trace!(blob = %self.blob_id, "Download driver stopped");
    }

    fn drive(self: &Arc<Self>) -> Result<(), PipelineError> {
        let Some(root) = self.fetch_root()? else { return Ok(()) };
        self.plan(root)?;

        loop {
            self.issue_fetches();
            match self.next_work()? {
                Work::Stop => return Ok(()),
                Work::Decompress(position, decrypted) => self.decompress(position, decrypted)?,
                Work::Deliver(position, buffer) => self.deliver(position, buffer)?,
                Work::Finish => {
                    self.finish();
                    return Ok(());
                },
            }
        }
    }

    /// Waits on the book until woken or the deadline passes. Returns `true` once it has passed.
    fn wait(&self, book: &mut MutexGuard<'_, Book>) -> bool {
        match self.core.deadline() {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return true;
                }
                self.wake.wait_until(book, deadline);
                false
            },
            None => {
                self.wake.wait(book);
                false
            },
        }
    }

    fn fetch_root(self: &Arc<Self>) -> Result<Option<FetchedChunk>, PipelineError> {
        let key = ChunkKey::root(&self.blob_id);
        let operation = Arc::clone(self);
        self.stages.transport.fetch(
            key,
            Box::new(move |result: Result<FetchedChunk, PipelineError>| match result {
                Ok(root) => operation.on_root(root),
                Err(err) => operation.fail(err.within("fetching root chunk")),
            }),
        );

        let mut book = self.book.lock();
        loop {
            if self.core.is_done() {
                return Ok(None);
            }
            if let Some(root) = book.root.take() {
                return Ok(Some(root));
            }
            if self.wait(&mut book) {
                return Err(PipelineError::timeout().within("fetching root chunk"));
            }
        }
    }

    fn on_root(&self, root: FetchedChunk) {
        let rejected = {
            let mut book = self.book.lock();
            if self.core.is_done() {
                Some(root)
            } else {
                book.root = Some(root);
                None
            }
        };
        match rejected {
            Some(root) => {
                root.payload.release();
            },
            None => {
                self.wake.notify_all();
            },
        }
    }

    /// Decides which chunks the range needs from the root chunk.
    fn plan(self: &Arc<Self>, root: FetchedChunk) -> Result<(), PipelineError> {
        let FetchedChunk { descriptor, payload } = root;
        let root_key = ChunkKey::root(&self.blob_id);

        match descriptor.kind {
            ChunkKind::Simple => {
                let (start, end) = self.range.resolve(descriptor.size)?;
                if start == end {
                    payload.release();
                    self.install(descriptor.size, Vec::new());
                    return Ok(());
                }
                let span = ChunkSpan { index: 0, size: descriptor.size, start, len: end - start };
                self.install(descriptor.size, vec![(root_key.clone(), span)]);
                self.book.lock().next_fetch = 1;
                self.received(0, &root_key, FetchedChunk { descriptor, payload });
                Ok(())
            },
            ChunkKind::Manifest => {
                let decoded = descriptor
                    .checksum
                    .verify(&payload)
                    .and_then(|()| BlobManifest::decode(&payload));
                payload.release();
                let manifest = decoded.context("root manifest")?;
                if manifest.blob_id != self.blob_id {
                    return Err(PipelineError::integrity(format!(
                        "manifest under {} names blob {}",
                        self.blob_id, manifest.blob_id
                    )));
                }

                let (start, end) = self.range.resolve(manifest.total_size)?;
                let slots = manifest
                    .spans(start, end)
                    .into_iter()
                    .map(|span| (ChunkKey::data(&self.blob_id, span.index), span))
                    .collect();
                self.install(manifest.total_size, slots);
                Ok(())
            },
            ChunkKind::Data => {
                payload.release();
                Err(PipelineError::integrity(format!("{root_key} holds a data chunk")))
            },
        }
    }

    fn install(&self, total_size: u64, slots: Vec<(ChunkKey, ChunkSpan)>) {
        debug!(blob = %self.blob_id, total_size, chunks = slots.len(), "Download planned");
        let mut book = self.book.lock();
        book.total_size = total_size;
        book.slots = slots
            .into_iter()
            .map(|(key, span)| Slot { key, span, state: DownloadState::Fetching })
            .collect();
    }

    fn set_state(&self, position: usize, state: DownloadState) {
        let mut book = self.book.lock();
        if let Some(slot) = book.slots.get_mut(position) {
            debug!(key = %slot.key, from = ?slot.state, to = ?state, "Download chunk transition");
            slot.state = state;
        }
    }

    fn issue_fetches(self: &Arc<Self>) {
        let window = self.stages.config.max_parallel_fetches;
        let batch: Vec<(usize, ChunkKey)> = {
            let mut book = self.book.lock();
            let mut batch = Vec::new();
            while !self.core.is_done()
                && book.next_fetch < book.slots.len()
                && book.next_fetch - book.next_deliver < window
            {
                let position = book.next_fetch;
                batch.push((position, book.slots[position].key.clone()));
                book.next_fetch += 1;
            }
            batch
        };

        for (position, key) in batch {
            trace!(%key, position, "Fetching chunk");
            let operation = Arc::clone(self);
            let fetched_key = key.clone();
            self.stages.transport.fetch(
                key,
                Box::new(move |result: Result<FetchedChunk, PipelineError>| match result {
                    Ok(fetched) => operation.received(position, &fetched_key, fetched),
                    Err(err) => operation.fail(err.within(format!("fetching {fetched_key}"))),
                }),
            );
        }
    }

    /// Verifies a fetched payload and starts decrypting it. Runs on the transport thread, or on
    /// the driver for a simple root.
    fn received(self: &Arc<Self>, position: usize, key: &ChunkKey, fetched: FetchedChunk) {
        let FetchedChunk { descriptor, payload } = fetched;
        self.set_state(position, DownloadState::Received);

        let verified = descriptor.checksum.verify(&payload).and_then(|()| {
            if descriptor.kind == ChunkKind::Manifest {
                Err(PipelineError::integrity("manifest found where data was expected"))
            } else {
                Ok(())
            }
        });
        if let Err(err) = verified {
            payload.release();
            self.fail(err.within(key.to_string()));
            return;
        }

        if !descriptor.encrypted {
            self.park_decrypted(position, descriptor.compression, payload);
            return;
        }
        let Some(decryptor) = self.stages.decryptor.clone() else {
            payload.release();
            self.fail(PipelineError::InvalidConfiguration {
                message: "chunk is encrypted but no decryptor is configured".into(),
                context: Some(key.to_string().into()),
            });
            return;
        };

        self.set_state(position, DownloadState::Decrypting);
        let operation = Arc::clone(self);
        let compression = descriptor.compression;
        let job = CryptoJob::new(payload, decryptor, key.associated_data(), move |result| {
            operation.on_decrypted(position, compression, result);
        });
        self.stages.executor.submit(job);
    }

    /// Runs on the crypto worker that finished the job.
    fn on_decrypted(
        &self,
        position: usize,
        compression: Compression,
        result: Result<JobResult, CryptoError>,
    ) {
        match result {
            Ok(output) if self.core.is_done() => {
                output.discard();
            },
            Ok(output) => self.park_decrypted(position, compression, output.extract()),
            Err(err) => {
                self.fail(PipelineError::from(err).within(format!("decrypting chunk {position}")));
            },
        }
    }

    fn park_decrypted(&self, position: usize, compression: Compression, buffer: Buffer) {
        let rejected = {
            let mut book = self.book.lock();
            if self.core.is_done() {
                Some(buffer)
            } else {
                book.decrypted.insert(position, Decrypted { compression, buffer });
                None
            }
        };
        match rejected {
            Some(buffer) => {
                buffer.release();
            },
            None => {
                self.wake.notify_all();
            },
        }
    }

    fn park_ready(&self, position: usize, buffer: Buffer) {
        let rejected = {
            let mut book = self.book.lock();
            if self.core.is_done() {
                Some(buffer)
            } else {
                book.ready.insert(position, buffer);
                None
            }
        };
        if let Some(buffer) = rejected {
            buffer.release();
        }
    }

    fn next_work(&self) -> Result<Work, PipelineError> {
        let mut book = self.book.lock();
        loop {
            if self.core.is_done() {
                return Ok(Work::Stop);
            }
            if let Some((position, decrypted)) = book.decrypted.pop_first() {
                return Ok(Work::Decompress(position, decrypted));
            }
            let next = book.next_deliver;
            if let Some(buffer) = book.ready.remove(&next) {
                return Ok(Work::Deliver(next, buffer));
            }
            if next == book.slots.len() {
                return Ok(Work::Finish);
            }
            if self.wait(&mut book) {
                return Err(PipelineError::timeout().within("awaiting chunks"));
            }
        }
    }

    /// Decompresses and range-filters one chunk on the driver thread.
    fn decompress(&self, position: usize, decrypted: Decrypted) -> Result<(), PipelineError> {
        let Decrypted { compression, buffer } = decrypted;
        let Some(span) = self.book.lock().slots.get(position).map(|slot| slot.span) else {
            buffer.release();
            return Err(PipelineError::from(format!("no chunk planned at position {position}")));
        };

        self.set_state(position, DownloadState::Decompressing);
        let plain = match self.stages.decompressor_for(compression, span.size) {
            Some(decompressor) => decompressor
                .apply(&self.stages.pool, buffer)
                .context(format!("decompressing chunk {}", span.index))?,
            None => buffer,
        };

        self.set_state(position, DownloadState::Filtering);
        let filtered = filter(plain, span)?;
        self.park_ready(position, filtered);
        Ok(())
    }

    fn deliver(&self, position: usize, buffer: Buffer) -> Result<(), PipelineError> {
        if self.core.is_done() {
            buffer.release();
            return Ok(());
        }
        let len = buffer.readable_bytes() as u64;
        let Some(index) = self.book.lock().slots.get(position).map(|slot| slot.span.index) else {
            buffer.release();
            return Err(PipelineError::from(format!("no chunk planned at position {position}")));
        };

        // A failing sink has already released what it was given.
        if let Err(err) = self.sink.deliver(index, buffer, self.core.deadline()) {
            let err = if self.core.deadline_passed() {
                PipelineError::timeout()
            } else {
                PipelineError::from(err)
            };
            return Err(err.within(format!("delivering chunk {index}")));
        }

        {
            let mut book = self.book.lock();
            book.next_deliver += 1;
            book.bytes_delivered += len;
        }
        self.set_state(position, DownloadState::Delivered);
        trace!(blob = %self.blob_id, index, len, "Chunk delivered");
        Ok(())
    }

    fn finish(&self) {
        if !self.core.begin_finish() {
            return;
        }
        self.sink.end_of_stream();
        let summary = {
            let book = self.book.lock();
            DownloadSummary {
                blob_id: self.blob_id.clone(),
                total_size: book.total_size,
                bytes_delivered: book.bytes_delivered,
                chunks_delivered: u32::try_from(book.next_deliver).unwrap_or(u32::MAX),
            }
        };
        info!(
            blob = %self.blob_id,
            bytes = summary.bytes_delivered,
            chunks = summary.chunks_delivered,
            "Download complete"
        );
        self.core.settle(Ok(summary));
    }

    /// Resolves the download with `err` once and releases everything parked.
    fn fail(&self, err: PipelineError) {
        if !self.core.begin_finish() {
            trace!(blob = %self.blob_id, kind = err.kind(), "Download already finished");
            return;
        }
        let parked = self.drain_parked();
        self.wake.notify_all();
        self.sink.abort();
        warn!(blob = %self.blob_id, kind = err.kind(), released = parked, "Download aborted: {err}");
        self.core.settle(Err(err));
    }

    /// Empties both parked maps and the root slot, releasing their buffers. Safe to repeat.
    fn drain_parked(&self) -> usize {
        let (parked, root) = {
            let mut book = self.book.lock();
            for slot in &mut book.slots {
                if slot.state != DownloadState::Delivered {
                    slot.state = DownloadState::Failed;
                }
            }
            let mut parked: Vec<Buffer> =
                mem::take(&mut book.decrypted).into_values().map(|entry| entry.buffer).collect();
            parked.extend(mem::take(&mut book.ready).into_values());
            (parked, book.root.take())
        };

        let count = parked.len() + usize::from(root.is_some());
        for buffer in parked {
            buffer.release();
        }
        if let Some(root) = root {
            root.payload.release();
        }
        count
    }
}

/// Checks the chunk's size and cuts out the part the range wants.
fn filter(plain: Buffer, span: ChunkSpan) -> Result<Buffer, PipelineError> {
    if plain.readable_bytes() as u64 != span.size {
        let message = format!(
            "chunk {} is {} bytes, expected {}",
            span.index,
            plain.readable_bytes(),
            span.size
        );
        plain.release();
        return Err(PipelineError::integrity(message));
    }
    if span.start == 0 && span.len == span.size {
        return Ok(plain);
    }

    let (Ok(start), Ok(len)) = (usize::try_from(span.start), usize::try_from(span.len)) else {
        plain.release();
        return Err(PipelineError::from("chunk span exceeds the address space"));
    };
    let filtered = plain.slice(start, len);
    plain.release();
    filtered.map_err(PipelineError::from)
}
