//! # Chunk transport
//!
//! [`ChunkTransport`] is the network boundary of the pipeline. Calls return immediately; the
//! outcome arrives through a callback on the transport's own completion thread.
//!
//! Ownership: `send` takes the payload by value and the transport releases it before the
//! callback runs, on every path. `fetch` hands the callback a freshly allocated payload.

use crate::checksum::Checksum;
use crate::chunk::{ChunkDescriptor, ChunkKey};
use crate::error::PipelineError;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use stratum_buffer::{Buffer, BufferPool};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub type SendCallback = Box<dyn FnOnce(Result<(), PipelineError>) + Send>;
pub type FetchCallback = Box<dyn FnOnce(Result<FetchedChunk, PipelineError>) + Send>;

/// A stored chunk as returned by [`ChunkTransport::fetch`]. The receiver owns `payload`.
#[derive(Debug)]
pub struct FetchedChunk {
    pub descriptor: ChunkDescriptor,
    pub payload: Buffer,
}

/// Asynchronous chunk store.
pub trait ChunkTransport: Send + Sync {
    /// Stores `payload` under `key`. The payload is released before `callback` runs.
    fn send(
        &self,
        key: ChunkKey,
        descriptor: ChunkDescriptor,
        payload: Buffer,
        callback: SendCallback,
    );

    /// Reads the chunk stored under `key`.
    fn fetch(&self, key: ChunkKey, callback: FetchCallback);
}

/// Failure a [`MemoryTransport`] can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A retryable connection failure.
    Transient,
    /// The remote side saw a checksum mismatch.
    Integrity,
    /// A failure no resubmission can fix.
    Fatal,
}

impl Fault {
    fn error(self, key: &ChunkKey) -> PipelineError {
        let message = format!("injected fault for {key}").into();
        match self {
            Self::Transient => PipelineError::TransientIo { message, context: None },
            Self::Integrity => PipelineError::DataIntegrity { message, context: None },
            Self::Fatal => PipelineError::Internal { message, context: None },
        }
    }
}

type SendObserver = Box<dyn Fn(&ChunkKey, &Buffer) + Send + Sync>;
type Tamper = Box<dyn FnOnce(&mut ChunkDescriptor, &mut Vec<u8>) + Send>;

enum Request {
    Send { key: ChunkKey, descriptor: ChunkDescriptor, payload: Buffer, callback: SendCallback },
    Fetch { key: ChunkKey, callback: FetchCallback },
}

#[derive(Default)]
struct Faults {
    sends: VecDeque<Fault>,
    fetches: VecDeque<Fault>,
    tampers: FxHashMap<ChunkKey, Tamper>,
}

struct Store {
    pool: BufferPool,
    chunks: Mutex<FxHashMap<ChunkKey, (ChunkDescriptor, Vec<u8>)>>,
    faults: Mutex<Faults>,
    observer: Mutex<Option<SendObserver>>,
    delay: Mutex<Option<Duration>>,
    sends: AtomicU64,
    fetches: AtomicU64,
}

/// In-process [`ChunkTransport`] with its own completion thread and fault injection.
///
/// Sent payloads are checksum-verified against their descriptor and copied into a map; fetches
/// allocate their payload from the transport's pool.
pub struct MemoryTransport {
    store: Arc<Store>,
    requests: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("chunks", &self.len())
            .field("sends", &self.sends())
            .field("fetches", &self.fetches())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Starts the completion thread.
    ///
    /// # Errors
    /// Returns [`PipelineError::Internal`] if the thread cannot be spawned.
    pub fn new(pool: BufferPool) -> Result<Self, PipelineError> {
        let store = Arc::new(Store {
            pool,
            chunks: Mutex::new(FxHashMap::default()),
            faults: Mutex::new(Faults::default()),
            observer: Mutex::new(None),
            delay: Mutex::new(None),
            sends: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        let worker_store = Arc::clone(&store);
        let worker = thread::Builder::new()
            .name("stratum-transport".to_owned())
            .spawn(move || {
                while let Some(request) = rx.blocking_recv() {
                    worker_store.complete(request);
                }
                trace!("Transport worker stopped");
            })
            .map_err(|err| PipelineError::Internal {
                message: format!("failed to spawn transport worker: {err}").into(),
                context: None,
            })?;

        Ok(Self {
            store,
            requests: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Fails the next send with `fault`. Faults queue up in call order.
    pub fn fail_next_send(&self, fault: Fault) {
        self.store.faults.lock().sends.push_back(fault);
    }

    /// Fails the next fetch with `fault`.
    pub fn fail_next_fetch(&self, fault: Fault) {
        self.store.faults.lock().fetches.push_back(fault);
    }

    /// Rewrites the stored chunk under `key` before the next fetch of it returns.
    pub fn tamper(
        &self,
        key: ChunkKey,
        tamper: impl FnOnce(&mut ChunkDescriptor, &mut Vec<u8>) + Send + 'static,
    ) {
        self.store.faults.lock().tampers.insert(key, Box::new(tamper));
    }

    /// Calls `observer` with every payload as it is handed to [`send`](ChunkTransport::send).
    pub fn observe_sends(&self, observer: impl Fn(&ChunkKey, &Buffer) + Send + Sync + 'static) {
        *self.store.observer.lock() = Some(Box::new(observer));
    }

    /// Delays every completion by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.store.delay.lock() = delay;
    }

    #[must_use]
    pub fn sends(&self) -> u64 {
        self.store.sends.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fetches(&self) -> u64 {
        self.store.fetches.load(Ordering::Relaxed)
    }

    /// Number of stored chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.chunks.lock().len()
    }

    /// Copy of what is stored under `key`.
    #[must_use]
    pub fn stored(&self, key: &ChunkKey) -> Option<(ChunkDescriptor, Vec<u8>)> {
        self.store.chunks.lock().get(key).cloned()
    }

    fn enqueue(&self, request: Request) {
        let rejected = match self.requests.lock().as_ref() {
            Some(tx) => tx.send(request).err().map(|err| err.0),
            None => Some(request),
        };
        if let Some(request) = rejected {
            warn!("Transport stopped, failing request");
            let message = "transport stopped";
            match request {
                Request::Send { payload, callback, .. } => {
                    payload.release();
                    callback(Err(PipelineError::TransientIo { message: message.into(), context: None }));
                },
                Request::Fetch { callback, .. } => {
                    callback(Err(PipelineError::TransientIo { message: message.into(), context: None }));
                },
            }
        }
    }
}

impl ChunkTransport for MemoryTransport {
    fn send(
        &self,
        key: ChunkKey,
        descriptor: ChunkDescriptor,
        payload: Buffer,
        callback: SendCallback,
    ) {
        if let Some(observer) = self.store.observer.lock().as_ref() {
            observer(&key, &payload);
        }
        self.enqueue(Request::Send { key, descriptor, payload, callback });
    }

    fn fetch(&self, key: ChunkKey, callback: FetchCallback) {
        self.enqueue(Request::Fetch { key, callback });
    }
}

impl Store {
    fn complete(&self, request: Request) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        match request {
            Request::Send { key, descriptor, payload, callback } => {
                self.sends.fetch_add(1, Ordering::Relaxed);
                let result = self.store(&key, descriptor, &payload);
                payload.release();
                trace!(%key, ok = result.is_ok(), "Send completed");
                callback(result);
            },
            Request::Fetch { key, callback } => {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                let result = self.load(&key);
                trace!(%key, ok = result.is_ok(), "Fetch completed");
                callback(result);
            },
        }
    }

    fn store(
        &self,
        key: &ChunkKey,
        descriptor: ChunkDescriptor,
        payload: &Buffer,
    ) -> Result<(), PipelineError> {
        if let Some(fault) = self.faults.lock().sends.pop_front() {
            debug!(%key, ?fault, "Injecting send fault");
            return Err(fault.error(key));
        }
        descriptor.checksum.verify(payload)?;
        if descriptor.stored_size != payload.readable_bytes() as u64 {
            return Err(PipelineError::integrity(format!(
                "{key}: descriptor says {} bytes, got {}",
                descriptor.stored_size,
                payload.readable_bytes()
            )));
        }
        self.chunks.lock().insert(key.clone(), (descriptor, payload.to_vec()));
        Ok(())
    }

    fn load(&self, key: &ChunkKey) -> Result<FetchedChunk, PipelineError> {
        let (fault, tamper) = {
            let mut faults = self.faults.lock();
            (faults.fetches.pop_front(), faults.tampers.remove(key))
        };
        if let Some(fault) = fault {
            debug!(%key, ?fault, "Injecting fetch fault");
            return Err(fault.error(key));
        }

        let mut chunks = self.chunks.lock();
        let Some((descriptor, bytes)) = chunks.get_mut(key) else {
            return Err(PipelineError::NotFound { message: key.to_string().into(), context: None });
        };
        if let Some(tamper) = tamper {
            tamper(descriptor, bytes);
        }
        Ok(FetchedChunk { descriptor: descriptor.clone(), payload: self.pool.copy_from_slice(bytes) })
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.requests.lock().take();
        let Some(worker) = self.worker.lock().take() else { return };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("Transport worker panicked");
        }
    }
}

/// Recomputes the checksum after a test rewrites a stored payload.
pub fn reseal(descriptor: &mut ChunkDescriptor, bytes: &[u8]) {
    descriptor.checksum = Checksum::of(bytes);
    descriptor.stored_size = bytes.len() as u64;
}
