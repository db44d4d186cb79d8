use crate::error::CryptoError;
use crate::job::CryptoJob;
use parking_lot::{Condvar, Mutex};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use stratum_buffer::BufferPool;
use tracing::{debug, info, trace, warn};

/// Counters of an executor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub closed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug, Default)]
struct Queue {
    jobs: VecDeque<CryptoJob>,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    pool: BufferPool,
    counters: Counters,
}

/// Fixed pool of worker threads running [`CryptoJob`]s.
///
/// [`submit`](Self::submit) never blocks. Each job's callback runs on the worker that finished
/// it, after the job's input has been released. Dropping the executor shuts it down.
///
/// ```rust
/// use std::sync::mpsc;
/// use stratum_buffer::BufferPool;
/// use stratum_crypto::{ChaCha, ChunkCipher, CryptoJob, CryptoJobExecutor};
///
/// # fn main() -> Result<(), stratum_crypto::CryptoError> {
/// let pool = BufferPool::new();
/// let executor = CryptoJobExecutor::new(2, pool.clone())?;
/// let cipher = ChunkCipher::<ChaCha>::builder().derived_key("ikm", "salt", "bucket")?.build()?;
///
/// let (tx, rx) = mpsc::channel();
/// let job = CryptoJob::new(pool.copy_from_slice(b"chunk"), cipher.encryptor(), b"key".to_vec(), move |result| {
///     tx.send(result.map(|r| r.extract())).ok();
/// });
/// executor.submit(job);
///
/// let sealed = rx.recv().unwrap()?;
/// assert_eq!(sealed.readable_bytes(), 5 + stratum_crypto::OVERHEAD);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CryptoJobExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CryptoJobExecutor {
    /// Starts `workers` threads allocating job outputs from `pool`.
    ///
    /// # Errors
    /// * [`CryptoError::InvalidConfiguration`] if `workers` is zero.
    /// * [`CryptoError::Spawn`] if a thread cannot be started.
    pub fn new(workers: usize, pool: BufferPool) -> Result<Self, CryptoError> {
        if workers == 0 {
            return Err(CryptoError::InvalidConfiguration {
                message: "executor needs at least one worker".into(),
                context: None,
            });
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            pool,
            counters: Counters::default(),
        });
        let executor = Self { shared, workers: Mutex::new(Vec::with_capacity(workers)) };

        for index in 0..workers {
            let shared = Arc::clone(&executor.shared);
            let handle = thread::Builder::new()
                .name(format!("stratum-crypto-{index}"))
                .spawn(move || worker_loop(&shared))
                .map_err(|source| CryptoError::Spawn {
                    source,
                    context: Some(format!("worker {index}").into()),
                })?;
            executor.workers.lock().push(handle);
        }

        info!(workers, "Crypto executor started");
        Ok(executor)
    }

    /// Queues `job`. After shutdown the job is closed on the calling thread instead.
    pub fn submit(&self, job: CryptoJob) {
        let rejected = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                Some(job)
            } else {
                queue.jobs.push_back(job);
                None
            }
        };

        match rejected {
            None => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.shared.available.notify_one();
            },
            Some(job) => {
                warn!(transform = job.transform_name(), "Job submitted after shutdown");
                self.close_job(job, "executor is shut down");
            },
        }
    }

    /// Releases the job's input and fails its callback with [`CryptoError::Aborted`].
    pub fn close_job(&self, job: CryptoJob, reason: impl Into<Cow<'static, str>>) {
        self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);
        job.close(reason);
    }

    /// Stops accepting jobs, closes every queued job and joins the workers.
    ///
    /// Jobs already running finish and report normally. Calling again is a no-op.
    pub fn shutdown(&self) {
        let queued: Vec<CryptoJob> = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                Vec::new()
            } else {
                queue.shutdown = true;
                queue.jobs.drain(..).collect()
            }
        };
        self.shared.available.notify_all();

        if !queued.is_empty() {
            debug!(jobs = queued.len(), "Closing queued crypto jobs");
        }
        for job in queued {
            self.close_job(job, "executor shut down");
        }

        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Crypto worker panicked");
            }
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        let counters = &self.shared.counters;
        ExecutorStats {
            submitted: counters.submitted.load(Ordering::Acquire),
            succeeded: counters.succeeded.load(Ordering::Acquire),
            failed: counters.failed.load(Ordering::Acquire),
            closed: counters.closed.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }
}

impl Drop for CryptoJobExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    trace!("Crypto worker started");
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    break None;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                shared.available.wait(&mut queue);
            }
        };
        let Some(job) = job else { break };

        let counter =
            if job.run(&shared.pool) { &shared.counters.succeeded } else { &shared.counters.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }
    trace!("Crypto worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_is_rejected() {
        let err = CryptoJobExecutor::new(0, BufferPool::new()).unwrap_err();
        assert_eq!(err.kind(), "InvalidConfiguration");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let executor = CryptoJobExecutor::new(2, BufferPool::new()).unwrap();
        executor.shutdown();
        executor.shutdown();
        assert!(executor.is_shut_down());
        assert_eq!(executor.stats(), ExecutorStats::default());
    }
}
