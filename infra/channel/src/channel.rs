use crate::error::ChannelError;
use crate::future::{Completion, TransferFuture, TransferResult};
use parking_lot::{Condvar, Mutex};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_buffer::Buffer;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Pending transfers a channel accepts before [`ChunkTransferChannel::ready`] starts waiting.
pub const DEFAULT_CAPACITY: usize = 16;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting writes.
    Open,
    /// End of stream: no new writes, pending transfers still drain.
    Finished,
    /// Terminal: everything pending or awaiting acknowledgment was failed and released.
    Closed,
}

/// Outcome of [`ChunkTransferChannel::take`].
#[derive(Debug)]
pub enum Taken {
    /// A handle to the oldest pending buffer. The caller owns it.
    Buffer(Buffer),
    /// Nothing arrived before the timeout elapsed.
    Timeout,
    /// The stream was finished and every pending transfer has been taken.
    Finished,
}

/// Failure reported by the consumer through [`ChunkTransferChannel::acknowledge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    reason: Cow<'static, str>,
}

impl TransferFailure {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<TransferFailure> for ChannelError {
    fn from(failure: TransferFailure) -> Self {
        Self::Rejected { message: failure.reason, context: None }
    }
}

#[derive(Debug)]
struct PendingTransfer {
    buffer: Buffer,
    len: usize,
    completion: Completion,
}

#[derive(Debug)]
struct Shared {
    state: ChannelState,
    pending: VecDeque<PendingTransfer>,
    awaiting: VecDeque<PendingTransfer>,
}

#[derive(Debug)]
struct Inner {
    shared: Mutex<Shared>,
    available: Condvar,
    space: Condvar,
    space_notify: Notify,
    capacity: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        let leftover: Vec<_> = shared.pending.drain(..).chain(shared.awaiting.drain(..)).collect();
        if !leftover.is_empty() {
            warn!(transfers = leftover.len(), "Channel dropped with transfers in flight");
        }
        fail_all(leftover, "channel dropped");
    }
}

/// Bounded hand-off queue between a stream producer and a chunk consumer.
///
/// A buffer written into the channel belongs to the channel until the consumer acknowledges it
/// (or the channel is closed). [`take`](Self::take) hands the consumer its own handle; the channel
/// keeps the written one in an awaiting-acknowledgment queue so that a concurrent
/// [`close`](Self::close) can still fail and release it.
///
/// Handles are cheap to clone; clones share one channel.
///
/// ```rust
/// use std::time::Duration;
/// use stratum_buffer::BufferPool;
/// use stratum_channel::{ChunkTransferChannel, Taken};
///
/// let pool = BufferPool::new();
/// let channel = ChunkTransferChannel::new();
/// let transfer = channel.write(pool.copy_from_slice(b"stream bytes"));
///
/// let Ok(Taken::Buffer(buffer)) = channel.take(Duration::from_millis(10)) else { panic!() };
/// assert_eq!(&*buffer, b"stream bytes");
/// buffer.release();
/// assert!(channel.acknowledge(None));
///
/// assert_eq!(transfer.wait(), Ok(12));
/// assert!(pool.is_quiescent());
/// ```
#[derive(Debug, Clone)]
pub struct ChunkTransferChannel {
    inner: Arc<Inner>,
}

impl Default for ChunkTransferChannel {
    fn default() -> Self {
        Self::from_capacity(DEFAULT_CAPACITY)
    }
}

impl ChunkTransferChannel {
    /// Creates an open channel with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an open channel that reports readiness while fewer than `capacity` transfers
    /// are pending.
    ///
    /// # Errors
    /// Returns [`ChannelError::InvalidCapacity`] if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::InvalidCapacity {
                message: "capacity must be greater than zero".into(),
                context: None,
            });
        }
        Ok(Self::from_capacity(capacity))
    }

    fn from_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: ChannelState::Open,
                    pending: VecDeque::with_capacity(capacity),
                    awaiting: VecDeque::new(),
                }),
                available: Condvar::new(),
                space: Condvar::new(),
                space_notify: Notify::new(),
                capacity,
            }),
        }
    }

    /// Moves `buffer` into the channel.
    ///
    /// If the channel is not open the buffer is released immediately and the returned future
    /// resolves to [`ChannelError::ChannelClosed`].
    pub fn write(&self, buffer: Buffer) -> TransferFuture {
        let (completion, future) = TransferFuture::pair();
        self.enqueue(buffer, completion);
        future
    }

    /// Like [`write`](Self::write), reporting the outcome through `callback` instead.
    ///
    /// The callback runs on whichever thread acknowledges, closes or rejects the transfer.
    pub fn write_with_callback(
        &self,
        buffer: Buffer,
        callback: impl FnOnce(TransferResult) + Send + 'static,
    ) {
        self.enqueue(buffer, Completion::Callback(Box::new(callback)));
    }

    fn enqueue(&self, buffer: Buffer, completion: Completion) {
        let len = buffer.readable_bytes();
        let rejected = {
            let mut shared = self.inner.shared.lock();
            let state = shared.state;
            if state == ChannelState::Open {
                shared.pending.push_back(PendingTransfer { buffer, len, completion });
                None
            } else {
                Some((buffer, completion, state))
            }
        };

        match rejected {
            None => {
                trace!(len, "Transfer queued");
                self.inner.available.notify_one();
            },
            Some((buffer, completion, state)) => {
                warn!(buffer = %buffer.id(), ?state, "Write rejected: channel is not open");
                buffer.release();
                completion.complete(Err(ChannelError::closed("write after end of stream")));
            },
        }
    }

    /// Waits until a write would not exceed capacity.
    ///
    /// # Errors
    /// Returns [`ChannelError::ChannelClosed`] once the channel stops accepting writes.
    pub async fn ready(&self) -> Result<(), ChannelError> {
        loop {
            let mut notified = pin!(self.inner.space_notify.notified());
            notified.as_mut().enable();
            if self.has_space()? {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Blocking counterpart of [`ready`](Self::ready). Returns `false` on timeout.
    ///
    /// # Errors
    /// Returns [`ChannelError::ChannelClosed`] once the channel stops accepting writes.
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut shared = self.inner.shared.lock();
        loop {
            if shared.state != ChannelState::Open {
                return Err(ChannelError::closed("channel stopped accepting writes"));
            }
            if shared.pending.len() < self.inner.capacity {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.space.wait_until(&mut shared, deadline).timed_out() {
                        return Ok(shared.state == ChannelState::Open
                            && shared.pending.len() < self.inner.capacity);
                    }
                },
                None => self.inner.space.wait(&mut shared),
            }
        }
    }

    fn has_space(&self) -> Result<bool, ChannelError> {
        let shared = self.inner.shared.lock();
        if shared.state != ChannelState::Open {
            return Err(ChannelError::closed("channel stopped accepting writes"));
        }
        Ok(shared.pending.len() < self.inner.capacity)
    }

    /// Takes the oldest pending transfer, waiting at most `timeout`.
    ///
    /// The returned buffer is a handle the caller owns and must consume or release. The transfer
    /// moves to the awaiting-acknowledgment queue.
    ///
    /// # Errors
    /// Returns [`ChannelError::ChannelClosed`] if the channel is closed.
    pub fn take(&self, timeout: Duration) -> Result<Taken, ChannelError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut shared = self.inner.shared.lock();
        loop {
            if shared.state == ChannelState::Closed {
                return Err(ChannelError::closed("take on closed channel"));
            }
            if let Some(transfer) = shared.pending.pop_front() {
                let handle = transfer.buffer.retain();
                shared.awaiting.push_back(transfer);
                drop(shared);

                trace!(buffer = %handle.id(), len = handle.readable_bytes(), "Transfer taken");
                self.inner.space.notify_one();
                self.inner.space_notify.notify_waiters();
                return Ok(Taken::Buffer(handle));
            }
            if shared.state == ChannelState::Finished {
                return Ok(Taken::Finished);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.available.wait_until(&mut shared, deadline).timed_out()
                        && shared.state == ChannelState::Open
                        && shared.pending.is_empty()
                    {
                        return Ok(Taken::Timeout);
                    }
                },
                None => self.inner.available.wait(&mut shared),
            }
        }
    }

    /// Completes the oldest taken transfer and releases the channel's handle to its buffer.
    ///
    /// `failure` of `None` resolves the producer's future with the bytes written. Returns `false`
    /// if nothing was awaiting acknowledgment (for example after [`close`](Self::close)).
    pub fn acknowledge(&self, failure: Option<TransferFailure>) -> bool {
        let Some(transfer) = self.inner.shared.lock().awaiting.pop_front() else {
            return false;
        };
        let PendingTransfer { buffer, len, completion } = transfer;

        trace!(buffer = %buffer.id(), len, failed = failure.is_some(), "Transfer acknowledged");
        buffer.release();
        completion.complete(failure.map_or(Ok(len), |failure| Err(failure.into())));
        true
    }

    /// Marks the end of the stream. Pending transfers are still delivered.
    pub fn finish(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != ChannelState::Open {
                return;
            }
            shared.state = ChannelState::Finished;
        }
        debug!("Channel finished");
        self.wake_all();
    }

    /// Closes the channel, failing and releasing every pending and awaiting transfer.
    ///
    /// Both queues are drained under one lock acquisition, so no transfer can slip between them.
    /// Returns the number of transfers drained; a second call returns `0`.
    pub fn close(&self) -> usize {
        let drained: Vec<PendingTransfer> = {
            let mut shared = self.inner.shared.lock();
            if shared.state == ChannelState::Closed {
                return 0;
            }
            shared.state = ChannelState::Closed;
            let shared = &mut *shared;
            shared.pending.drain(..).chain(shared.awaiting.drain(..)).collect()
        };
        self.wake_all();

        let count = drained.len();
        fail_all(drained, "channel closed");
        debug!(drained = count, "Channel closed");
        count
    }

    fn wake_all(&self) {
        self.inner.available.notify_all();
        self.inner.space.notify_all();
        self.inner.space_notify.notify_waiters();
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Transfers written but not yet taken.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    /// Transfers taken but not yet acknowledged.
    #[must_use]
    pub fn awaiting(&self) -> usize {
        self.inner.shared.lock().awaiting.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

fn fail_all(transfers: Vec<PendingTransfer>, reason: &'static str) {
    for PendingTransfer { buffer, completion, .. } in transfers {
        buffer.release();
        completion.complete(Err(ChannelError::closed(reason)));
    }
}
