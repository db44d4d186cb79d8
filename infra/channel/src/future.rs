use crate::error::ChannelError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Bytes written, or why the transfer failed.
pub type TransferResult = Result<usize, ChannelError>;

/// How a transfer reports its outcome: a [`TransferFuture`] or a caller-supplied callback.
pub(crate) enum Completion {
    Future(oneshot::Sender<TransferResult>),
    Callback(Box<dyn FnOnce(TransferResult) + Send>),
}

impl Completion {
    /// Fires the completion. Must be called without holding the channel lock.
    pub(crate) fn complete(self, result: TransferResult) {
        match self {
            Self::Future(tx) => {
                // The writer may have dropped its future.
                tx.send(result).ok();
            },
            Self::Callback(callback) => callback(result),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Future(_) => f.write_str("Completion::Future"),
            Self::Callback(_) => f.write_str("Completion::Callback"),
        }
    }
}

/// Resolves to the number of bytes written once the consumer acknowledges the transfer.
///
/// Can be awaited from async code or waited on from a plain thread with [`TransferFuture::wait`].
#[derive(Debug)]
#[must_use = "a transfer future reports whether the chunk was accepted"]
pub struct TransferFuture {
    rx: oneshot::Receiver<TransferResult>,
}

impl TransferFuture {
    pub(crate) fn pair() -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        (Completion::Future(tx), Self { rx })
    }

    /// Blocks the current thread until the transfer completes.
    ///
    /// Must not be called from within an async runtime.
    ///
    /// # Errors
    /// Returns the failure the transfer completed with.
    pub fn wait(self) -> TransferResult {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Returns the outcome if the transfer already completed.
    pub fn try_result(&mut self) -> Option<TransferResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl Future for TransferFuture {
    type Output = TransferResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> ChannelError {
    ChannelError::closed("transfer dropped without completion")
}
