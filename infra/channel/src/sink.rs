use crate::channel::ChunkTransferChannel;
use crate::error::ChannelError;
use std::time::{Duration, Instant};
use stratum_buffer::Buffer;

/// Destination for reassembled chunks, delivered in order.
///
/// `deliver` takes the buffer by value. A sink that fails owns what it was given and must have
/// released it by the time the error is returned.
pub trait ChunkSink: Send + Sync {
    /// Accepts the bytes of chunk `index`. A sink that applies backpressure may block, but not
    /// past `deadline`.
    ///
    /// # Errors
    /// Returns an error if the sink can no longer accept data, or stays full until `deadline`.
    fn deliver(
        &self,
        index: u32,
        buffer: Buffer,
        deadline: Option<Instant>,
    ) -> Result<(), ChannelError>;

    /// Called once after the last chunk was delivered.
    fn end_of_stream(&self) {}

    /// Called once when the download fails, possibly while `deliver` is blocked on another thread.
    fn abort(&self) {}
}

/// Delivery waits for a free slot, so at most `capacity` chunks are ever pending. Aborting closes
/// the channel.
impl ChunkSink for ChunkTransferChannel {
    fn deliver(
        &self,
        _index: u32,
        buffer: Buffer,
        deadline: Option<Instant>,
    ) -> Result<(), ChannelError> {
        let timeout = deadline
            .map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(Instant::now()));
        match self.wait_ready(timeout) {
            Ok(true) => {},
            Ok(false) => {
                buffer.release();
                return Err(ChannelError::Rejected {
                    message: "output channel stayed full".into(),
                    context: Some(format!("capacity {}", self.capacity()).into()),
                });
            },
            Err(err) => {
                buffer.release();
                return Err(err);
            },
        }

        let mut transfer = self.write(buffer);
        match transfer.try_result() {
            Some(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn end_of_stream(&self) {
        self.finish();
    }

    fn abort(&self) {
        self.close();
    }
}
