//! # Chunk transfer channel
//!
//! Bounded hand-off between a thread producing stream buffers and the thread that cuts them into
//! chunks.
//!
//! Ownership rules:
//! * [`ChunkTransferChannel::write`] moves the buffer into the channel. A write after
//!   [`finish`](ChunkTransferChannel::finish) or [`close`](ChunkTransferChannel::close) releases
//!   the buffer on the spot and fails the transfer.
//! * [`ChunkTransferChannel::take`] gives the consumer a handle it must consume or release.
//! * [`ChunkTransferChannel::acknowledge`] completes the oldest taken transfer and releases the
//!   channel's handle.
//! * [`ChunkTransferChannel::close`] fails and releases everything still pending or awaiting.

mod channel;
mod error;
mod future;
mod sink;

pub use channel::{ChannelState, ChunkTransferChannel, DEFAULT_CAPACITY, Taken, TransferFailure};
pub use error::{ChannelError, ChannelErrorExt};
pub use future::{TransferFuture, TransferResult};
pub use sink::ChunkSink;
