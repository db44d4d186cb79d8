//! # Buffers
//!
//! Move-only, reference-counted byte buffers for the chunk data path.
//!
//! * [`BufferPool`] allocates and owns the ledger that counts every allocation and handle.
//! * [`BufferMut`] is a uniquely owned, writable allocation; [`BufferMut::freeze`] turns it into
//!   a shareable [`Buffer`].
//! * [`Buffer`] handles are never cloned implicitly. Retaining and slicing create new owners,
//!   releasing consumes the handle.
//! * [`HeldBuffer`] guards a buffer owned by an object that may be torn down from more than one
//!   thread.

mod buffer;
mod error;
mod held;
mod pool;

pub use buffer::{Buffer, BufferMut};
pub use error::{BufferError, BufferErrorExt};
pub use held::HeldBuffer;
pub use pool::{BufferId, BufferPool, PoolStats};
