use crate::buffer::Buffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// A buffer slot owned by a long-lived object that several threads may try to tear down.
///
/// Release is guarded by a one-shot flag: whichever caller wins the compare-and-set drops the
/// held handle, every other caller sees `false`. Once released, the slot refuses new buffers.
#[derive(Debug, Default)]
pub struct HeldBuffer {
    slot: Mutex<Option<Buffer>>,
    released: AtomicBool,
}

impl HeldBuffer {
    #[must_use]
    pub fn new(buffer: Buffer) -> Self {
        Self { slot: Mutex::new(Some(buffer)), released: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Stores `buffer`, returning the previously held one.
    ///
    /// # Errors
    /// Hands `buffer` back if the slot was already released.
    pub fn replace(&self, buffer: Buffer) -> Result<Option<Buffer>, Buffer> {
        let mut slot = self.slot.lock();
        if self.released.load(Ordering::Acquire) {
            return Err(buffer);
        }
        Ok(slot.replace(buffer))
    }

    /// Removes the held buffer without marking the slot released.
    pub fn take(&self) -> Option<Buffer> {
        self.slot.lock().take()
    }

    /// Returns a new owning handle over the held buffer.
    #[must_use]
    pub fn retain(&self) -> Option<Buffer> {
        self.slot.lock().as_ref().map(Buffer::retain)
    }

    /// Runs `f` against the held buffer under the slot lock.
    pub fn with<R>(&self, f: impl FnOnce(Option<&Buffer>) -> R) -> R {
        f(self.slot.lock().as_ref())
    }

    /// Releases the held buffer once. Returns `true` only for the caller that won.
    pub fn release(&self) -> bool {
        if self.released.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return false;
        }
        let held = self.slot.lock().take();
        if let Some(buffer) = held {
            trace!(buffer = %buffer.id(), "Held buffer released");
            buffer.release();
        }
        true
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
