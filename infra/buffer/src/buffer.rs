//! Owning buffer handles.
//!
//! [`Buffer`] is the unit of ownership for the whole data path. It is deliberately not `Clone`:
//! the only way to get a second owner is [`Buffer::retain`] (or a slice), and the only ways to give
//! one up are [`Buffer::release`] or dropping the handle. A released handle no longer exists, so
//! a double release or a read after release does not compile.

use crate::error::BufferError;
use crate::pool::{BufferId, HandleToken, Ledger, Storage};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A frozen, shareable view over reference-counted storage.
pub struct Buffer {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
    token: HandleToken,
}

impl Buffer {
    /// Creates another owning handle over the same bytes, incrementing the count.
    #[must_use = "a retained handle must be released or handed to the next owner"]
    pub fn retain(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            offset: self.offset,
            len: self.len,
            token: HandleToken::acquire(&self.storage.ledger),
        }
    }

    /// Creates an owning handle over `len` bytes starting at `start` of this view.
    ///
    /// The slice shares this buffer's count; it is a retain.
    ///
    /// # Errors
    /// Returns [`BufferError::OutOfBounds`] if the range does not fit in the readable bytes.
    pub fn slice(&self, start: usize, len: usize) -> Result<Self, BufferError> {
        let end = start.checked_add(len).filter(|end| *end <= self.len).ok_or_else(|| {
            BufferError::OutOfBounds {
                message: format!("slice {start}+{len} of {} readable bytes", self.len).into(),
                context: Some(self.storage.id.to_string().into()),
            }
        })?;

        Ok(Self {
            storage: Arc::clone(&self.storage),
            offset: self.offset + start,
            len: end - start,
            token: HandleToken::acquire(&self.storage.ledger),
        })
    }

    /// Splits off the first `at` readable bytes as a retained slice and advances this handle.
    ///
    /// # Errors
    /// Returns [`BufferError::OutOfBounds`] if `at` exceeds the readable bytes.
    pub fn split_to(&mut self, at: usize) -> Result<Self, BufferError> {
        let head = self.slice(0, at)?;
        self.offset += at;
        self.len -= at;
        Ok(head)
    }

    /// Gives up this handle. Returns `true` if it was the last one and the storage was freed.
    pub fn release(self) -> bool {
        let Self { storage, token, .. } = self;
        drop(token);
        Arc::into_inner(storage).map(drop).is_some()
    }

    #[must_use]
    pub const fn readable_bytes(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live handles sharing this buffer's storage.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    #[must_use]
    pub fn id(&self) -> BufferId {
        self.storage.id
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage.bytes[self.offset..self.offset + self.len]
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.storage.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A uniquely owned, writable allocation.
///
/// Transforms build their output here and [`freeze`](BufferMut::freeze) it once complete. An
/// unfrozen buffer that is dropped on an error path frees its allocation immediately.
#[derive(Debug)]
pub struct BufferMut {
    storage: Storage,
    token: HandleToken,
}

impl BufferMut {
    pub(crate) fn new(storage: Storage, ledger: &Arc<Ledger>) -> Self {
        Self { storage, token: HandleToken::acquire(ledger) }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.storage.bytes.extend_from_slice(bytes);
    }

    /// Resizes the written region, filling new bytes with `value`.
    pub fn resize(&mut self, len: usize, value: u8) {
        self.storage.bytes.resize(len, value);
    }

    pub fn truncate(&mut self, len: usize) {
        self.storage.bytes.truncate(len);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.bytes.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.bytes.capacity()
    }

    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.storage.id
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage.bytes
    }

    /// Converts into a shareable [`Buffer`] without copying. The handle is carried over.
    #[must_use]
    pub fn freeze(self) -> Buffer {
        let Self { storage, token } = self;
        let len = storage.bytes.len();
        Buffer { storage: Arc::new(storage), offset: 0, len, token }
    }
}

impl Deref for BufferMut {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.storage.bytes
    }
}

impl std::io::Write for BufferMut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
