#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use stratum_buffer::{Buffer, BufferPool};
use stratum_channel::TransferResult;

pub const CHUNK: &[u8] = b"0123456789abcdef";

pub fn buffers(pool: &BufferPool, count: usize) -> Vec<Buffer> {
    (0..count).map(|i| pool.from_vec(vec![u8::try_from(i % 251).unwrap_or(0); 32])).collect()
}

/// Counts callback outcomes.
#[derive(Debug, Default, Clone)]
pub struct Outcomes {
    pub ok: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    pub rejected: Arc<AtomicUsize>,
}

impl Outcomes {
    pub fn callback(&self) -> impl FnOnce(TransferResult) + Send + 'static {
        let outcomes = self.clone();
        move |result| {
            let counter = match result {
                Ok(_) => &outcomes.ok,
                Err(err) if err.is_closed() => &outcomes.closed,
                Err(_) => &outcomes.rejected,
            };
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn totals(&self) -> (usize, usize, usize) {
        (
            self.ok.load(Ordering::SeqCst),
            self.closed.load(Ordering::SeqCst),
            self.rejected.load(Ordering::SeqCst),
        )
    }
}
