#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use stratum_buffer::{Buffer, BufferMut, BufferPool};
use stratum_crypto::*;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[must_use]
pub fn setup_cipher() -> ChunkCipher<ChaCha> {
    ChunkCipher::builder()
        .derived_key("master-secret-123", "unique-salt", "bucket-01")
        .unwrap()
        .build()
        .expect("Cipher setup failed")
}

/// Job whose outcome is forwarded to a channel.
pub fn job(
    input: Buffer,
    transform: Arc<dyn CryptoTransform>,
    aad: &[u8],
) -> (CryptoJob, mpsc::Receiver<Result<JobResult, CryptoError>>) {
    let (tx, rx) = mpsc::channel();
    let job = CryptoJob::new(input, transform, aad.to_vec(), move |result| {
        tx.send(result).ok();
    });
    (job, rx)
}

/// Blocks every worker that picks it up until [`Gate::open`] is called.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.signal.wait(&mut open);
        }
    }
}

#[derive(Debug)]
pub struct GatedCopy(pub Arc<Gate>);

impl CryptoTransform for GatedCopy {
    fn name(&self) -> &'static str {
        "gated-copy"
    }

    fn apply(&self, pool: &BufferPool, input: &Buffer, _: &[u8]) -> Result<BufferMut, CryptoError> {
        self.0.wait();
        let mut out = pool.allocate(input.readable_bytes());
        out.extend_from_slice(input);
        Ok(out)
    }
}

/// Allocates its output, writes half of it, then fails.
#[derive(Debug)]
pub struct FailsAfterAlloc;

impl CryptoTransform for FailsAfterAlloc {
    fn name(&self) -> &'static str {
        "fails-after-alloc"
    }

    fn apply(&self, pool: &BufferPool, input: &Buffer, _: &[u8]) -> Result<BufferMut, CryptoError> {
        let mut out = pool.allocate(input.readable_bytes());
        out.extend_from_slice(&input[..input.readable_bytes() / 2]);
        Err(CryptoError::Encryption { message: "injected failure".into(), context: None })
    }
}
