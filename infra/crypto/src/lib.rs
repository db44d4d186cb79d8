//! # Crypto jobs
//!
//! Asynchronous single-buffer-in, single-buffer-out transforms for the chunk data path.
//!
//! * [`CryptoJobExecutor`] is a fixed worker pool. Submitting never blocks; a job's callback runs
//!   on the worker that finished it.
//! * A [`CryptoJob`] owns its input buffer until it runs or is closed, and releases it on every
//!   path.
//! * A [`JobResult`] owns the freshly allocated output until the receiver calls
//!   [`JobResult::extract`] or [`JobResult::discard`].
//! * [`ChunkCipher`] provides the default AEAD transforms ([`Encrypt`], [`Decrypt`]).
//!
//! ## Payload Format
//!
//! ```text
//! [V(1)][FLAGS(1)][NONCE(12)][CIPHERTEXT(N)][TAG(16)]
//! ```
//!
//! ## Nonce Policy
//!
//! Every seal uses a **random 96-bit nonce**. This is standard for `AES-GCM` and
//! `ChaCha20Poly1305` but probabilistic; rotate keys for very high chunk volumes.

mod builder;
mod cipher;
mod error;
mod executor;
mod job;

pub use builder::ChunkCipherBuilder;
pub use cipher::{
    Aes, ChaCha, ChunkAead, ChunkCipher, HEADER_LEN, NONCE_LEN, OVERHEAD, PAYLOAD_VERSION_V1,
    TAG_LEN,
};
pub use error::{CryptoError, CryptoErrorExt};
pub use executor::{CryptoJobExecutor, ExecutorStats};
pub use job::{CryptoJob, CryptoTransform, Decrypt, Encrypt, JobCallback, JobResult};
