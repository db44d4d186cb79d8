//! # Crypto Errors
//!
//! [`CryptoError`] covers cipher construction, AEAD failures and job lifecycle outcomes.

use std::borrow::Cow;

/// A specialized [`CryptoError`] enum for chunk transforms and the job executor.
#[stratum_derive::stratum_error]
pub enum CryptoError {
    /// Failure during the encryption process.
    #[error("Encryption error{}: {message}", format_context(.context))]
    Encryption { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// Failure during the decryption process.
    ///
    /// Usually a wrong key, mismatched associated data or tampered bytes.
    #[error("Decryption error{}: {message}", format_context(.context))]
    Decryption { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The payload is malformed or too short.
    #[error("Invalid payload{}: {message}", format_context(.context))]
    InvalidPayload { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The cipher or executor is incorrectly configured.
    #[error("Invalid configuration{}: {message}", format_context(.context))]
    InvalidConfiguration { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The job was closed before it ran.
    #[error("Job aborted{}: {message}", format_context(.context))]
    Aborted { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// A worker thread could not be started.
    #[error("Worker spawn error{}: {source}", format_context(.context))]
    Spawn { source: std::io::Error, context: Option<Cow<'static, str>> },

    #[error("Internal crypto error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl CryptoError {
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}
