//! # Pipeline Errors
//!
//! [`PipelineError`] is the single error type an operation resolves with. Component errors
//! ([`ChannelError`], [`CryptoError`], [`BufferError`]) are classified into it.

use std::borrow::Cow;
use std::convert::Infallible;
use stratum_buffer::BufferError;
use stratum_channel::ChannelError;
use stratum_crypto::CryptoError;

/// A specialized [`PipelineError`] enum for upload and download operations.
#[stratum_derive::stratum_error]
pub enum PipelineError {
    /// A network call failed in a way that may succeed on a fresh attempt.
    #[error("Transient I/O error{}: {message}", format_context(.context))]
    TransientIo { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// Bytes did not match their checksum.
    #[error("Data integrity error{}: {message}", format_context(.context))]
    DataIntegrity { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// Compress, encrypt, decrypt, decompress or filter failed.
    #[error("Transform error{}: {message}", format_context(.context))]
    Transform { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The input channel was closed under the operation.
    #[error("Channel closed{}: {message}", format_context(.context))]
    ChannelClosed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The caller cancelled the operation.
    #[error("Operation cancelled{}: {message}", format_context(.context))]
    Cancelled { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The operation deadline elapsed.
    #[error("Operation timed out{}: {message}", format_context(.context))]
    Timeout { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The requested byte range lies outside the blob.
    #[error("Invalid range{}: {message}", format_context(.context))]
    InvalidRange { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// A chunk the operation needs does not exist.
    #[error("Chunk not found{}: {message}", format_context(.context))]
    NotFound { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The blob manifest could not be encoded or decoded.
    #[error("Manifest error{}: {source}", format_context(.context))]
    Manifest { source: postcard::Error, context: Option<Cow<'static, str>> },

    /// Configuration sources could not be read or deserialized.
    #[error("Config error{}: {source}", format_context(.context))]
    Config { source: config::ConfigError, context: Option<Cow<'static, str>> },

    /// Configuration values are out of range or inconsistent.
    #[error("Invalid configuration{}: {message}", format_context(.context))]
    InvalidConfiguration { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The download sink refused a chunk.
    #[error("Delivery error{}: {message}", format_context(.context))]
    Delivery { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Internal pipeline error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl PipelineError {
    /// `true` for failures that a send may be resubmitted after.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::DataIntegrity { .. })
    }

    pub(crate) fn transform(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Transform { message: message.into(), context: None }
    }

    pub(crate) fn integrity(message: impl Into<Cow<'static, str>>) -> Self {
        Self::DataIntegrity { message: message.into(), context: None }
    }

    pub(crate) fn cancelled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Cancelled { message: message.into(), context: None }
    }

    pub(crate) fn timeout() -> Self {
        Self::Timeout { message: "operation deadline passed".into(), context: None }
    }

    /// Attaches `context` to an error that is not wrapped in a `Result`.
    pub(crate) fn within(self, context: impl Into<Cow<'static, str>>) -> Self {
        match Err::<Infallible, Self>(self).context(context) {
            Ok(never) => match never {},
            Err(err) => err,
        }
    }
}

impl From<ChannelError> for PipelineError {
    fn from(err: ChannelError) -> Self {
        if err.is_closed() {
            Self::ChannelClosed { message: err.to_string().into(), context: None }
        } else {
            Self::Delivery { message: err.to_string().into(), context: None }
        }
    }
}

impl From<CryptoError> for PipelineError {
    fn from(err: CryptoError) -> Self {
        let context = Some(Cow::Borrowed(err.kind()));
        match err {
            CryptoError::Aborted { message, .. } => Self::Cancelled { message, context },
            CryptoError::InvalidConfiguration { message, .. } => {
                Self::InvalidConfiguration { message, context }
            },
            other => Self::Transform { message: other.to_string().into(), context },
        }
    }
}

impl From<BufferError> for PipelineError {
    fn from(err: BufferError) -> Self {
        Self::Transform { message: err.to_string().into(), context: Some("buffer".into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(PipelineError::integrity("bad").is_retryable());
        assert!(
            PipelineError::TransientIo { message: "reset".into(), context: None }.is_retryable()
        );
        assert!(!PipelineError::transform("lz4").is_retryable());
    }

    #[test]
    fn test_crypto_abort_maps_to_cancelled() {
        let err: PipelineError =
            CryptoError::Aborted { message: "shut down".into(), context: None }.into();
        assert_eq!(err.kind(), "Cancelled");

        let err: PipelineError =
            CryptoError::Decryption { message: "tag".into(), context: None }.into();
        assert_eq!(err.kind(), "Transform");
    }

    #[test]
    fn test_context_is_rendered() {
        let result: Result<(), PipelineError> = Err(PipelineError::transform("short read"));
        let err = result.context("chunk 3").unwrap_err();
        assert_eq!(err.to_string(), "Transform error (chunk 3): short read");
        assert_eq!(
            PipelineError::timeout().within("upload").to_string(),
            "Operation timed out (upload): operation deadline passed"
        );
    }
}
