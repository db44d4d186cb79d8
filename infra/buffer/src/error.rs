use std::borrow::Cow;

/// A specialized [`BufferError`] enum of this crate.
#[stratum_derive::stratum_error]
pub enum BufferError {
    /// A slice or split reached past the readable bytes of a handle.
    #[error("Buffer range out of bounds{}: {message}", format_context(.context))]
    OutOfBounds { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Internal buffer error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}
