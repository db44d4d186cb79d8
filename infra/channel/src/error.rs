use std::borrow::Cow;

/// Errors reported by a [`ChunkTransferChannel`](crate::ChunkTransferChannel) and its futures.
#[stratum_derive::stratum_error]
#[derive(Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed or finished before the transfer could complete.
    #[error("Channel closed{}: {message}", format_context(.context))]
    ChannelClosed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The consumer acknowledged the transfer with a failure.
    #[error("Transfer rejected{}: {message}", format_context(.context))]
    Rejected { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// Capacity must be greater than zero.
    #[error("Invalid capacity{}: {message}", format_context(.context))]
    InvalidCapacity { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Internal channel error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl ChannelError {
    pub(crate) fn closed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::ChannelClosed { message: message.into(), context: None }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. })
    }
}
