use courier_core::{MessageId, WireError};

/// Everything the messenger can report, synchronously or as an event.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("chunk index {index} outside message of {length} chunks")]
    IndexOutOfRange { index: u32, length: u32 },

    #[error("record for message {got} fed to reassembly of message {expected}")]
    IdMismatch { expected: MessageId, got: MessageId },

    #[error("message {0} is already tracked in the other direction")]
    IdCollision(MessageId),

    #[error("messenger is not listening")]
    NotListening,

    #[error("messenger is already listening")]
    AlreadyListening,

    #[error("messenger is closed")]
    Closed,
}

impl MessengerError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}
