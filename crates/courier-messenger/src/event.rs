use std::net::SocketAddr;

use bytes::Bytes;
use courier_core::MessageId;

use crate::MessengerError;

/// Everything a messenger announces to its owner, in the order it happens.
#[derive(Debug)]
pub enum MessengerEvent {
    /// The socket is bound.
    Listening { local_addr: SocketAddr },
    /// A message was fully reassembled.
    Message(Bytes),
    /// A send was chunked and its transmission started.
    Sending { message_id: MessageId },
    /// Every chunk of a message was handed to the transport.
    Sent { message_id: MessageId },
    /// An inbound message stalled and retransmission was requested.
    Failure { message_id: MessageId },
    /// A retry request named a message this messenger no longer knows.
    Dropped { message_id: MessageId },
    Error(MessengerError),
}
