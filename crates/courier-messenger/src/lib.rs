//! Reliable, chunked message delivery over UDP.
//!
//! A [`Messenger`] splits each buffer into numbered chunks, sends them as
//! datagrams and reassembles what it receives. The receiver detects a
//! stalled message with an inactivity timer and asks the sender for the
//! exact chunks it lacks.

pub mod config;
pub mod error;
pub mod event;
pub mod inbound;
pub mod messenger;
pub mod outbound;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::MessengerConfig;
pub use error::MessengerError;
pub use event::MessengerEvent;
pub use inbound::{Failure, InboundMessage, Received};
pub use messenger::Messenger;
pub use outbound::OutboundMessage;
pub use transport::Transport;

pub use courier_core::{ChunkRecord, MessageId};
