//! Inbound messages — reassembly and inactivity detection.
//!
//! An inbound message learns its identifier and declared length from the
//! first record it accepts. Every accepted chunk restarts the inactivity
//! timer; when the timer fires the message's identifier is pushed onto the
//! stall channel and the owner calls [`InboundMessage::check_stalled`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use courier_core::{ChunkRecord, MessageId};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::validate_timeout;
use crate::MessengerError;

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub message_id: MessageId,
    pub message: Bytes,
}

/// An incomplete message that went quiet, with the exact chunks it lacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message_id: MessageId,
    pub origin: SocketAddr,
    pub length: u32,
    /// Sorted ascending.
    pub missing: Vec<u32>,
}

#[derive(Debug)]
pub struct InboundMessage {
    origin: SocketAddr,
    inactivity_timeout: Duration,
    id: Option<MessageId>,
    length: u32,
    // Sparse: only indices that arrived. Iterates in index order.
    chunks: BTreeMap<u32, Bytes>,
    last_received: Option<Instant>,
    complete: bool,
    failure_rounds: u8,
    timer: Option<AbortHandle>,
    stall_tx: mpsc::UnboundedSender<MessageId>,
}

impl InboundMessage {
    /// Empty reassembly state. `stall_tx` receives the identifier each time
    /// the inactivity timer fires.
    pub fn new(
        origin: SocketAddr,
        inactivity_timeout: Duration,
        stall_tx: mpsc::UnboundedSender<MessageId>,
    ) -> Result<Self, MessengerError> {
        validate_timeout(inactivity_timeout)?;
        Ok(Self {
            origin,
            inactivity_timeout,
            id: None,
            length: 0,
            chunks: BTreeMap::new(),
            last_received: None,
            complete: false,
            failure_rounds: 0,
            timer: None,
            stall_tx,
        })
    }

    /// Identifier, once the first record arrived.
    pub fn id(&self) -> Option<MessageId> {
        self.id
    }

    pub fn origin(&self) -> SocketAddr {
        self.origin
    }

    /// Declared chunk count, 0 before the first record.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Distinct chunks stored so far.
    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn failure_rounds(&self) -> u8 {
        self.failure_rounds
    }

    /// Store one payload-bearing record.
    ///
    /// Returns the assembled message when this record completes it. Records
    /// arriving after completion are ignored. A record belonging to another
    /// message, a retry record, or an index beyond the declared length is
    /// rejected without touching any state.
    pub fn accept(&mut self, record: ChunkRecord) -> Result<Option<Received>, MessengerError> {
        if let Some(expected) = self.id {
            if expected != record.message_id {
                return Err(MessengerError::IdMismatch {
                    expected,
                    got: record.message_id,
                });
            }
        }
        let length = self.id.map_or(record.length, |_| self.length);
        if record.index >= length {
            return Err(MessengerError::IndexOutOfRange {
                index: record.index,
                length,
            });
        }
        let Some(payload) = record.payload else {
            return Err(MessengerError::invalid("retry record fed to reassembly"));
        };

        if self.complete {
            tracing::trace!(
                message_id = %record.message_id,
                index = record.index,
                "chunk for completed message ignored"
            );
            return Ok(None);
        }

        self.cancel_timer();
        let id = *self.id.get_or_insert(record.message_id);
        self.length = length;

        // Last write wins for a repeated index.
        if self.chunks.insert(record.index, payload).is_some() {
            tracing::trace!(message_id = %id, index = record.index, "duplicate chunk");
        }
        self.last_received = Some(Instant::now());

        if self.received() < self.length {
            self.arm_timer();
            return Ok(None);
        }

        self.complete = true;
        let total = self.chunks.values().map(Bytes::len).sum();
        let mut message = BytesMut::with_capacity(total);
        for chunk in self.chunks.values() {
            message.extend_from_slice(chunk);
        }
        self.chunks.clear();

        tracing::debug!(message_id = %id, bytes = total, chunks = length, "message reassembled");
        Ok(Some(Received {
            message_id: id,
            message: message.freeze(),
        }))
    }

    /// Called when the inactivity timer fired. A firing that was superseded
    /// by a later chunk finds less than a full timeout of silence and yields
    /// nothing.
    pub fn check_stalled(&self, now: Instant) -> Option<Failure> {
        let (Some(message_id), Some(last)) = (self.id, self.last_received) else {
            return None;
        };
        if self.complete || now.saturating_duration_since(last) < self.inactivity_timeout {
            return None;
        }

        let missing = (0..self.length)
            .filter(|index| !self.chunks.contains_key(index))
            .collect();

        Some(Failure {
            message_id,
            origin: self.origin,
            length: self.length,
            missing,
        })
    }

    /// Count a reported failure and give the retransmissions one more
    /// timeout to arrive.
    pub fn record_failure(&mut self) {
        self.failure_rounds = self.failure_rounds.saturating_add(1);
        self.last_received = Some(Instant::now());
        self.arm_timer();
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();
        let Some(id) = self.id else {
            return;
        };
        let stall_tx = self.stall_tx.clone();
        let timeout = self.inactivity_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = stall_tx.send(id);
        });
        self.timer = Some(handle.abort_handle());
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for InboundMessage {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
