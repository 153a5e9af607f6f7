//! Outbound messages — chunk, transmit serially, retransmit on request.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use courier_core::wire::ENVELOPE_OVERHEAD;
use courier_core::{ChunkRecord, MessageId};

use crate::config::{validate_packet_size, validate_timeout};
use crate::inbound::Failure;
use crate::{MessengerError, Transport};

/// One buffer being sent, split into immutable chunks.
#[derive(Debug)]
pub struct OutboundMessage {
    id: MessageId,
    chunks: Vec<Bytes>,
    inactivity_timeout: Duration,
}

impl OutboundMessage {
    /// Validate, chunk `buffer` into `packet_size - ENVELOPE_OVERHEAD` byte
    /// slices and assign a fresh random identifier.
    pub fn new(
        buffer: Bytes,
        inactivity_timeout: Duration,
        packet_size: usize,
    ) -> Result<Self, MessengerError> {
        Self::with_id(MessageId::random(), buffer, inactivity_timeout, packet_size)
    }

    pub(crate) fn with_id(
        id: MessageId,
        buffer: Bytes,
        inactivity_timeout: Duration,
        packet_size: usize,
    ) -> Result<Self, MessengerError> {
        if buffer.is_empty() {
            return Err(MessengerError::invalid("message buffer is empty"));
        }
        validate_timeout(inactivity_timeout)?;
        validate_packet_size(packet_size)?;

        let capacity = packet_size - ENVELOPE_OVERHEAD;
        let count = buffer.len().div_ceil(capacity);
        if u32::try_from(count).is_err() {
            return Err(MessengerError::invalid(format!(
                "message of {} bytes needs {count} chunks, more than a u32 index allows",
                buffer.len()
            )));
        }

        // Slices share the buffer; no payload bytes are copied.
        let chunks = (0..buffer.len())
            .step_by(capacity)
            .map(|start| buffer.slice(start..buffer.len().min(start + capacity)))
            .collect();

        Ok(Self {
            id,
            chunks,
            inactivity_timeout,
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Number of chunks, as carried in every record's `length` field.
    pub fn chunk_count(&self) -> u32 {
        // Bounded at construction.
        self.chunks.len() as u32
    }

    pub fn chunk(&self, index: u32) -> Option<&Bytes> {
        self.chunks.get(index as usize)
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    fn record(&self, index: u32) -> Result<ChunkRecord, MessengerError> {
        let payload = self
            .chunk(index)
            .ok_or(MessengerError::IndexOutOfRange {
                index,
                length: self.chunk_count(),
            })?
            .clone();
        Ok(ChunkRecord::data(self.id, index, self.chunk_count(), payload))
    }

    /// Send every chunk in index order, one in flight at a time. The first
    /// encode or transport failure aborts the remaining chunks.
    pub async fn transmit(
        &self,
        transport: &dyn Transport,
        target: SocketAddr,
    ) -> Result<(), MessengerError> {
        for index in 0..self.chunk_count() {
            let datagram = self.record(index)?.encode()?;
            transport.send_to(&datagram, target).await?;
            tracing::trace!(message_id = %self.id, index, %target, "chunk sent");
        }

        tracing::debug!(
            message_id = %self.id,
            chunks = self.chunk_count(),
            %target,
            "message transmitted"
        );
        Ok(())
    }

    /// Resend exactly the chunk at `index`.
    pub async fn retransmit_one(
        &self,
        transport: &dyn Transport,
        target: SocketAddr,
        index: u32,
    ) -> Result<(), MessengerError> {
        let datagram = self.record(index)?.encode()?;
        transport.send_to(&datagram, target).await?;

        tracing::debug!(message_id = %self.id, index, %target, "chunk resent");
        Ok(())
    }

    /// Ask the origin of a stalled inbound message to resend each missing
    /// chunk: one empty-payload record per index, sent serially.
    pub async fn send_failure_notice(
        failure: &Failure,
        transport: &dyn Transport,
    ) -> Result<(), MessengerError> {
        for &index in &failure.missing {
            let datagram = ChunkRecord::retry(failure.message_id, index, failure.length).encode()?;
            transport.send_to(&datagram, failure.origin).await?;
        }

        tracing::debug!(
            message_id = %failure.message_id,
            missing = failure.missing.len(),
            origin = %failure.origin,
            "retry requests sent"
        );
        Ok(())
    }
}
