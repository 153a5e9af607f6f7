//! In-memory transport for unit tests.

use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use courier_core::ChunkRecord;
use tokio::sync::{mpsc, Mutex};

use crate::Transport;

pub(crate) type Datagram = (Vec<u8>, SocketAddr);

pub(crate) struct MemoryTransport {
    local: SocketAddr,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    outbox: mpsc::UnboundedSender<Datagram>,
    // Sends whose sequence number falls in this range fail.
    failing: Option<Range<usize>>,
    sends: AtomicUsize,
}

/// Test side of a [`MemoryTransport`].
pub(crate) struct Wire {
    pub inject: mpsc::UnboundedSender<Datagram>,
    pub sent: mpsc::UnboundedReceiver<Datagram>,
}

impl Wire {
    /// Next datagram the transport sent, decoded.
    pub async fn next_record(&mut self) -> (ChunkRecord, SocketAddr) {
        let (bytes, target) = self.sent.recv().await.expect("transport dropped");
        (ChunkRecord::decode(&bytes).expect("sent record decodes"), target)
    }

    pub fn deliver(&self, record: &ChunkRecord, from: SocketAddr) {
        self.inject
            .send((record.encode().unwrap(), from))
            .expect("transport dropped");
    }
}

pub(crate) fn memory_transport(local: SocketAddr) -> (MemoryTransport, Wire) {
    build(local, None)
}

/// Transport whose sends fail once `limit` of them succeeded.
pub(crate) fn failing_transport(local: SocketAddr, limit: usize) -> (MemoryTransport, Wire) {
    build(local, Some(limit..usize::MAX))
}

/// Transport whose sends numbered within `failing` (counting from 0) fail
/// and all others succeed.
pub(crate) fn flaky_transport(local: SocketAddr, failing: Range<usize>) -> (MemoryTransport, Wire) {
    build(local, Some(failing))
}

fn build(local: SocketAddr, failing: Option<Range<usize>>) -> (MemoryTransport, Wire) {
    let (inject, inbox) = mpsc::unbounded_channel();
    let (outbox, sent) = mpsc::unbounded_channel();
    let transport = MemoryTransport {
        local,
        inbox: Mutex::new(inbox),
        outbox,
        failing,
        sends: AtomicUsize::new(0),
    };
    (transport, Wire { inject, sent })
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if self.failing.as_ref().is_some_and(|range| range.contains(&n)) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        let _ = self.outbox.send((datagram.to_vec(), target));
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((datagram, from)) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok((datagram.len(), from))
            }
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}
