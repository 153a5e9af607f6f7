use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use courier_core::{ChunkRecord, MessageId};
use courier_messenger::{MessengerEvent, Transport};

use crate::*;

// ── Fault injection ───────────────────────────────────────────────────────────

/// UDP socket that silently loses the first data record it sends for each
/// listed chunk index, and counts data records sent per index.
struct LossyTransport {
    socket: UdpSocket,
    lose_once: Mutex<HashSet<u32>>,
    sent: Mutex<HashMap<u32, usize>>,
}

impl LossyTransport {
    async fn bind(lose_once: &[u32]) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            socket: UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?,
            lose_once: Mutex::new(lose_once.iter().copied().collect()),
            sent: Mutex::new(HashMap::new()),
        }))
    }

    fn sent_count(&self, index: u32) -> usize {
        self.sent.lock().unwrap().get(&index).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for LossyTransport {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        if let Ok(record) = ChunkRecord::decode(datagram) {
            if !record.is_retry() {
                *self.sent.lock().unwrap().entry(record.index).or_default() += 1;
                if self.lose_once.lock().unwrap().remove(&record.index) {
                    return Ok(());
                }
            }
        }
        self.socket.send_to(datagram, target).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Retry handshake
// ══════════════════════════════════════════════════════════════════════════════

/// Chunk 1 of 3 is lost. The receiver stalls, requests exactly chunk 1,
/// and completes once it arrives.
#[tokio::test]
async fn test_lost_chunk_is_recovered() -> Result<()> {
    let lossy = LossyTransport::bind(&[1]).await?;
    let (mut a, mut a_events) = Messenger::new(loopback_config());
    a.listen_on(lossy.clone())?;
    let (_b, mut b_events, b_addr) = start(loopback_config()).await?;
    let data = pattern(1200);

    a.send(data.clone(), b_addr)?;
    wait_for(&mut a_events, "sent", |e| matches!(e, MessengerEvent::Sent { .. })).await?;

    let failure = wait_for(&mut b_events, "failure", |e| {
        matches!(e, MessengerEvent::Failure { .. } | MessengerEvent::Message(_))
    })
    .await?;
    assert!(
        matches!(failure, MessengerEvent::Failure { .. }),
        "message completed despite the lost chunk"
    );

    match wait_for(&mut b_events, "message", |e| matches!(e, MessengerEvent::Message(_))).await? {
        MessengerEvent::Message(message) => assert_eq!(message, data),
        _ => unreachable!(),
    }

    assert_eq!(lossy.sent_count(0), 1, "chunk 0 resent");
    assert_eq!(lossy.sent_count(1), 2, "chunk 1 not resent exactly once");
    assert_eq!(lossy.sent_count(2), 1, "chunk 2 resent");
    Ok(())
}

/// Several chunks lost in one burst are all requested in one round.
#[tokio::test]
async fn test_several_lost_chunks_recovered() -> Result<()> {
    let lossy = LossyTransport::bind(&[0, 3, 4]).await?;
    let (mut a, _a_events) = Messenger::new(loopback_config());
    a.listen_on(lossy.clone())?;
    let (_b, mut b_events, b_addr) = start(loopback_config()).await?;
    let data = pattern(486 * 6);

    a.send(data.clone(), b_addr)?;

    match wait_for(&mut b_events, "message", |e| matches!(e, MessengerEvent::Message(_))).await? {
        MessengerEvent::Message(message) => assert_eq!(message, data),
        _ => unreachable!(),
    }
    for index in [0, 3, 4] {
        assert_eq!(lossy.sent_count(index), 2, "chunk {index}");
    }
    Ok(())
}

#[tokio::test]
async fn test_retry_for_unknown_message_is_dropped() -> Result<()> {
    let (_b, mut b_events, b_addr) = start(loopback_config()).await?;
    let raw = raw_socket().await?;
    let id = MessageId::from_bytes(*b"unknown!");

    raw.send_to(&ChunkRecord::retry(id, 0, 1).encode()?, b_addr)
        .await?;

    match next_event(&mut b_events).await? {
        MessengerEvent::Dropped { message_id } => assert_eq!(message_id, id),
        other => bail!("expected Dropped, got {other:?}"),
    }
    Ok(())
}

/// A sent message is served for retries during its retention period and
/// forgotten after it.
#[tokio::test]
async fn test_sent_message_forgotten_after_retention() -> Result<()> {
    let (a, mut a_events, a_addr) = start(loopback_config()).await?;
    let raw = raw_socket().await?;
    let raw_addr = raw.local_addr()?;

    a.send(pattern(1200), raw_addr)?;
    let MessengerEvent::Sent { message_id } =
        wait_for(&mut a_events, "sent", |e| matches!(e, MessengerEvent::Sent { .. })).await?
    else {
        unreachable!()
    };

    // Inside retention: exactly the requested chunk comes back.
    let mut buf = vec![0u8; 2048];
    for _ in 0..3 {
        raw.recv_from(&mut buf).await?;
    }
    raw.send_to(&ChunkRecord::retry(message_id, 2, 3).encode()?, a_addr)
        .await?;
    let (len, _) = tokio::time::timeout(EVENT_DEADLINE, raw.recv_from(&mut buf)).await??;
    let resent = ChunkRecord::decode(&buf[..len])?;
    assert_eq!(resent.message_id, message_id);
    assert_eq!(resent.index, 2);
    assert_eq!(resent.payload.map(|p| p.len()), Some(1200 - 2 * 486));

    tokio::time::sleep(INACTIVITY + GRACE + Duration::from_millis(200)).await;

    raw.send_to(&ChunkRecord::retry(message_id, 0, 3).encode()?, a_addr)
        .await?;
    match wait_for(&mut a_events, "dropped", |e| matches!(e, MessengerEvent::Dropped { .. })).await? {
        MessengerEvent::Dropped { message_id: dropped } => assert_eq!(dropped, message_id),
        _ => unreachable!(),
    }
    Ok(())
}
