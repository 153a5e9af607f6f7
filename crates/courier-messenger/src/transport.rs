//! Datagram transport seam.
//!
//! The messenger only needs send/receive of whole datagrams. Production code
//! uses `tokio::net::UdpSocket`; tests wrap it to inject loss.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram. Completes once the OS accepted the whole datagram.
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()>;

    /// Receive one datagram. Must be cancel safe.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        let sent = UdpSocket::send_to(self, datagram, target).await?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: {sent} of {} bytes sent", datagram.len()),
            ));
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
