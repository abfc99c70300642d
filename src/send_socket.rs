use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a single datagram, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// Unlike the receive side, the send side is shared freely: on the server,
///  every transfer task sends through the same socket concurrently while only
///  the dispatch loop ever reads it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }
}
