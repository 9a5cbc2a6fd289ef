use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        self.send_to(packet_buf, to).await
            .map(|_| ())
            .inspect_err(|e| error!("error sending UDP packet to {:?}: {}", to, e))
            .with_context(|| format!("sending UDP packet to {:?}", to))
    }
}
