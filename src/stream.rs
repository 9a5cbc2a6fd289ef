use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use crate::config::LinkConfig;
use crate::connection::{Connection, Listener};
use crate::network_layer::NetworkLayer;

enum Inbound {
    Data(Bytes),
    End,
    Failed(String),
}

/// Bridges the engine's callbacks to the stream: delivered payload is queued for reading,
///  and the production state is published for writers to wait on
struct StreamNetworkLayer {
    inbound: mpsc::UnboundedSender<Inbound>,
    production_paused: watch::Sender<bool>,
}

impl StreamNetworkLayer {
    fn new() -> (StreamNetworkLayer, mpsc::UnboundedReceiver<Inbound>, watch::Receiver<bool>) {
        let (inbound, inbound_receiver) = mpsc::unbounded_channel();
        let (production_paused, paused_receiver) = watch::channel(false);
        (StreamNetworkLayer { inbound, production_paused }, inbound_receiver, paused_receiver)
    }

    fn enqueue(&self, inbound: Inbound) {
        if self.inbound.send(inbound).is_err() {
            trace!("stream was dropped - discarding inbound data");
        }
    }
}

impl NetworkLayer for StreamNetworkLayer {
    fn deliver(&self, payload: Bytes) {
        self.enqueue(Inbound::Data(payload));
    }

    fn end_of_stream(&self) {
        self.enqueue(Inbound::End);
    }

    fn pause_production(&self) {
        self.production_paused.send_replace(true);
    }

    fn resume_production(&self) {
        self.production_paused.send_replace(false);
    }

    fn connection_failed(&self, reason: &str) {
        // writers must not wait for a resume that never comes
        self.production_paused.send_replace(false);
        self.enqueue(Inbound::Failed(reason.to_string()));
    }
}

/// A reliable byte stream over a connection. Written bytes are cut into packets of
///  `packet_size` bytes, and read bytes come out in the order they were written on the other
///  side.
///
/// Received payload is acknowledged as soon as it arrives and queued until it is read; the
///  queue is not bounded. There is no receive-side flow control, so an application that stops
///  reading while the peer keeps writing accumulates everything the peer sends in memory.
pub struct ArqStream {
    connection: Connection,
    packet_size: usize,
    outbound: BytesMut,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    read_buf: Bytes,
    production_paused: watch::Receiver<bool>,
    is_at_end: bool,
}

impl ArqStream {
    pub async fn connect(config: Arc<LinkConfig>, peer_addr: SocketAddr) -> anyhow::Result<ArqStream> {
        let packet_size = config.packet_size;
        let (network_layer, inbound, production_paused) = StreamNetworkLayer::new();
        let connection = Connection::connect(config, peer_addr, Arc::new(network_layer)).await?;
        Ok(Self::new(connection, packet_size, inbound, production_paused))
    }

    pub async fn accept(listener: Listener) -> anyhow::Result<ArqStream> {
        let packet_size = listener.config().packet_size;
        let (network_layer, inbound, production_paused) = StreamNetworkLayer::new();
        let connection = listener.accept(Arc::new(network_layer)).await?;
        Ok(Self::new(connection, packet_size, inbound, production_paused))
    }

    fn new(connection: Connection, packet_size: usize, inbound: mpsc::UnboundedReceiver<Inbound>, production_paused: watch::Receiver<bool>) -> ArqStream {
        ArqStream {
            connection,
            packet_size,
            outbound: BytesMut::with_capacity(packet_size),
            inbound,
            read_buf: Bytes::new(),
            production_paused,
            is_at_end: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn write(&mut self, mut data: &[u8]) -> anyhow::Result<()> {
        while !data.is_empty() {
            let n = (self.packet_size - self.outbound.len()).min(data.len());
            self.outbound.extend_from_slice(&data[..n]);
            data = &data[n..];

            if self.outbound.len() == self.packet_size {
                self.submit_outbound().await?;
            }
        }
        Ok(())
    }

    /// Sends buffered bytes even if they do not fill a packet
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        if !self.outbound.is_empty() {
            self.submit_outbound().await?;
        }
        Ok(())
    }

    async fn submit_outbound(&mut self) -> anyhow::Result<()> {
        if *self.production_paused.borrow() {
            trace!("production is paused - waiting");
        }
        self.production_paused.wait_for(|paused| !*paused).await?;

        let packet = self.outbound.split().freeze();
        self.connection.submit(packet).await
    }

    /// Returns the number of bytes read, which is 0 iff the peer closed the stream
    pub async fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.read_buf.is_empty() {
            if self.is_at_end {
                return Ok(0);
            }
            match self.inbound.recv().await {
                Some(Inbound::Data(data)) => self.read_buf = data,
                Some(Inbound::End) | None => {
                    debug!("reached end of stream");
                    self.is_at_end = true;
                    return Ok(0);
                }
                Some(Inbound::Failed(reason)) => bail!("connection failed: {}", reason),
            }
        }

        let n = buf.len().min(self.read_buf.len());
        buf[..n].copy_from_slice(&self.read_buf[..n]);
        self.read_buf.advance(n);
        Ok(n)
    }

    pub async fn read_to_end(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut result = Vec::new();
        let mut buf = vec![0u8; self.packet_size];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(result);
            }
            result.extend_from_slice(&buf[..n]);
        }
    }

    /// Flushes, and then closes the connection (see [Connection::close])
    pub async fn close(mut self) -> anyhow::Result<()> {
        let flushed = self.flush().await;
        let closed = self.connection.close().await;
        flushed.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_layer_bridge() {
        let (layer, mut inbound, mut paused) = StreamNetworkLayer::new();

        layer.deliver(Bytes::from_static(b"abc"));
        layer.end_of_stream();
        assert!(matches!(inbound.recv().await, Some(Inbound::Data(data)) if data.as_ref() == b"abc"));
        assert!(matches!(inbound.recv().await, Some(Inbound::End)));

        layer.pause_production();
        assert!(*paused.borrow_and_update());
        layer.resume_production();
        assert!(!*paused.borrow_and_update());

        layer.pause_production();
        layer.connection_failed("gone");
        assert!(!*paused.borrow());
        assert!(matches!(inbound.recv().await, Some(Inbound::Failed(reason)) if reason == "gone"));
    }

    #[tokio::test]
    async fn test_deliver_after_stream_dropped() {
        let (layer, inbound, _paused) = StreamNetworkLayer::new();
        drop(inbound);
        layer.deliver(Bytes::from_static(b"abc"));
    }
}
