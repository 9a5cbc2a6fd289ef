use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};
use crate::config::ChannelConfig;
use crate::fault::FaultSource;
use crate::frame::{Frame, FrameError, MAX_DATAGRAM_LEN};
use crate::send_socket::SendSocket;

/// Receives whatever arrives from the peer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame_arrival(&self, frame: Frame);

    async fn on_damaged_frame(&self, error: FrameError);

    /// The channel can not receive any more frames after this
    async fn on_channel_failure(&self, error: anyhow::Error);
}

struct ReceiveLoop {
    cancel_sender: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// A datagram channel to a single peer that (optionally) drops, damages and delays outgoing
///  frames, and paces sending with a fixed delay per frame.
pub struct UnreliableChannel {
    config: ChannelConfig,
    peer_addr: SocketAddr,
    send_socket: Arc<dyn SendSocket>,
    faults: Arc<dyn FaultSource>,
    receive_loop: Mutex<Option<ReceiveLoop>>,
}

impl UnreliableChannel {
    pub fn new(config: ChannelConfig, peer_addr: SocketAddr, send_socket: Arc<dyn SendSocket>, faults: Arc<dyn FaultSource>) -> anyhow::Result<UnreliableChannel> {
        config.validate()?;
        Ok(UnreliableChannel {
            config,
            peer_addr,
            send_socket,
            faults,
            receive_loop: Mutex::new(None),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Sends a frame, subject to the configured impairments. An error means that the frame
    ///  could not be handed to the socket - dropping a frame deliberately is not an error.
    pub async fn transmit(&self, frame: &Frame) -> anyhow::Result<()> {
        let mut buf = frame.encode();
        let impairment = self.faults.impair(buf.len());

        if impairment.drop {
            debug!("dropping frame {:?}/{:?}", frame.kind(), frame.seq_number());
            return Ok(());
        }

        if let Some(flip) = impairment.damage {
            debug!("damaging frame {:?}/{:?}: flipping bit {} of byte {}", frame.kind(), frame.seq_number(), flip.bit_index, flip.byte_index);
            buf[flip.byte_index] ^= 1 << flip.bit_index;
        }

        if !self.config.pacing_delay.is_zero() {
            time::sleep(self.config.pacing_delay).await;
        }

        match impairment.extra_delay {
            None => {
                trace!("sending frame {:?}/{:?} ack={}", frame.kind(), frame.seq_number(), frame.ack_number());
                self.send_socket.do_send_packet(self.peer_addr, &buf).await
            }
            Some(delay) => {
                debug!("delaying frame {:?}/{:?} by {:?}", frame.kind(), frame.seq_number(), delay);
                let send_socket = self.send_socket.clone();
                let peer_addr = self.peer_addr;
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    if let Err(e) = send_socket.do_send_packet(peer_addr, &buf).await {
                        warn!("error sending delayed frame: {:#}", e);
                    }
                });
                Ok(())
            }
        }
    }

    /// Spawns a task that reads datagrams from `socket`, decodes them and passes them to the
    ///  handler. Datagrams that do not come from this channel's peer are ignored.
    ///
    /// The loop holds only a weak reference to the handler, so the handler can own the channel.
    ///  It terminates when the handler is dropped, and when the channel is dropped.
    pub async fn start_receive_loop(&self, socket: Arc<UdpSocket>, handler: Weak<dyn FrameHandler>) {
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);
        let handle = tokio::spawn(Self::receive_loop(socket, self.peer_addr, handler, cancel_receiver));

        let previous = self.receive_loop.lock().await
            .replace(ReceiveLoop { cancel_sender, handle });
        if let Some(previous) = previous {
            warn!("receive loop was started twice - canceling the previous one");
            Self::stop(previous).await;
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, peer_addr: SocketAddr, handler: Weak<dyn FrameHandler>, mut cancel_receiver: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        trace!("starting receive loop for peer {:?}", peer_addr);

        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if from != peer_addr {
                                debug!("received datagram from {:?} which is not the peer - ignoring", from);
                                continue;
                            }
                            let Some(handler) = handler.upgrade() else {
                                debug!("frame handler was dropped - terminating receive loop");
                                break;
                            };
                            match Frame::decode(&buf[..len]) {
                                Ok(frame) => handler.on_frame_arrival(frame).await,
                                Err(e) => handler.on_damaged_frame(e).await,
                            }
                        }
                        Err(e) if is_transient(&e) => {
                            debug!("transient error receiving from datagram socket: {}", e);
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            if let Some(handler) = handler.upgrade() {
                                handler.on_channel_failure(e.into()).await;
                            }
                            break;
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        trace!("receive loop for peer {:?} terminated", peer_addr);
    }

    async fn stop(receive_loop: ReceiveLoop) {
        if let Err(err) = receive_loop.cancel_sender.send(()) {
            // the loop terminated on its own
            trace!(?err, "receive loop was not listening for cancellation");
        }
        if let Err(e) = receive_loop.handle.await {
            warn!("receive loop terminated abnormally: {}", e);
        }
    }

    /// Stops the receive loop and waits for it to terminate. Frames that are still delayed
    ///  in flight are not affected.
    pub async fn shutdown(&self) {
        let receive_loop = self.receive_loop.lock().await.take();
        if let Some(receive_loop) = receive_loop {
            Self::stop(receive_loop).await;
        }
    }
}

impl Drop for UnreliableChannel {
    fn drop(&mut self) {
        if let Some(receive_loop) = self.receive_loop.get_mut().take() {
            // the loop may be gone already
            let _ = receive_loop.cancel_sender.send(());
        }
    }
}

/// ICMP 'port unreachable' can surface as an error on some platforms when the peer's socket
///  is not (yet / any more) open. That does not affect the local socket.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::Interrupted)
}

/// Waits for the first intact frame on a socket, returning it together with its sender. This
///  is how the accepting side of a connection learns who its peer is.
pub async fn await_first_frame(socket: &UdpSocket) -> anyhow::Result<(SocketAddr, Frame)> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        match Frame::decode(&buf[..len]) {
            Ok(frame) => return Ok((from, frame)),
            Err(e) => debug!("discarding damaged frame from {:?} while waiting for a peer: {}", from, e),
        }
    }
}
