use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use anyhow::{bail, Context};
use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use crate::channel::{await_first_frame, FrameHandler, UnreliableChannel};
use crate::config::LinkConfig;
use crate::engine::WindowEngine;
use crate::frame::Frame;
use crate::fault::{FaultSource, RandomFaults};
use crate::network_layer::NetworkLayer;

/// range of ports the connecting side picks its local port from
pub const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;
const MAX_BIND_ATTEMPTS: usize = 32;

/// An established connection: a window engine wired to a channel whose receive loop is
///  running.
///
/// Dropping a connection without closing it stops its receive loop and its timers and
///  releases the socket, but does not tell the peer.
pub struct Connection {
    engine: Arc<WindowEngine>,
    local_addr: SocketAddr,
}

impl Connection {
    /// Binds a random local port and connects to `peer_addr`, impairing outgoing frames as
    ///  configured in `config.channel`.
    ///
    /// Nothing is sent yet: the peer learns about this connection (and its window size) from
    ///  the first frame that is submitted.
    pub async fn connect(config: Arc<LinkConfig>, peer_addr: SocketAddr, network_layer: Arc<dyn NetworkLayer>) -> anyhow::Result<Connection> {
        let faults = Arc::new(RandomFaults::new(&config.channel)?);
        Self::connect_with_faults(config, peer_addr, network_layer, faults).await
    }

    pub async fn connect_with_faults(config: Arc<LinkConfig>, peer_addr: SocketAddr, network_layer: Arc<dyn NetworkLayer>, faults: Arc<dyn FaultSource>) -> anyhow::Result<Connection> {
        config.validate()?;

        let socket = Arc::new(bind_ephemeral_port(peer_addr).await?);
        let window_size = config.window_size;
        let connection = Self::establish(config, window_size, socket, peer_addr, network_layer, faults, None).await?;
        info!("connected {:?} to {:?} with window size {}", connection.local_addr, peer_addr, window_size);
        Ok(connection)
    }

    /// `first_frame` is processed before the receive loop starts, so that it is not overtaken
    ///  by frames queued on the socket behind it
    async fn establish(config: Arc<LinkConfig>, window_size: u32, socket: Arc<UdpSocket>, peer_addr: SocketAddr, network_layer: Arc<dyn NetworkLayer>, faults: Arc<dyn FaultSource>, first_frame: Option<Frame>) -> anyhow::Result<Connection> {
        let local_addr = socket.local_addr()?;
        let channel = Arc::new(UnreliableChannel::new(config.channel.clone(), peer_addr, socket.clone(), faults)?);
        let engine = WindowEngine::new(config, window_size, channel.clone(), network_layer)?;

        if let Some(first_frame) = first_frame {
            engine.on_frame_arrival(first_frame).await;
        }

        let frame_handler: Arc<dyn FrameHandler> = engine.clone();
        channel.start_receive_loop(socket, Arc::downgrade(&frame_handler)).await;

        Ok(Connection { engine, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.engine.peer_addr()
    }

    pub async fn window_size(&self) -> u32 {
        self.engine.window_size().await
    }

    /// see [WindowEngine::submit]
    pub async fn submit(&self, payload: Bytes) -> anyhow::Result<()> {
        self.engine.submit(payload).await
    }

    /// see [WindowEngine::close]
    pub async fn close(&self) -> anyhow::Result<()> {
        self.engine.close().await
    }
}

/// The accepting side of a connection: a bound socket waiting for a peer
pub struct Listener {
    config: Arc<LinkConfig>,
    socket: UdpSocket,
}

impl Listener {
    /// Fails if the address is in use
    pub async fn bind(config: Arc<LinkConfig>, local_addr: SocketAddr) -> anyhow::Result<Listener> {
        config.validate()?;
        let socket = UdpSocket::bind(local_addr).await
            .with_context(|| format!("binding {:?}", local_addr))?;
        Ok(Listener { config, socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub async fn accept(self, network_layer: Arc<dyn NetworkLayer>) -> anyhow::Result<Connection> {
        let faults = Arc::new(RandomFaults::new(&self.config.channel)?);
        self.accept_with_faults(network_layer, faults).await
    }

    /// Waits for the first intact frame, taking its sender as the peer and its ack number as
    ///  `window_size - 1`. The frame is then processed like any other frame.
    pub async fn accept_with_faults(self, network_layer: Arc<dyn NetworkLayer>, faults: Arc<dyn FaultSource>) -> anyhow::Result<Connection> {
        let (peer_addr, first_frame) = await_first_frame(&self.socket).await?;

        let Some(window_size) = first_frame.ack_number().checked_add(1) else {
            bail!("first frame from {:?} announces an invalid window size", peer_addr);
        };
        if window_size < 2 {
            bail!("first frame from {:?} announces window size {}, which is too small", peer_addr, window_size);
        }

        let socket = Arc::new(self.socket);
        let connection = Connection::establish(self.config, window_size, socket, peer_addr, network_layer, faults, Some(first_frame)).await?;
        info!("accepted connection from {:?} on {:?} with window size {}", peer_addr, connection.local_addr, window_size);
        Ok(connection)
    }
}

/// Binds a random port in [EPHEMERAL_PORTS], retrying with a different port while the chosen
///  one is in use
async fn bind_ephemeral_port(peer_addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let ip: IpAddr = match peer_addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(EPHEMERAL_PORTS);
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("port {} is in use - trying another one", port);
            }
            Err(e) => return Err(e).with_context(|| format!("binding port {}", port)),
        }
    }
    bail!("no free port found after {} attempts", MAX_BIND_ATTEMPTS)
}
