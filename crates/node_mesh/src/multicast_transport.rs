//! UDP multicast transport.
//!
//! Every peer binds the same port with `SO_REUSEADDR` and joins the same IPv4
//! group, so one `send_to(group)` reaches every member. Loopback is enabled by
//! default so a node also hears its own broadcasts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::transport::{Result, Transport, TransportError};

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
pub const DEFAULT_PORT: u16 = 5001;
const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MulticastConfig {
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local interface used to join the group.
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_true")]
    pub loopback: bool,
    /// Largest datagram accepted; longer ones are truncated by the socket.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_group() -> Ipv4Addr {
    DEFAULT_GROUP
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_ttl() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            interface: default_interface(),
            ttl: default_ttl(),
            loopback: true,
            buffer_size: default_buffer_size(),
        }
    }
}

impl MulticastConfig {
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port)
    }
}

pub struct MulticastTransport {
    config: MulticastConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    closed: watch::Sender<bool>,
}

impl MulticastTransport {
    pub fn new(config: MulticastConfig) -> Self {
        let (closed, _) = watch::channel(true);
        Self {
            config,
            socket: Mutex::new(None),
            closed,
        }
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn bind(&self) -> Result<UdpSocket> {
        let config = &self.config;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket.bind(&local.into())?;
        socket.join_multicast_v4(&config.group, &config.interface)?;
        socket.set_multicast_loop_v4(config.loopback)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

#[async_trait::async_trait]
impl Transport for MulticastTransport {
    async fn open(&self) -> Result<()> {
        if self.current_socket().is_some() {
            return Ok(());
        }
        let socket = Arc::new(self.bind()?);
        debug!(
            "joined multicast group {} on port {}",
            self.config.group, self.config.port
        );
        *self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(socket);
        self.closed.send_replace(false);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let socket = self.current_socket().ok_or(TransportError::NotOpen)?;
        socket.send_to(payload, self.config.group_addr()).await?;
        trace!("sent {} bytes to {}", payload.len(), self.config.group_addr());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let already_closed = *closed.borrow_and_update();
        let socket = match self.current_socket() {
            Some(socket) if !already_closed => socket,
            _ => return Err(TransportError::Closed),
        };

        let mut buf = vec![0u8; self.config.buffer_size];
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                trace!("received {len} bytes from {from}");
                buf.truncate(len);
                Ok(buf)
            }
        }
    }

    fn close(&self) {
        let released = self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if released.is_some() {
            debug!("released multicast socket on port {}", self.config.port);
        }
        self.closed.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.close();
    }
}
