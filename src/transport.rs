//! Delivers whole messages between peers over an unreliable multicast
//! channel. `UdpMulticastTransport` is the real implementation;
//! `ChannelTransport` is an in-memory stand-in used by tests so the
//! engines above can be exercised without binding real sockets.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

use crate::ConcordError;

/// One datagram in, one datagram out. `send` is best-effort: a transient
/// failure is logged and swallowed, never propagated, matching the
/// "no retries at this layer" contract. `recv` blocks until a datagram
/// arrives; a receive error is fatal and ends the receive loop.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: &[u8]);
    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), ConcordError>;
}

/// UDP multicast transport. Joins the configured group on bind; TTL and
/// address/port reuse are set before the socket is handed to tokio, the
/// same "configure with socket2, then hand off" sequencing used by other
/// multicast-discovery transports.
pub struct UdpMulticastTransport {
    socket: UdpSocket,
    group: SocketAddr,
}

impl UdpMulticastTransport {
    pub async fn bind(group: Ipv4Addr, port: u16, ttl: u32) -> Result<Self, ConcordError> {
        let sock2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| ConcordError::fatal(format!("socket() failed: {}", e)))?;
        sock2
            .set_reuse_address(true)
            .map_err(|e| ConcordError::fatal(format!("SO_REUSEADDR failed: {}", e)))?;
        #[cfg(unix)]
        sock2
            .set_reuse_port(true)
            .map_err(|e| ConcordError::fatal(format!("SO_REUSEPORT failed: {}", e)))?;
        sock2
            .set_nonblocking(true)
            .map_err(|e| ConcordError::fatal(format!("nonblocking failed: {}", e)))?;

        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        sock2
            .bind(&bind_addr.into())
            .map_err(|e| ConcordError::fatal(format!("bind({}) failed: {}", bind_addr, e)))?;

        sock2
            .set_multicast_ttl_v4(ttl.max(1))
            .map_err(|e| ConcordError::fatal(format!("multicast TTL failed: {}", e)))?;
        sock2
            .set_multicast_loop_v4(true)
            .map_err(|e| ConcordError::fatal(format!("multicast loopback failed: {}", e)))?;
        sock2
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| {
                ConcordError::fatal(format!("join_multicast_v4({}) failed: {}", group, e))
            })?;

        let std_socket: std::net::UdpSocket = sock2.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(UdpMulticastTransport {
            socket,
            group: (group, port).into(),
        })
    }
}

#[async_trait]
impl Transport for UdpMulticastTransport {
    async fn send(&self, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, self.group).await {
            pf_debug!("send to {} failed: {}", self.group, e);
        }
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), ConcordError> {
        let mut buf = vec![0u8; 64 * 1024];
        let (n, src) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, src))
    }
}

/// In-memory stand-in for a multicast group: every subscriber sees every
/// published datagram, including its own (loopback), same as §4.1
/// requires of the real transport.
pub fn test_bus(capacity: usize) -> broadcast::Sender<Vec<u8>> {
    let (tx, _rx) = broadcast::channel(capacity);
    tx
}

pub struct ChannelTransport {
    tx: broadcast::Sender<Vec<u8>>,
    rx: Mutex<broadcast::Receiver<Vec<u8>>>,
    addr: SocketAddr,
}

impl ChannelTransport {
    pub fn subscribe(bus: &broadcast::Sender<Vec<u8>>, addr: SocketAddr) -> Self {
        ChannelTransport {
            tx: bus.clone(),
            rx: Mutex::new(bus.subscribe()),
            addr,
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, bytes: &[u8]) {
        // A bus with no live receivers is not an error (matches an
        // unreliable multicast group going momentarily quiet).
        let _ = self.tx.send(bytes.to_vec());
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), ConcordError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(bytes) => return Ok((bytes, self.addr)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ConcordError::fatal("channel transport bus closed"))
                }
            }
        }
    }
}
