//! UDP transport.
//!
//! A bound endpoint supporting unicast, broadcast, and multicast sends,
//! plus byte counters, toggling the relevant socket option before each
//! send rather than holding three separate sockets.

use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::error::{NeteriaError, Result};
use crate::stats::Stats;

/// How a datagram should be emitted onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Unicast,
    Broadcast,
    Multicast { ttl: u32 },
}

/// A bound UDP endpoint. Cheap to clone -- the socket and counters are
/// shared behind `Arc`.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
    stats: Arc<Stats>,
}

impl Transport {
    /// Binds a UDP socket to `addr` with `SO_REUSEADDR` set.
    pub async fn bind(addr: SocketAddr, max_datagram_size: usize) -> Result<Self> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            socket: Arc::new(socket),
            max_datagram_size,
            stats: Arc::new(Stats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Sends `payload` to `dest` using `mode`, toggling the relevant socket
    /// option first. Fails loud if `payload` exceeds `max_datagram_size`.
    pub async fn send(&self, payload: &[u8], dest: SocketAddr, mode: SendMode) -> Result<()> {
        if payload.len() > self.max_datagram_size {
            return Err(NeteriaError::DatagramTooLarge {
                size: payload.len(),
                limit: self.max_datagram_size,
            });
        }

        match mode {
            SendMode::Unicast => {}
            SendMode::Broadcast => {
                self.socket.set_broadcast(true)?;
            }
            SendMode::Multicast { ttl } => {
                self.socket.set_multicast_ttl_v4(ttl)?;
            }
        }

        self.socket.send_to(payload, dest).await?;
        self.stats.record_sent(payload.len());
        Ok(())
    }

    /// Receives one datagram. Connection-reset-style errors are not
    /// special-cased here (that belongs to the caller's receive loop,
    /// which can tell a transient reset from a fatal error); this just
    /// surfaces whatever the OS returned.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (n, addr) = self.socket.recv_from(buf).await?;
        self.stats.record_received(n);
        Ok((n, addr))
    }

    /// Runs the receive loop, invoking `on_datagram` for every inbound
    /// packet. `ConnectionReset`-style OS errors are logged and the loop
    /// continues; any other error ends the loop.
    pub async fn recv_loop<F, Fut>(&self, mut on_datagram: F) -> std::io::Result<()>
    where
        F: FnMut(Vec<u8>, SocketAddr) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut buf = vec![0u8; self.max_datagram_size];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, source)) => {
                    self.stats.record_received(n);
                    on_datagram(buf[..n].to_vec(), source).await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    tracing::info!(error = %e, "connection reset on receive, continuing");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Binds a loopback transport on an OS-assigned ephemeral port, for tests.
pub async fn bind_ephemeral(max_datagram_size: usize) -> Result<Transport> {
    Transport::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0), max_datagram_size).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unicast_roundtrip() {
        let a = bind_ephemeral(10_240).await.unwrap();
        let b = bind_ephemeral(10_240).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(b"hello", b_addr, SendMode::Unicast).await.unwrap();

        let mut buf = vec![0u8; 10_240];
        let (n, _) = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(a.stats().bytes_sent(), 5);
        assert_eq!(b.stats().bytes_received(), 5);
    }

    #[tokio::test]
    async fn oversize_datagram_is_rejected() {
        let a = bind_ephemeral(8).await.unwrap();
        let dest = bind_ephemeral(8).await.unwrap().local_addr().unwrap();
        let err = a.send(b"way too many bytes", dest, SendMode::Unicast).await;
        assert!(matches!(err, Err(NeteriaError::DatagramTooLarge { .. })));
    }
}
