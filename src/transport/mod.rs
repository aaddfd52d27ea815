//! Transport machinery below the connection: packet number spaces, streams,
//! flow and congestion control, loss recovery, and the datagram channel.

pub mod assembler;
pub mod congestion;
pub mod flow_control;
pub mod loss;
pub mod range_set;
pub mod recovery;
pub mod space;
pub mod stream;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};

/// Timestamp in microseconds from an arbitrary epoch.
/// Used for RTT measurement and loss detection timers.
pub type Instant = u64;

/// Largest UDP payload we accept.
const MAX_UDP_PAYLOAD: usize = 65527;

/// An unreliable datagram channel bound to one remote peer.
///
/// Datagrams may be lost, duplicated or reordered; the connection copes.
/// `recv` suspends until a datagram arrives.
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    async fn recv(&self) -> io::Result<Bytes>;
}

/// [`DatagramTransport`] over a connected UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpTransport {
    /// Resolve `host:port`, bind an ephemeral local port of the same
    /// address family and connect to the first address.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let remote = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve"))?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        tracing::debug!(%remote, local = ?socket.local_addr().ok(), "udp socket connected");
        Ok(Self { socket, remote })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let client = UdpTransport::connect("127.0.0.1", port).await.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");

        server.send_to(b"pong", from).await.unwrap();
        assert_eq!(&client.recv().await.unwrap()[..], b"pong");
    }
}
