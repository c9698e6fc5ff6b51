//! UDP transport: one broadcast-enabled socket shared by the receive loop and every sender.

use std::net::SocketAddr;

use lanlink_core::MAX_FRAME_LEN;
use tokio::net::UdpSocket;

pub struct Transport {
    socket: UdpSocket,
    broadcast: SocketAddr,
}

impl Transport {
    /// Bind `listen` and enable broadcast. Heartbeats go to `broadcast`.
    pub fn bind(listen: SocketAddr, broadcast: SocketAddr) -> std::io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind(listen)?;
        std_sock.set_broadcast(true)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        Ok(Self { socket, broadcast })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        self.broadcast
    }

    /// Best effort: failures are logged and the datagram is dropped.
    pub async fn send_to(&self, bytes: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, to).await {
            tracing::warn!(%to, error = %e, "send failed");
        }
    }

    pub async fn broadcast(&self, bytes: &[u8]) {
        self.send_to(bytes, self.broadcast).await;
    }

    /// Next datagram. `buf` should hold at least `RECV_BUF_LEN` bytes.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

pub const RECV_BUF_LEN: usize = MAX_FRAME_LEN;
