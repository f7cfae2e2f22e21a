//! The two listeners (§4.1/§4.2): one per transport, sharing a port. Neither
//! inspects traffic; both just get a fresh [`Session`] onto the right socket
//! and record that a connection was made.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::cipher::CipherFactory;
use crate::metrics;
use crate::session::Session;

/// Accepts TCP connections on `bind` and spawns one [`Session`] per stream.
pub struct TcpAcceptor {
    listener: TcpListener,
    port: u16,
    ciphers: Arc<dyn CipherFactory>,
}

impl TcpAcceptor {
    pub async fn bind(bind: SocketAddr, ciphers: Arc<dyn CipherFactory>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port, ciphers })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs forever, accepting connections and spawning a detached Session
    /// task per connection. The acceptor never awaits a Session to
    /// completion — that would serialize unrelated clients behind one
    /// slow handshake.
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            metrics::record_connection_made();
            info!(%peer, port = self.port, "tcp connection accepted");
            let ciphers = self.ciphers.clone();
            let port = self.port;
            tokio::spawn(async move {
                Session::serve_tcp(port, peer, stream, ciphers).await;
            });
        }
    }
}

struct UdpPeer {
    inbound: mpsc::Sender<Bytes>,
    last_seen: Instant,
}

/// Binds a single datagram socket on `bind` and demultiplexes inbound
/// datagrams by client source endpoint into per-peer Sessions (§4.2). All
/// Sessions share this socket for their replies — UDP has no per-connection
/// socket to hand off the way TCP does.
pub struct UdpAcceptor {
    socket: Arc<UdpSocket>,
    port: u16,
    ciphers: Arc<dyn CipherFactory>,
    peers: Mutex<HashMap<SocketAddr, UdpPeer>>,
    idle_timeout: Duration,
}

const UDP_CHANNEL_CAPACITY: usize = 256;

impl UdpAcceptor {
    pub async fn bind(
        bind: SocketAddr,
        ciphers: Arc<dyn CipherFactory>,
        idle_timeout: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind).await?;
        let port = socket.local_addr()?.port();
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            port,
            ciphers,
            peers: Mutex::new(HashMap::new()),
            idle_timeout,
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs forever, reading datagrams off the shared socket and routing
    /// each to its peer's Session, creating one on first contact (§4.2).
    /// Also spawns the idle-eviction sweep that resolves the §9 open
    /// question about the peer map otherwise leaking forever.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.evict_idle_loop().await });

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            let datagram = Bytes::copy_from_slice(&buf[..n]);
            self.route(peer, datagram).await;
        }
    }

    async fn route(&self, peer: SocketAddr, datagram: Bytes) {
        let mut peers = self.peers.lock().await;
        if let Some(existing) = peers.get_mut(&peer) {
            existing.last_seen = Instant::now();
            // A full channel means this peer's Session is stalled or gone;
            // dropping the datagram is preferable to blocking the shared
            // socket's read loop for every other peer.
            if existing.inbound.try_send(datagram).is_err() {
                debug!(%peer, "udp session channel full or closed, dropping datagram");
            }
            return;
        }

        metrics::record_connection_made();
        info!(%peer, port = self.port, "new udp peer");
        let (tx, rx) = mpsc::channel(UDP_CHANNEL_CAPACITY);
        let _ = tx.try_send(datagram);
        peers.insert(
            peer,
            UdpPeer {
                inbound: tx,
                last_seen: Instant::now(),
            },
        );
        drop(peers);

        let ciphers = self.ciphers.clone();
        let client_socket = self.socket.clone();
        let port = self.port;
        tokio::spawn(async move {
            Session::serve_udp(port, peer, rx, client_socket, ciphers).await;
        });
    }

    /// Periodically drops peer-map entries that have been quiet for longer
    /// than `idle_timeout`. Dropping the `mpsc::Sender` closes that peer's
    /// Session's inbound channel, which ends its event loop on the next
    /// `recv`.
    async fn evict_idle_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.idle_timeout.max(Duration::from_secs(1)) / 2);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut peers = self.peers.lock().await;
            let before = peers.len();
            peers.retain(|_, p| now.duration_since(p.last_seen) < self.idle_timeout);
            let evicted = before - peers.len();
            if evicted > 0 {
                debug!(evicted, remaining = peers.len(), "evicted idle udp peers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Chacha20CipherFactory;
    use std::sync::Arc;
    use tokio::time::Duration as TokioDuration;

    fn factory() -> Arc<dyn CipherFactory> {
        Arc::new(Chacha20CipherFactory::new("hunter2"))
    }

    #[tokio::test]
    async fn repeat_datagrams_from_the_same_peer_reuse_one_session() {
        let acceptor = UdpAcceptor::bind("127.0.0.1:0".parse().unwrap(), factory(), Duration::from_secs(300))
            .await
            .unwrap();

        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        acceptor.route(peer, Bytes::from_static(b"one")).await;
        acceptor.route(peer, Bytes::from_static(b"two")).await;

        let peers = acceptor.peers.lock().await;
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn idle_peers_are_evicted_after_timeout() {
        let acceptor = UdpAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            factory(),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        acceptor.route(peer, Bytes::from_static(b"hello")).await;
        assert_eq!(acceptor.peers.lock().await.len(), 1);

        let sweeper = acceptor.clone();
        tokio::spawn(async move { sweeper.evict_idle_loop().await });
        tokio::time::sleep(TokioDuration::from_millis(100)).await;

        assert_eq!(acceptor.peers.lock().await.len(), 0);
    }
}
