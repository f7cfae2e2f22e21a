//! The Session state machine (§3/§4.3): the one piece of protocol state every
//! client connection or UDP peer gets. Owns the handshake, the CONNECT-stage
//! `pending` buffer, and the lifecycle that tears down both halves together.

pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::cipher::{Cipher, CipherFactory};
use crate::error::RelayError;
use crate::header::{self, ParsedHeader};
use crate::metrics;
use crate::remote;
use crate::Transport;

pub use state::Stage;

const READ_BUF: usize = 16 * 1024;

/// The outcome of a completed INIT handshake: the destination the client
/// asked for, and any payload bytes that trailed the header in the same
/// decrypted chunk.
struct Handshake {
    header: ParsedHeader,
    first_payload: Vec<u8>,
}

/// One client connection (TCP) or one client source endpoint (UDP).
pub struct Session {
    port: u16,
    transport: Transport,
    peer: SocketAddr,
    stage: Stage,
    cipher: Box<dyn Cipher>,
    pending: Vec<u8>,
}

impl Session {
    fn new(port: u16, transport: Transport, peer: SocketAddr, cipher: Box<dyn Cipher>) -> Self {
        Self {
            port,
            transport,
            peer,
            stage: Stage::Init,
            cipher,
            pending: Vec::new(),
        }
    }

    fn advance(&mut self, next: Stage) -> Result<(), RelayError> {
        self.stage = self
            .stage
            .transition(next)
            .map_err(|_| RelayError::UnknownStage { stage: self.stage })?;
        Ok(())
    }

    /// Decrypts one chunk while in INIT. Returns `Ok(None)` if the cipher
    /// needs more bytes; `Ok(Some(_))` once the header parses and `stage`
    /// has advanced to CONNECT.
    fn handle_init(&mut self, data: &[u8]) -> Result<Option<Handshake>, RelayError> {
        let plaintext = self
            .cipher
            .decrypt(data)
            .map_err(|source| RelayError::Decrypt { peer: self.peer, source })?;
        if plaintext.is_empty() {
            return Ok(None);
        }

        let header = header::parse_header(&plaintext).ok_or(RelayError::HeaderParse { peer: self.peer })?;
        self.advance(Stage::Connect)?;
        let first_payload = plaintext[header.consumed..].to_vec();
        Ok(Some(Handshake { header, first_payload }))
    }

    /// Spawns a Session for one accepted TCP connection. Entry point used by
    /// [`crate::acceptor::TcpAcceptor`].
    pub async fn serve_tcp(
        port: u16,
        peer: SocketAddr,
        stream: TcpStream,
        ciphers: Arc<dyn CipherFactory>,
    ) {
        let span = tracing::info_span!("session", port, %peer, transport = "tcp");
        async move {
            let cipher = ciphers.get_cipher_by_port(port, Transport::Tcp);
            let mut session = Session::new(port, Transport::Tcp, peer, cipher);
            if let Err(err) = session.run_tcp(stream).await {
                warn!(%err, "session ended with error");
            }
            // Runs on every exit path of run_tcp, matching the single
            // `connection_made` the acceptor recorded for this connection
            // (invariant 1: decremented exactly once regardless of how the
            // session ended).
            session.stage = Stage::Destroy;
            session.cipher.incr_user_tcp_num(-1);
            metrics::record_connection_closed();
        }
        .instrument(span)
        .await
    }

    /// Spawns a Session for one UDP client endpoint. `inbound` delivers
    /// datagrams already demultiplexed by peer address; entry point used by
    /// [`crate::acceptor::UdpAcceptor`].
    pub async fn serve_udp(
        port: u16,
        peer: SocketAddr,
        mut inbound: mpsc::Receiver<Bytes>,
        client_socket: Arc<UdpSocket>,
        ciphers: Arc<dyn CipherFactory>,
    ) {
        let span = tracing::info_span!("session", port, %peer, transport = "udp");
        async move {
            let cipher = ciphers.get_cipher_by_port(port, Transport::Udp);
            let mut session = Session::new(port, Transport::Udp, peer, cipher);
            if let Err(err) = session.run_udp(&mut inbound, client_socket).await {
                warn!(%err, "udp session ended with error");
            }
            session.stage = Stage::Destroy;
            metrics::record_connection_closed();
        }
        .instrument(span)
        .await
    }

    async fn run_tcp(&mut self, stream: TcpStream) -> Result<(), RelayError> {
        let (mut read_half, write_half) = stream.into_split();
        let mut buf = vec![0u8; READ_BUF];

        let handshake = loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                debug!("client closed before completing handshake");
                return Ok(());
            }
            if let Some(hs) = self.handle_init(&buf[..n])? {
                break hs;
            }
        };

        self.pending.extend_from_slice(&handshake.first_payload);
        let dst_host = handshake.header.dst_addr.to_string();
        let dst_port = handshake.header.dst_port;
        info!(dst = %dst_host, port = dst_port, "handshake complete, connecting upstream");

        // CONNECT: race the outbound connect against further client bytes,
        // which must be buffered into `pending` until upstream is ready
        // (invariant 7) rather than dropped or written out of order.
        let connect_fut = TcpStream::connect((dst_host.as_str(), dst_port));
        tokio::pin!(connect_fut);
        let upstream = loop {
            tokio::select! {
                res = &mut connect_fut => {
                    match res {
                        Ok(upstream) => break upstream,
                        Err(source) => {
                            self.stage = Stage::Error;
                            return Err(RelayError::Connect { dst_host, dst_port, source });
                        }
                    }
                }
                res = read_half.read(&mut buf) => {
                    let n = res?;
                    if n == 0 {
                        debug!("client closed while connecting upstream");
                        return Ok(());
                    }
                    let plaintext = self
                        .cipher
                        .decrypt(&buf[..n])
                        .map_err(|source| RelayError::Decrypt { peer: self.peer, source })?;
                    self.pending.extend_from_slice(&plaintext);
                }
            }
        };

        self.cipher.record_user_ip(self.peer);
        self.advance(Stage::Stream)?;

        let (upstream_read, mut upstream_write) = upstream.into_split();
        if !self.pending.is_empty() {
            upstream_write.write_all(&self.pending).await?;
            self.pending.clear();
        }

        let latch = remote::CloseLatch::new();
        let mut remote_rx = latch.subscribe();
        let remote_cipher = self.cipher.fork();
        let remote_task = tokio::spawn(remote::tcp::run(
            upstream_read,
            write_half,
            remote_cipher,
            latch.clone(),
            self.peer,
        ));

        loop {
            tokio::select! {
                _ = remote_rx.changed() => {
                    debug!("remote signaled close");
                    break;
                }
                res = read_half.read(&mut buf) => {
                    match res {
                        Ok(0) => {
                            debug!("client eof");
                            break;
                        }
                        Ok(n) => {
                            let plaintext = self
                                .cipher
                                .decrypt(&buf[..n])
                                .map_err(|source| RelayError::Decrypt { peer: self.peer, source })?;
                            if !plaintext.is_empty() {
                                if let Err(err) = upstream_write.write_all(&plaintext).await {
                                    debug!(%err, "upstream write failed");
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            debug!(%err, "client read failed");
                            break;
                        }
                    }
                }
            }
        }

        latch.begin_close();
        let _ = remote_task.await;
        self.stage = Stage::Destroy;
        Ok(())
    }

    async fn run_udp(
        &mut self,
        inbound: &mut mpsc::Receiver<Bytes>,
        client_socket: Arc<UdpSocket>,
    ) -> Result<(), RelayError> {
        let handshake = loop {
            let datagram = match inbound.recv().await {
                Some(d) => d,
                None => return Ok(()),
            };
            if let Some(hs) = self.handle_init(&datagram)? {
                break hs;
            }
        };

        let dst_host = handshake.header.dst_addr.to_string();
        let dst_port = handshake.header.dst_port;
        // Resolve first so the bind family matches the destination: a domain
        // name or an IPv6 literal (ATYP 0x04) both need a socket of the same
        // family as the resolved address, not an IPv4-only bind that would
        // fail `connect` outright.
        let resolved = match tokio::net::lookup_host((dst_host.as_str(), dst_port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.stage = Stage::Error;
                    return Err(RelayError::Connect {
                        dst_host,
                        dst_port,
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
                    });
                }
            },
            Err(source) => {
                self.stage = Stage::Error;
                return Err(RelayError::Connect { dst_host, dst_port, source });
            }
        };
        let bind_addr: SocketAddr = match resolved {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("valid literal"),
            SocketAddr::V6(_) => "[::]:0".parse().expect("valid literal"),
        };
        let upstream = UdpSocket::bind(bind_addr).await?;
        if let Err(source) = upstream.connect(resolved).await {
            self.stage = Stage::Error;
            return Err(RelayError::Connect { dst_host, dst_port, source });
        }
        let upstream = Arc::new(upstream);

        self.advance(Stage::Stream)?;
        if !handshake.first_payload.is_empty() {
            upstream.send(&handshake.first_payload).await?;
        }

        let latch = remote::CloseLatch::new();
        let mut remote_rx = latch.subscribe();
        let remote_cipher = self.cipher.fork();
        let remote_task = tokio::spawn(remote::udp::run(
            upstream.clone(),
            client_socket,
            self.peer,
            remote_cipher,
            latch.clone(),
        ));

        loop {
            tokio::select! {
                _ = remote_rx.changed() => {
                    debug!("remote signaled close");
                    break;
                }
                maybe = inbound.recv() => {
                    match maybe {
                        None => {
                            debug!("acceptor evicted this peer");
                            break;
                        }
                        Some(datagram) => {
                            let plaintext = self
                                .cipher
                                .decrypt(&datagram)
                                .map_err(|source| RelayError::Decrypt { peer: self.peer, source })?;
                            if plaintext.is_empty() {
                                continue;
                            }
                            if let Err(err) = upstream.send(&plaintext).await {
                                debug!(%err, "upstream send failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        latch.begin_close();
        let _ = remote_task.await;
        self.stage = Stage::Destroy;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Chacha20CipherFactory;

    fn factory() -> Arc<dyn CipherFactory> {
        Arc::new(Chacha20CipherFactory::new("hunter2"))
    }

    #[tokio::test]
    async fn tcp_happy_path_relays_request_and_reply() {
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let client_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();

        let ciphers = factory();
        let upstream_task = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GET / HTTP/1.0\r\n\r\n");
            sock.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
        });

        let session_task = tokio::spawn(async move {
            let (stream, peer) = client_listener.accept().await.unwrap();
            Session::serve_tcp(client_addr.port(), peer, stream, ciphers).await;
        });

        // Outbound (client->server) and inbound (server->client) each carry
        // their own salt-derived key, so the client needs one cipher
        // instance per direction, exactly as the Session/Remote split does
        // on the server side.
        let mut send_cipher = Chacha20CipherFactory::new("hunter2").get_cipher_by_port(0, Transport::Tcp);
        let mut recv_cipher = Chacha20CipherFactory::new("hunter2").get_cipher_by_port(0, Transport::Tcp);
        let mut client_sock = TcpStream::connect(client_addr).await.unwrap();

        let ip = match upstream_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => panic!("expected v4"),
        };
        let mut header = vec![0x01];
        header.extend_from_slice(&ip.octets());
        header.extend_from_slice(&upstream_addr.port().to_be_bytes());
        header.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

        client_sock.write_all(&send_cipher.encrypt(&header)).await.unwrap();

        let mut reply_wire = vec![0u8; 1024];
        let n = client_sock.read(&mut reply_wire).await.unwrap();
        let plaintext = recv_cipher.decrypt(&reply_wire[..n]).unwrap();
        assert_eq!(plaintext, b"HTTP/1.0 200 OK\r\n\r\n");

        upstream_task.await.unwrap();
        session_task.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connect_failure_closes_without_sending_anything() {
        let client_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let ciphers = factory();

        let session_task = tokio::spawn(async move {
            let (stream, peer) = client_listener.accept().await.unwrap();
            Session::serve_tcp(client_addr.port(), peer, stream, ciphers).await;
        });

        let mut client_cipher = Chacha20CipherFactory::new("hunter2").get_cipher_by_port(0, Transport::Tcp);
        let mut client_sock = TcpStream::connect(client_addr).await.unwrap();

        // Port 1 is reserved and refuses connections on loopback.
        let mut header = vec![0x01, 127, 0, 0, 1];
        header.extend_from_slice(&1u16.to_be_bytes());
        client_sock.write_all(&client_cipher.encrypt(&header)).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = client_sock.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server must not send anything back on connect failure");

        session_task.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_decrypt_failure_closes_the_session() {
        let client_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let ciphers = factory();

        let session_task = tokio::spawn(async move {
            let (stream, peer) = client_listener.accept().await.unwrap();
            Session::serve_tcp(client_addr.port(), peer, stream, ciphers).await;
        });

        let mut client_sock = TcpStream::connect(client_addr).await.unwrap();
        // 16 arbitrary bytes the server will consume as the salt (any bytes
        // work, since deriving *a* key from them always succeeds), followed
        // by a well-formed length prefix (5 plaintext bytes) and 21 bytes
        // that are not a valid ciphertext+tag under that derived key: the
        // AEAD tag check fails rather than the frame just looking
        // incomplete.
        let mut frame = vec![0xCD; 16];
        frame.extend_from_slice(&[0x00, 0x05]);
        frame.extend_from_slice(&[0xAB; 21]);
        client_sock.write_all(&frame).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = client_sock.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        session_task.await.unwrap();
    }
}
