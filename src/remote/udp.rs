//! Remote UDP: reads datagrams off the upstream socket, prepends the
//! Shadowsocks reply header (§4.3/§6), encrypts, and sends to the client
//! through the UDP Acceptor's shared socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::cipher::Cipher;

use super::CloseLatch;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Runs until the upstream socket errors or the Session signals close.
pub async fn run(
    upstream: Arc<UdpSocket>,
    client_socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut cipher: Box<dyn Cipher>,
    latch: CloseLatch,
) {
    let mut rx = latch.subscribe();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = rx.changed() => {
                debug!(%peer, "session signaled close");
                break;
            }
            res = upstream.recv(&mut buf) => {
                match res {
                    Ok(n) => {
                        let source = match upstream.peer_addr() {
                            Ok(addr) => addr,
                            Err(err) => {
                                debug!(%peer, %err, "upstream socket has no peer address");
                                continue;
                            }
                        };
                        let mut framed = reply_header(source);
                        framed.extend_from_slice(&buf[..n]);
                        let wire = cipher.encrypt(&framed);
                        if let Err(err) = client_socket.send_to(&wire, peer).await {
                            debug!(%peer, %err, "send to client failed");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%peer, %err, "upstream recv failed");
                        break;
                    }
                }
            }
        }
    }

    latch.begin_close();
}

/// Builds `ATYP(1) || addr(4 or 16) || port(2, big-endian)`, choosing ATYP
/// per address family. `std::net::SocketAddr` is always either V4 or V6, so
/// unlike the string-parsing the original source did, there is no
/// "neither" case to reject here.
fn reply_header(source: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    match source {
        SocketAddr::V4(v4) => {
            out.push(0x01);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            out.push(0x04);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn ipv4_reply_header_uses_atyp_0x01() {
        let source = SocketAddr::new(Ipv4Addr::new(8, 8, 8, 8).into(), 53);
        let header = reply_header(source);
        assert_eq!(header, vec![0x01, 8, 8, 8, 8, 0, 53]);
    }

    #[test]
    fn ipv6_reply_header_uses_atyp_0x04() {
        let addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let source = SocketAddr::new(addr.into(), 53);
        let header = reply_header(source);
        assert_eq!(header[0], 0x04);
        assert_eq!(&header[1..17], &addr.octets());
        assert_eq!(&header[17..19], &53u16.to_be_bytes());
    }
}
