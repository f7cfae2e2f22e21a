//! Remote TCP: reads plaintext off the upstream byte stream, encrypts it
//! with a codec forked from the Session's, and writes it back to the
//! client. Lives in its own task so the Session can simultaneously read
//! from the client without alternating direction on a single socket pair.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::cipher::Cipher;

use super::CloseLatch;

/// Runs until the upstream reaches EOF/error or the Session signals close.
/// The Session owns `cipher.incr_user_tcp_num`/active-connection bookkeeping
/// since only it holds the decrypt-direction cipher; this task's only
/// obligation on exit is to flip `latch` so the Session wakes promptly.
pub async fn run(
    mut upstream_read: OwnedReadHalf,
    mut client_writer: OwnedWriteHalf,
    mut cipher: Box<dyn Cipher>,
    latch: CloseLatch,
    peer: SocketAddr,
) {
    let mut rx = latch.subscribe();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = rx.changed() => {
                debug!(%peer, "session signaled close");
                break;
            }
            res = upstream_read.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        debug!(%peer, "upstream eof");
                        break;
                    }
                    Ok(n) => {
                        let wire = cipher.encrypt(&buf[..n]);
                        if latch.is_closing() {
                            break;
                        }
                        if let Err(err) = client_writer.write_all(&wire).await {
                            debug!(%peer, %err, "write to client failed");
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%peer, %err, "upstream read failed");
                        break;
                    }
                }
            }
        }
    }

    latch.begin_close();
}
