//! A reference [`Cipher`]/[`CipherFactory`] implementation built from the
//! same crypto crates this project's parent library uses for session-key
//! derivation (`chacha20poly1305`, `hkdf`, `sha2`).
//!
//! §6 deliberately keeps cipher construction, key derivation, salt/nonce
//! management, and AEAD framing out of the relay core's scope — this module
//! is the concrete collaborator the core is written against, not part of the
//! core itself. Swapping it for a full multi-cipher-suite Shadowsocks AEAD
//! implementation requires no changes outside this file.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::cipher::{Cipher, CipherError, CipherFactory};
use crate::Transport;

const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const LEN_PREFIX: usize = 2;
const MAX_CHUNK: usize = 0xFFFF;
const HKDF_INFO: &[u8] = b"ss-relay chunked aead subkey";

/// Per-user state shared between a Session's cipher and every codec forked
/// from it, so metrics and logging attribute to the same client regardless
/// of which direction's instance recorded them.
struct AccessUserContext {
    port: u16,
    psk: Vec<u8>,
    peer_ip: Mutex<Option<SocketAddr>>,
    tcp_sessions: AtomicI64,
}

/// Chunked-AEAD cipher: each call to `encrypt`/`decrypt` operates on
/// arbitrary-length byte slices, internally framed as `len(2) || ciphertext+tag`
/// chunks no larger than `MAX_CHUNK`. `decrypt` buffers partial chunks and
/// returns only fully-decoded plaintext, which is how the core tells "need
/// more bytes" (empty result) from "got a frame" (non-empty result).
///
/// Each direction of a connection derives its own key from a per-stream
/// random salt, exactly as Shadowsocks's AEAD construction does: the
/// encrypting side generates the salt and sends it as a plaintext prefix
/// on its first `encrypt` call; the decrypting side reads that prefix on
/// its first `decrypt` call before it can derive the same key. This is why
/// a `Chacha20Cipher` used purely for encryption and one used purely for
/// decryption need never share a salt up front — the wire carries it.
pub struct Chacha20Cipher {
    ctx: Arc<AccessUserContext>,
    aead: Option<ChaCha20Poly1305>,
    nonce_counter: u64,
    recv_buf: Vec<u8>,
}

impl Chacha20Cipher {
    fn derive_key(psk: &[u8], salt: &[u8; SALT_LEN]) -> Key {
        let hk = Hkdf::<Sha256>::new(Some(salt), psk);
        let mut key_bytes = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key_bytes)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Key::from(key_bytes)
    }

    fn new(ctx: Arc<AccessUserContext>) -> Self {
        Self {
            ctx,
            aead: None,
            nonce_counter: 0,
            recv_buf: Vec::new(),
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        Nonce::from(bytes)
    }
}

impl Cipher for Chacha20Cipher {
    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.recv_buf.extend_from_slice(data);

        if self.aead.is_none() {
            if self.recv_buf.len() < SALT_LEN {
                return Ok(Vec::new());
            }
            let salt: [u8; SALT_LEN] = self.recv_buf[..SALT_LEN].try_into().expect("checked length above");
            self.aead = Some(ChaCha20Poly1305::new(&Self::derive_key(&self.ctx.psk, &salt)));
            self.recv_buf.drain(..SALT_LEN);
        }

        let mut out = Vec::new();
        loop {
            if self.recv_buf.len() < LEN_PREFIX {
                break;
            }
            let len = u16::from_be_bytes([self.recv_buf[0], self.recv_buf[1]]) as usize;
            let frame_end = LEN_PREFIX + len + TAG_LEN;
            if self.recv_buf.len() < frame_end {
                break;
            }

            let nonce = self.next_nonce();
            let ciphertext = &self.recv_buf[LEN_PREFIX..frame_end];
            let plaintext = self
                .aead
                .as_ref()
                .expect("derived above")
                .decrypt(&nonce, ciphertext)
                .map_err(|e| CipherError::DecryptFailed(e.to_string()))?;
            out.extend_from_slice(&plaintext);
            self.recv_buf.drain(..frame_end);
        }

        Ok(out)
    }

    fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + data.len() + TAG_LEN + LEN_PREFIX);

        if self.aead.is_none() {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            self.aead = Some(ChaCha20Poly1305::new(&Self::derive_key(&self.ctx.psk, &salt)));
            out.extend_from_slice(&salt);
        }

        for chunk in data.chunks(MAX_CHUNK) {
            let nonce = self.next_nonce();
            let ciphertext = self
                .aead
                .as_ref()
                .expect("derived above")
                .encrypt(&nonce, chunk)
                .expect("ChaCha20Poly1305 encryption does not fail on valid input");
            out.extend_from_slice(&(ciphertext.len() as u16 - TAG_LEN as u16).to_be_bytes());
            out.extend_from_slice(&ciphertext);
        }
        out
    }

    fn record_user_ip(&mut self, peer: SocketAddr) {
        *self.ctx.peer_ip.lock() = Some(peer);
        debug!(port = self.ctx.port, %peer, "recorded user ip");
    }

    fn incr_user_tcp_num(&mut self, delta: i64) {
        self.ctx.tcp_sessions.fetch_add(delta, Ordering::Relaxed);
    }

    fn fork(&self) -> Box<dyn Cipher> {
        Box::new(Self::new(self.ctx.clone()))
    }
}

/// Builds a [`Chacha20Cipher`] for every port from a single pre-shared key.
///
/// A real multi-user deployment would look `port` up in a per-user table;
/// this reference factory uses the same key everywhere, which is sufficient
/// for a single-tenant relay and for the test suite.
pub struct Chacha20CipherFactory {
    psk: Vec<u8>,
}

impl Chacha20CipherFactory {
    pub fn new(password: &str) -> Self {
        Self {
            psk: password.as_bytes().to_vec(),
        }
    }
}

impl CipherFactory for Chacha20CipherFactory {
    fn get_cipher_by_port(&self, port: u16, transport: Transport) -> Box<dyn Cipher> {
        debug!(port, transport = transport.as_str(), "binding cipher for port");
        let ctx = Arc::new(AccessUserContext {
            port,
            psk: self.psk.clone(),
            peer_ip: Mutex::new(None),
            tcp_sessions: AtomicI64::new(0),
        });
        Box::new(Chacha20Cipher::new(ctx))
    }
}
