//! The cipher boundary: §6 treats the AEAD codec as an opaque external
//! collaborator. This module defines only the trait surface the relay core
//! consumes — construction, key derivation, and framing of a concrete cipher
//! live in [`crate::crypto`], never here.

use std::net::SocketAddr;

use crate::Transport;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("cipher rejected ciphertext: {0}")]
    DecryptFailed(String),
}

/// Opaque per-connection codec. One instance decrypts inbound bytes for a
/// Session, or encrypts outbound bytes for a Remote — never both directions
/// in the same instance (see `fork`).
pub trait Cipher: Send {
    /// Decrypts `data`, returning plaintext. An empty return means the
    /// cipher consumed the bytes but has nothing to emit yet (more bytes are
    /// needed); the caller must not advance protocol state on an empty
    /// result.
    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Encrypts `data`, always producing ciphertext ready for a single send.
    fn encrypt(&mut self, data: &[u8]) -> Vec<u8>;

    /// Records the client's observed network endpoint. Called once after a
    /// successful TCP handshake.
    fn record_user_ip(&mut self, peer: SocketAddr);

    /// Adjusts the user's concurrent-TCP-session counter by `delta`.
    fn incr_user_tcp_num(&mut self, delta: i64);

    /// Produces a fresh codec instance that shares this one's access-user
    /// context (so metrics and quota attribute to the same user) but starts
    /// with independent framing state. Used by a Remote to obtain its own
    /// encrypt-direction codec from the Session's decrypt-direction one.
    fn fork(&self) -> Box<dyn Cipher>;
}

/// Looks up the cipher configured for a given listening port and transport.
pub trait CipherFactory: Send + Sync {
    fn get_cipher_by_port(&self, port: u16, transport: Transport) -> Box<dyn Cipher>;
}
