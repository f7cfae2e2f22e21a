//! Server side of a Shadowsocks-style encrypted TCP/UDP tunnel.
//!
//! [`session`] holds the per-connection protocol state machine; [`remote`]
//! holds the two upstream-facing halves (TCP and UDP); [`acceptor`] wires
//! both into listening sockets. [`cipher`] is the trait boundary to the AEAD
//! codec; [`crypto`] supplies one concrete implementation of it.

pub mod acceptor;
pub mod cipher;
pub mod config;
pub mod crypto;
pub mod error;
pub mod header;
pub mod metrics;
pub mod remote;
pub mod session;

pub use acceptor::{TcpAcceptor, UdpAcceptor};
pub use cipher::{Cipher, CipherFactory};
pub use config::Config;
pub use error::RelayError;
pub use session::Session;

/// Transport a [`Session`] is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}
