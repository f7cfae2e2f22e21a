use std::net::SocketAddr;

/// Error taxonomy for a single session's lifetime.
///
/// Every variant corresponds to one row of the error-handling policy table: the
/// session tears down both halves exactly once after logging the failure.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("decrypt failed for {peer}: {source}")]
    Decrypt {
        peer: SocketAddr,
        source: crate::cipher::CipherError,
    },

    #[error("header parse failed for {peer}")]
    HeaderParse { peer: SocketAddr },

    #[error("connect to {dst_host}:{dst_port} failed: {source}")]
    Connect {
        dst_host: String,
        dst_port: u16,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream reply source address is neither IPv4 nor IPv6: {0}")]
    InvalidReplyAddress(SocketAddr),

    #[error("event arrived in unexpected stage {stage:?}")]
    UnknownStage { stage: crate::session::Stage },
}
