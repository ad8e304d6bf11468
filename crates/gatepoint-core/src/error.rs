use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by gateway points and their administrative operations.
///
/// Per-connection failures (bad frames, unknown identities, routing misses)
/// never surface here; they are logged where they happen.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
