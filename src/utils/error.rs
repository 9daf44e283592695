use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolyProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unsupported protocol: {0}")]
    Unsupported(String),

    #[error("Closed by policy: {0}")]
    ClosedByPolicy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, PolyProxyError>;
