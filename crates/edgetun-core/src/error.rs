use thiserror::Error;

/// Errors produced by the edgetun classification and dialing layers.
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("control message failed: {0}")]
    Control(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for EdgeError {
    fn from(e: serde_json::Error) -> Self {
        EdgeError::Control(e.to_string())
    }
}

pub type EdgeResult<T> = Result<T, EdgeError>;
