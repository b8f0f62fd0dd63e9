use thiserror::Error;

/// Errors produced by the bridging engine and its transport adapters.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream before sending any byte of a new frame.
    #[error("connection closed")]
    Disconnected,

    #[error("can't read agent message, buffer too small ({needed} > {capacity})")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("request bus closed")]
    BusClosed,

    /// Endpoint not available yet; the adapter may retry.
    #[error("endpoint unavailable: {0}")]
    Transient(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Clean end of stream, not worth logging above debug.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BridgeError::Disconnected)
    }

    /// Adapter-classified failure that a dial may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient(_))
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BridgeError::Timeout
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
