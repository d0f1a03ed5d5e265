use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised by the gateway connection and the client handle.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway closed the connection with code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    #[error("gave up after {0} reconnect attempts")]
    ReconnectLimit(u32),

    #[error("not connected to the gateway")]
    NotConnected,

    #[error("client is closed")]
    Closed,

    #[error("gateway task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Whether another connection attempt may succeed after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            GatewayError::FatalClose { .. }
                | GatewayError::ReconnectLimit(_)
                | GatewayError::Closed
                | GatewayError::Config(_)
        )
    }
}

impl From<flate2::DecompressError> for GatewayError {
    fn from(e: flate2::DecompressError) -> Self {
        GatewayError::Decompress(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("a gateway token is required")]
    MissingToken,

    #[error("cache size must be positive")]
    ZeroCacheSize,

    #[error("unknown intent: {0}")]
    UnknownIntent(String),
}

/// Failure of a one-shot event wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("no matching event within {0:?}")]
    Timeout(Duration),

    #[error("wait cancelled by client shutdown")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatcherError {
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(String),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
