use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("live point {0} is not in paused state")]
    NotPaused(String),
    #[error("invalid live point state: {0}")]
    InvalidState(String),
    #[error("unknown live point {0}")]
    UnknownLivePoint(String),
    #[error("unsupported protocol version {received} (expected {expected})")]
    ProtocolVersion { expected: u32, received: u32 },
    #[error("debug client disconnected before completing the handshake")]
    HandshakeAborted,
    #[error("timed out connecting to debug server at {0}")]
    ConnectTimeout(String),
    #[error("debug server rejected request: {0}")]
    Rejected(String),
    #[error("debug connection closed")]
    ConnectionClosed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] autox_config::ConfigError),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: <non-string payload>".to_owned()
    }
}
