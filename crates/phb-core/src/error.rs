use thiserror::Error;

/// Errors produced by the gateway protocol layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("gateway already claimed")]
    AlreadyClaimed,

    #[error("state store error: {0}")]
    State(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GwResult<T> = Result<T, GatewayError>;
