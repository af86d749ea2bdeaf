use crate::messages::RetCode;
use thiserror::Error;

/// Errors produced by the DG-Lab protocol layer.
#[derive(Debug, Error)]
pub enum DgLabError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("link closed")]
    Closed,

    #[error("terminal is not bound to an app")]
    NotBound,

    /// A single pulse submission is longer than the App accepts per message.
    #[error("pulse data too long: {count} operations (max {max})")]
    PulseTooLong { count: usize, max: usize },

    #[error("relay returned {0:?} ({code})", code = .0.code())]
    Protocol(RetCode),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for DgLabError {
    fn from(e: serde_json::Error) -> Self {
        DgLabError::Codec(e.to_string())
    }
}

pub type DgLabResult<T> = Result<T, DgLabError>;
