use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("JavaScript execution error: {0}")]
    JavaScriptExecution(String),

    #[error("Script context initialization failed: {0}")]
    ContextInit(String),

    #[error("Script context pool is closed")]
    PoolClosed,

    #[error("Configuration script {} failed: {reason}", .path.display())]
    FatalConfiguration { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl KestrelError {
    /// True for errors that must end the process once shutdown actions have run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KestrelError::FatalConfiguration { .. }
                | KestrelError::ContextInit(_)
                | KestrelError::InvalidConfig(_)
                | KestrelError::Transport(_)
        )
    }
}

impl From<std::net::AddrParseError> for KestrelError {
    fn from(err: std::net::AddrParseError) -> Self {
        KestrelError::InvalidConfig(err.to_string())
    }
}

impl From<rustls::Error> for KestrelError {
    fn from(err: rustls::Error) -> Self {
        KestrelError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KestrelError>;
