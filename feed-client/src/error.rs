use crate::deduplication::DeduplicationError;
use thiserror::Error;

/// Normalized failure of a notification fetch, as seen by error subscribers
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error(transparent)]
    Request(#[from] DeduplicationError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Failed to decode notifications: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::Load(Box::new(error))
    }
}

/// Failure reported by a [`Transport`](crate::client::Transport)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Connection failed: {0}")]
    Connection(String),
}
