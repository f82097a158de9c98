//! Common error types

use thiserror::Error;

/// Failures reported by the transports the bridge sits between
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport busy")]
    Busy,

    #[error("channel not ready, retry later")]
    NotReady,

    #[error("endpoint is shut down")]
    Shutdown,

    #[error("no such device")]
    NoDevice,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Worth retrying on the next event, as opposed to the transport being gone
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::NotReady | Self::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
