//! Errors returned by the bridge's public operations

use common::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Port {0} does not exist")]
    InvalidPort(usize),

    #[error("No port is bound to peer channel '{0}'")]
    UnknownChannel(String),

    #[error("Failed to enable endpoint: {0}")]
    Endpoint(TransportError),

    #[error("Port {0} already has a USB function attached")]
    AlreadyAttached(usize),

    #[error("Port {0} has no USB function attached")]
    NotAttached(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Common(#[from] common::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
