//! Transport error types

use tether_proto::{Address, ProtocolError};
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer (or this end) has terminated the connection
    #[error("Transport disconnected")]
    Disconnected,

    /// A listener is already installed for the address
    #[error("Address already has a listener: {0}")]
    AddressInUse(Address),

    /// Frame encoding or decoding failed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Whether this error is the peer-termination condition
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}
