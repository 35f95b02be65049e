//! Transport abstraction and shared listener bookkeeping

use crate::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tether_proto::{Address, Message, MAX_FRAME_SIZE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receiving half of an installed listener
pub type Listener = mpsc::UnboundedReceiver<Message>;

/// Message transport between a host and a client
///
/// Delivery is fire-and-forget and ordered per address. Exactly one listener
/// may be installed for an address at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a message to an address on the peer
    fn send(&self, address: &Address, message: Message) -> Result<(), TransportError>;

    /// Install the listener for an address on this end
    fn listen(&self, address: &Address) -> Result<Listener, TransportError>;

    /// Remove the listener for an address, if any
    fn remove_listener(&self, address: &Address);

    /// Token cancelled once the peer (or this end) terminates
    fn disconnected(&self) -> CancellationToken;

    /// Whether the connection is still up
    fn is_connected(&self) -> bool {
        !self.disconnected().is_cancelled()
    }

    /// Terminate this end of the connection
    async fn close(&self) -> Result<(), TransportError>;

    /// Name used to tag log lines
    fn name(&self) -> &str;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Name used to tag log lines
    pub name: String,
    /// Largest encoded frame accepted in either direction
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    /// Config with a custom name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Check the configuration for values no transport can work with
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_frame_size == 0 {
            return Err(TransportError::Configuration(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-end table of installed listeners
#[derive(Debug, Default)]
pub struct ListenerTable {
    listeners: Mutex<HashMap<Address, mpsc::UnboundedSender<Message>>>,
}

impl ListenerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a listener; a listener whose receiver was dropped is replaced
    pub fn install(&self, address: &Address) -> Result<Listener, TransportError> {
        let mut listeners = self.lock();
        if let Some(existing) = listeners.get(address) {
            if !existing.is_closed() {
                return Err(TransportError::AddressInUse(address.clone()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.clone(), tx);
        trace!("Installed listener for {}", address);
        Ok(rx)
    }

    /// Remove the listener for an address
    pub fn remove(&self, address: &Address) -> bool {
        let removed = self.lock().remove(address).is_some();
        if removed {
            trace!("Removed listener for {}", address);
        }
        removed
    }

    /// Hand a message to the listener for its address
    ///
    /// Returns `false` when nobody is listening; the message is dropped.
    pub fn deliver(&self, address: &Address, message: Message) -> bool {
        let mut listeners = self.lock();
        match listeners.get(address) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    listeners.remove(address);
                    debug!("Listener for {} went away, dropping message", address);
                    return false;
                }
                true
            }
            None => {
                trace!("No listener for {}, dropping message", address);
                false
            }
        }
    }

    /// Whether a live listener is installed for the address
    pub fn contains(&self, address: &Address) -> bool {
        self.lock().get(address).is_some_and(|tx| !tx.is_closed())
    }

    /// Number of installed listeners
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listener is installed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Address, mpsc::UnboundedSender<Message>>> {
        // a panic while holding the lock leaves the map itself consistent
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
