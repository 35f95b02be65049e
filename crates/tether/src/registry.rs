//! Channel registrations
//!
//! At most one dispatcher serves a channel per registry. Most programs use
//! the process-wide [`Registry::global`]; tests and embedders that want
//! isolation create their own with [`Registry::new`].

use crate::descriptor::Descriptor;
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::target::Target;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tether_transport::Transport;
use tracing::{debug, info};
use uuid::Uuid;

static GLOBAL: LazyLock<Arc<Registry>> = LazyLock::new(Registry::new);

struct RegistryEntry {
    /// Identifies the registration that created this entry
    registration_id: Uuid,
    dispatcher: Arc<Dispatcher>,
}

/// Table of registered channels
pub struct Registry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl Registry {
    /// Create an empty, independent registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Process-wide registry
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Expose `target` on the descriptor's channel
    ///
    /// Starts a dispatcher task, so it must be called from within a tokio
    /// runtime. Fails with [`BridgeError::DuplicateRegistration`] while
    /// another registration holds the channel.
    pub fn register(
        self: &Arc<Self>,
        target: Arc<dyn Target>,
        descriptor: &Descriptor,
        transport: Arc<dyn Transport>,
    ) -> Result<Registration, BridgeError> {
        let channel = descriptor.channel().to_string();
        let mut entries = self.entries();

        if entries.contains_key(&channel) {
            return Err(BridgeError::DuplicateRegistration { channel });
        }

        let transport_name = transport.name().to_string();
        let dispatcher = Dispatcher::start(channel.clone(), target, transport)?;
        let registration_id = Uuid::new_v4();
        entries.insert(
            channel.clone(),
            RegistryEntry {
                registration_id,
                dispatcher,
            },
        );

        info!(
            "Registered channel [{}] on transport {} ({} properties)",
            channel,
            transport_name,
            descriptor.len()
        );

        Ok(Registration {
            channel,
            registration_id,
            registry: Arc::clone(self),
        })
    }

    /// Remove whatever registration currently holds `channel`
    pub fn unregister(&self, channel: &str) -> Result<(), BridgeError> {
        let entry = self.entries().remove(channel);
        match entry {
            Some(entry) => {
                entry.dispatcher.shutdown();
                info!("Unregistered channel [{}]", channel);
                Ok(())
            }
            None => Err(BridgeError::NotRegistered {
                channel: channel.to_string(),
            }),
        }
    }

    /// Whether a dispatcher currently serves `channel`
    pub fn is_registered(&self, channel: &str) -> bool {
        self.entries().contains_key(channel)
    }

    /// Registered channel names, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = self.entries().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Open subscriptions on a channel, if it is registered
    pub fn subscription_count(&self, channel: &str) -> Option<usize> {
        self.entries()
            .get(channel)
            .map(|entry| entry.dispatcher.subscription_count())
    }

    fn remove_registration(&self, channel: &str, registration_id: Uuid) -> Result<(), BridgeError> {
        let entry = {
            let mut entries = self.entries();
            match entries.get(channel) {
                Some(entry) if entry.registration_id == registration_id => entries.remove(channel),
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                entry.dispatcher.shutdown();
                info!("Unregistered channel [{}]", entry.dispatcher.channel());
                Ok(())
            }
            None => {
                debug!("Registration {} for [{}] is no longer active", registration_id, channel);
                Err(BridgeError::NotRegistered {
                    channel: channel.to_string(),
                })
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("channels", &self.channels())
            .finish()
    }
}

/// Handle returned by a successful registration
///
/// Dropping it does not unregister; call [`Registration::unregister`].
#[derive(Clone)]
pub struct Registration {
    channel: String,
    registration_id: Uuid,
    registry: Arc<Registry>,
}

impl Registration {
    /// Channel this registration holds
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether this registration still holds its channel
    pub fn is_active(&self) -> bool {
        self.registry
            .entries()
            .get(&self.channel)
            .is_some_and(|entry| entry.registration_id == self.registration_id)
    }

    /// Stop serving the channel
    ///
    /// Cancels every live subscription and frees the channel for a new
    /// registration. Fails with [`BridgeError::NotRegistered`] if this
    /// registration was already removed, including when the channel has
    /// since been registered again by someone else.
    pub fn unregister(&self) -> Result<(), BridgeError> {
        self.registry.remove_registration(&self.channel, self.registration_id)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("channel", &self.channel)
            .field("registration_id", &self.registration_id)
            .finish()
    }
}

#[cfg(test)]
mod tests;
