//! In-process transport pairs

use crate::{Listener, ListenerTable, Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tether_proto::{Address, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One end of an in-process connection
///
/// Messages sent on one end are delivered to the listeners installed on the
/// other. Both ends share a single disconnection token, so closing either end
/// disconnects both.
pub struct MemoryTransport {
    /// Name used to tag log lines
    name: String,
    /// Listeners installed on this end
    local: Arc<ListenerTable>,
    /// Listeners installed on the peer
    remote: Arc<ListenerTable>,
    /// Shared peer-termination signal
    disconnected: CancellationToken,
}

impl MemoryTransport {
    /// Create two connected ends, conventionally `(host, client)`
    pub fn pair() -> (Self, Self) {
        Self::named_pair("host", "client")
    }

    /// Create two connected ends with custom log names
    pub fn named_pair(first: impl Into<String>, second: impl Into<String>) -> (Self, Self) {
        let a = Arc::new(ListenerTable::new());
        let b = Arc::new(ListenerTable::new());
        let disconnected = CancellationToken::new();

        let first = Self {
            name: first.into(),
            local: Arc::clone(&a),
            remote: Arc::clone(&b),
            disconnected: disconnected.clone(),
        };
        let second = Self {
            name: second.into(),
            local: b,
            remote: a,
            disconnected,
        };
        (first, second)
    }

    /// Simulate the peer process terminating
    pub fn disconnect(&self) {
        if !self.disconnected.is_cancelled() {
            info!("[{}] in-memory connection terminated", self.name);
        }
        self.disconnected.cancel();
    }

    /// Number of listeners installed on this end
    pub fn listener_count(&self) -> usize {
        self.local.len()
    }

    /// Whether a live listener is installed on this end for the address
    pub fn has_listener(&self, address: &Address) -> bool {
        self.local.contains(address)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn send(&self, address: &Address, message: Message) -> Result<(), TransportError> {
        if self.disconnected.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        debug!("[{}] -> {}", self.name, address);
        self.remote.deliver(address, message);
        Ok(())
    }

    fn listen(&self, address: &Address) -> Result<Listener, TransportError> {
        self.local.install(address)
    }

    fn remove_listener(&self, address: &Address) {
        self.local.remove(address);
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.disconnect();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_proto::{Request, Response};
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_pair_delivers_to_peer() {
        let (host, client) = MemoryTransport::pair();
        let channel = Address::channel("calc");
        let mut requests = host.listen(&channel).unwrap();

        let request = Request::get("count");
        let reply_to = request.reply_address();
        let mut replies = client.listen(&reply_to).unwrap();

        client.send(&channel, Message::request(request.clone())).unwrap();
        let received = timeout(Duration::from_millis(100), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Message::request(request.clone()));

        let reply = Message::response(Response::result(request.id(), json!(3)));
        host.send(&reply_to, reply.clone()).unwrap();
        assert_eq!(replies.recv().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_sends_do_not_loop_back() {
        let (host, client) = MemoryTransport::pair();
        let channel = Address::channel("calc");
        let mut own = client.listen(&channel).unwrap();

        client.send(&channel, Message::request(Request::get("count"))).unwrap();
        assert!(own.try_recv().is_err());
        assert_eq!(host.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_close_disconnects_both_ends() {
        let (host, client) = MemoryTransport::pair();
        let host_signal = host.disconnected();
        assert!(host.is_connected());

        client.close().await.unwrap();

        timeout(Duration::from_millis(100), host_signal.cancelled())
            .await
            .unwrap();
        assert!(!host.is_connected());
        assert!(matches!(
            host.send(&Address::channel("calc"), Message::request(Request::get("a"))),
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let (host, _client) = MemoryTransport::pair();
        let channel = Address::channel("calc");
        let _rx = host.listen(&channel).unwrap();
        assert!(host.has_listener(&channel));

        host.remove_listener(&channel);
        assert!(!host.has_listener(&channel));
        assert_eq!(host.name(), "host");
    }
}
