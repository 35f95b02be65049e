//! Host-side request dispatch for one registered channel

use crate::target::{Member, Target, ValueStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tether_proto::{
    Address, ErrorDetails, ErrorKind, Message, Request, Response, StreamEvent, Value,
};
use tether_transport::{Listener, Transport, TransportError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Live subscription owned by a dispatcher
struct SubscriptionEntry {
    /// Distinguishes reuse of an id after the previous subscription closed
    serial: u64,
    /// Authoritative cancellation for the pump task
    token: CancellationToken,
    /// Hands the pump a terminal error to push before it stops
    abort: oneshot::Sender<ErrorDetails>,
}

/// What a pump task needs to identify and stop its subscription
struct PumpState {
    subscription_id: Uuid,
    serial: u64,
    token: CancellationToken,
    abort: oneshot::Receiver<ErrorDetails>,
}

/// Dispatcher bound to one target on one channel
///
/// The receive loop applies subscription table changes in arrival order and
/// hands `Get`/`Apply` off to their own tasks, so a slow member never stalls
/// unrelated requests.
pub(crate) struct Dispatcher {
    /// Channel this dispatcher listens on
    channel: String,
    /// Object requests are resolved against
    target: Arc<dyn Target>,
    /// Transport replies and pushes go out on
    transport: Arc<dyn Transport>,
    /// Open subscriptions by id
    subscriptions: Mutex<HashMap<Uuid, SubscriptionEntry>>,
    /// Serial for the next subscription entry
    next_serial: AtomicU64,
    /// Cancelled on unregistration; parent of every subscription token
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Install the channel listener and start the receive loop
    pub(crate) fn start(
        channel: String,
        target: Arc<dyn Target>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = transport.listen(&Address::channel(channel.clone()))?;

        let dispatcher = Arc::new(Self {
            channel,
            target,
            transport,
            subscriptions: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&dispatcher).run(listener));
        Ok(dispatcher)
    }

    /// Channel this dispatcher serves
    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    /// Number of open subscriptions
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Stop serving: remove the listener and cancel every live subscription
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        self.transport.remove_listener(&Address::channel(self.channel.clone()));
        let closed = {
            let mut subscriptions = self.subscriptions();
            let closed = subscriptions.len();
            subscriptions.clear();
            closed
        };
        debug!("[{}] dispatcher shut down, {} subscriptions cancelled", self.channel, closed);
    }

    async fn run(self: Arc<Self>, mut listener: Listener) {
        let disconnected = self.transport.disconnected();
        info!("[{}] dispatcher started", self.channel);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("[{}] receive loop stopped by unregistration", self.channel);
                    break;
                }

                _ = disconnected.cancelled() => {
                    // pumps watch the same signal and abandon their streams
                    info!("[{}] sender disconnected", self.channel);
                    break;
                }

                message = listener.recv() => {
                    match message {
                        Some(Message::Request(request)) => self.handle_request(request),
                        Some(other) => {
                            warn!("[{}] ignoring non-request message: {:?}", self.channel, other);
                        }
                        None => {
                            debug!("[{}] listener removed", self.channel);
                            break;
                        }
                    }
                }
            }
        }

        info!("[{}] dispatcher stopped", self.channel);
    }

    fn handle_request(self: &Arc<Self>, request: Request) {
        debug!(
            "[{}] handling {} request: id={}, prop={:?}",
            self.channel,
            request.kind(),
            request.id(),
            request.prop_key()
        );

        match request {
            Request::Get { id, prop_key } => {
                let member = self.read_member(&prop_key);
                self.spawn_reply(id, async move { resolve_get(&prop_key, member).await });
            }
            Request::Apply { id, prop_key, args } => {
                let member = self.read_member(&prop_key);
                self.spawn_reply(id, async move { resolve_apply(&prop_key, member, args).await });
            }
            Request::Subscribe { subscription_id, prop_key, args } => {
                self.subscribe(subscription_id, &prop_key, args);
            }
            Request::Unsubscribe { subscription_id } => {
                self.unsubscribe(subscription_id);
            }
        }
    }

    /// Read a member with the target itself as receiver
    fn read_member(&self, prop_key: &str) -> Option<Member> {
        Arc::clone(&self.target).member(prop_key)
    }

    fn spawn_reply<F>(self: &Arc<Self>, request_id: Uuid, outcome: F)
    where
        F: std::future::Future<Output = Result<Value, ErrorDetails>> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = this.shutdown.cancelled() => {
                    debug!("[{}] dropping request {} on unregistration", this.channel, request_id);
                    return;
                }
                outcome = outcome => outcome,
            };

            let response = match outcome {
                Ok(value) => Response::result(request_id, value),
                Err(error) => {
                    debug!("[{}] request {} failed: {}", this.channel, request_id, error);
                    Response::error(request_id, error)
                }
            };
            this.send(&Address::Reply(request_id), Message::response(response));
        });
    }

    fn subscribe(self: &Arc<Self>, subscription_id: Uuid, prop_key: &str, args: Option<Vec<Value>>) {
        let existing = self.subscriptions().remove(&subscription_id);
        if let Some(entry) = existing {
            warn!(
                "[{}] subscription {} is already open, closing it",
                self.channel, subscription_id
            );
            let error = ErrorDetails::of_kind(
                ErrorKind::DuplicateSubscription,
                format!("Subscription [{}] is already open", subscription_id),
            );
            // the pump pushes the error as its last event, then drops the upstream
            if let Err(error) = entry.abort.send(error) {
                self.send_stream_error(subscription_id, error);
            }
            entry.token.cancel();
            return;
        }

        let stream = match self.open_stream(prop_key, args) {
            Ok(stream) => stream,
            Err(error) => {
                debug!("[{}] subscribe to [{}] failed: {}", self.channel, prop_key, error);
                self.send_stream_error(subscription_id, error);
                return;
            }
        };

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let (abort_tx, abort_rx) = oneshot::channel();
        self.subscriptions().insert(
            subscription_id,
            SubscriptionEntry {
                serial,
                token: token.clone(),
                abort: abort_tx,
            },
        );

        debug!("[{}] subscription {} opened on [{}]", self.channel, subscription_id, prop_key);
        let pump = PumpState {
            subscription_id,
            serial,
            token,
            abort: abort_rx,
        };
        tokio::spawn(Arc::clone(self).pump(pump, stream));
    }

    fn open_stream(&self, prop_key: &str, args: Option<Vec<Value>>) -> Result<ValueStream, ErrorDetails> {
        let member = self.read_member(prop_key);

        let resolved = match args {
            Some(args) => match member {
                Some(Member::Function(method)) => method(args).map_err(ErrorDetails::from)?,
                _ => return Err(ErrorDetails::not_a_function(prop_key)),
            },
            None => member.ok_or_else(|| ErrorDetails::not_a_stream(prop_key))?,
        };

        match resolved {
            Member::Stream(stream) => Ok(stream),
            _ => Err(ErrorDetails::not_a_stream(prop_key)),
        }
    }

    async fn pump(self: Arc<Self>, pump: PumpState, mut stream: ValueStream) {
        let PumpState {
            subscription_id,
            serial,
            token,
            mut abort,
        } = pump;
        let address = Address::Subscription(subscription_id);
        let disconnected = self.transport.disconnected();

        loop {
            let item = tokio::select! {
                biased;

                error = &mut abort => {
                    // a dropped sender means the entry is gone and the token fired
                    if let Ok(error) = error {
                        self.send_stream_error(subscription_id, error);
                        debug!(
                            "[{}] subscription {} closed by duplicate subscribe",
                            self.channel, subscription_id
                        );
                    }
                    break;
                }
                _ = token.cancelled() => {
                    debug!("[{}] subscription {} cancelled", self.channel, subscription_id);
                    break;
                }
                _ = disconnected.cancelled() => {
                    debug!("[{}] subscription {} abandoned after disconnect", self.channel, subscription_id);
                    break;
                }
                item = stream.next() => item,
            };

            let event = match item {
                Some(Ok(value)) => StreamEvent::Next { subscription_id, value },
                Some(Err(error)) => StreamEvent::Error {
                    subscription_id,
                    error: error.into(),
                },
                None => StreamEvent::Complete { subscription_id },
            };
            let terminal = event.is_terminal();
            if terminal {
                // closed before the terminal push so a racing unsubscribe sees it gone
                self.release(subscription_id, serial);
            }

            match self.transport.send(&address, Message::stream(event)) {
                Ok(()) => trace!("[{}] pushed to {}", self.channel, address),
                Err(TransportError::Disconnected) => break,
                Err(e) => {
                    error!("[{}] failed to push to {}: {}", self.channel, address, e);
                    break;
                }
            }

            if terminal {
                debug!("[{}] subscription {} finished", self.channel, subscription_id);
                break;
            }
        }

        self.release(subscription_id, serial);
        // dropping the upstream stream stops its producer
        drop(stream);
    }

    fn unsubscribe(&self, subscription_id: Uuid) {
        let entry = self.subscriptions().remove(&subscription_id);
        match entry {
            Some(entry) => {
                entry.token.cancel();
                debug!("[{}] subscription {} closed by client", self.channel, subscription_id);
            }
            None => {
                warn!("[{}] unsubscribe for unknown subscription {}", self.channel, subscription_id);
                self.send_stream_error(
                    subscription_id,
                    ErrorDetails::of_kind(
                        ErrorKind::SubscriptionNotFound,
                        format!("Subscription [{}] not found", subscription_id),
                    ),
                );
            }
        }
    }

    /// Drop a table entry if it still belongs to the given subscription
    fn release(&self, subscription_id: Uuid, serial: u64) {
        let mut subscriptions = self.subscriptions();
        if subscriptions
            .get(&subscription_id)
            .is_some_and(|entry| entry.serial == serial)
        {
            subscriptions.remove(&subscription_id);
        }
    }

    fn send_stream_error(&self, subscription_id: Uuid, error: ErrorDetails) {
        let event = StreamEvent::Error { subscription_id, error };
        self.send(&Address::Subscription(subscription_id), Message::stream(event));
    }

    fn send(&self, address: &Address, message: Message) {
        match self.transport.send(address, message) {
            Ok(()) => trace!("[{}] sent to {}", self.channel, address),
            Err(TransportError::Disconnected) => {
                debug!("[{}] peer gone, reply to {} abandoned", self.channel, address);
            }
            Err(e) => error!("[{}] failed to send to {}: {}", self.channel, address, e),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<Uuid, SubscriptionEntry>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn resolve_get(prop_key: &str, member: Option<Member>) -> Result<Value, ErrorDetails> {
    match member {
        None => Ok(Value::Null),
        Some(member) => resolve_value(prop_key, member).await,
    }
}

async fn resolve_apply(prop_key: &str, member: Option<Member>, args: Vec<Value>) -> Result<Value, ErrorDetails> {
    match member {
        Some(Member::Function(method)) => {
            let result = method(args).map_err(ErrorDetails::from)?;
            resolve_value(prop_key, result).await
        }
        _ => Err(ErrorDetails::not_a_function(prop_key)),
    }
}

async fn resolve_value(prop_key: &str, member: Member) -> Result<Value, ErrorDetails> {
    match member {
        Member::Value(value) => Ok(value),
        Member::Pending(pending) => pending.await.map_err(ErrorDetails::from),
        Member::Function(_) | Member::Stream(_) => Err(ErrorDetails::not_a_value(prop_key)),
    }
}
