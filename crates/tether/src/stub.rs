//! Client-side stand-in for a remote object

use crate::descriptor::{Descriptor, PropertyKind};
use crate::error::{BridgeError, RemoteError};
use crate::stream::{DefaultStreamConstructor, EventFeed, StreamConstructor, Subscription};
use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};
use tether_proto::{Address, Message, Request, Value};
use tether_transport::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

type PendingReply = BoxFuture<'static, Result<Value, RemoteError>>;

/// State shared by a stub and every handle it hands out
pub(crate) struct StubContext {
    pub(crate) channel: String,
    pub(crate) address: Address,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) disconnected: CancellationToken,
    pub(crate) stream_constructor: Arc<dyn StreamConstructor>,
    /// Subscriptions whose handle is still alive
    open: Mutex<HashSet<Uuid>>,
}

/// Removes a reply listener when the pending call goes away
struct ListenerGuard {
    transport: Arc<dyn Transport>,
    address: Address,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.transport.remove_listener(&self.address);
    }
}

impl StubContext {
    /// Send a `Get` or `Apply` and wait for its reply
    ///
    /// The request goes out immediately. If the transport disconnects before
    /// the reply arrives the returned future never resolves.
    fn request(&self, request: Request) -> PendingReply {
        let request_id = request.id();
        let reply_address = request.reply_address();

        let mut replies = match self.transport.listen(&reply_address) {
            Ok(replies) => replies,
            Err(e) => return future::ready(Err(RemoteError::from(e))).boxed(),
        };
        let guard = ListenerGuard {
            transport: Arc::clone(&self.transport),
            address: reply_address,
        };

        trace!("[{}] sending {} request {}", self.channel, request.kind(), request_id);
        if let Err(e) = self.transport.send(&self.address, Message::request(request)) {
            drop(guard);
            if e.is_disconnected() {
                debug!("[{}] request {} abandoned, transport is down", self.channel, request_id);
                return future::pending().boxed();
            }
            warn!("[{}] failed to send request {}: {}", self.channel, request_id, e);
            return future::ready(Err(RemoteError::from(e))).boxed();
        }

        let disconnected = self.disconnected.clone();
        let channel = self.channel.clone();
        async move {
            let reply = tokio::select! {
                biased;
                reply = replies.recv() => reply,
                _ = disconnected.cancelled() => None,
            };
            drop(guard);

            match reply {
                Some(Message::Response(response)) => response.into_result().map_err(RemoteError::from),
                Some(other) => Err(RemoteError::new(
                    "ProtocolError",
                    format!("unexpected reply to request {}: {:?}", request_id, other),
                )),
                None => {
                    debug!("[{}] request {} abandoned after disconnect", channel, request_id);
                    future::pending().await
                }
            }
        }
        .boxed()
    }

    /// Open a subscription; the request goes out immediately
    pub(crate) fn subscribe(self: &Arc<Self>, prop_key: &str, args: Option<Vec<Value>>) -> Subscription {
        let request = Request::subscribe(prop_key, args);
        let subscription_id = request.id();
        let address = request.reply_address();

        let listener = match self.transport.listen(&address) {
            Ok(listener) => listener,
            Err(e) => {
                return Subscription::new(Arc::clone(self), EventFeed::failed(subscription_id, e.into()));
            }
        };
        let feed = EventFeed::new(subscription_id, listener, self.disconnected.clone());

        if let Err(e) = self.transport.send(&self.address, Message::request(request)) {
            if e.is_disconnected() {
                // the feed sees the cancelled token and never yields
                debug!("[{}] subscription {} abandoned, transport is down", self.channel, subscription_id);
            } else {
                warn!("[{}] failed to subscribe to [{}]: {}", self.channel, prop_key, e);
                self.transport.remove_listener(&address);
                return Subscription::new(Arc::clone(self), EventFeed::failed(subscription_id, e.into()));
            }
        }

        debug!("[{}] subscription {} opened on [{}]", self.channel, subscription_id, prop_key);
        Subscription::new(Arc::clone(self), feed)
    }

    pub(crate) fn track(&self, subscription_id: Uuid) {
        self.open().insert(subscription_id);
    }

    pub(crate) fn forget(&self, subscription_id: Uuid) {
        self.open().remove(&subscription_id);
    }

    fn open(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Memoized handle to a `Value` property
///
/// All clones observe the same underlying request. Resolves to the value the
/// host read, or to the error it failed with.
#[derive(Clone)]
pub struct RemoteValue {
    prop_key: Arc<str>,
    reply: Shared<PendingReply>,
}

impl RemoteValue {
    /// Property this handle reads
    pub fn prop_key(&self) -> &str {
        &self.prop_key
    }

    /// Whether both handles share the same underlying request
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Shared::ptr_eq(&self.reply, &other.reply)
    }

    /// Wait for the value and deserialize it
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T, RemoteError> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for RemoteValue {
    type Output = Result<Value, RemoteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.reply.poll_unpin(cx)
    }
}

impl fmt::Debug for RemoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteValue").field("prop_key", &self.prop_key).finish()
    }
}

/// One in-flight invocation of a remote function
pub struct RemoteCall {
    request_id: Uuid,
    reply: PendingReply,
}

impl RemoteCall {
    /// Correlation id of the underlying request
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the result and deserialize it
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T, RemoteError> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for RemoteCall {
    type Output = Result<Value, RemoteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.reply.poll_unpin(cx)
    }
}

impl fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCall").field("request_id", &self.request_id).finish()
    }
}

struct Handle {
    ctx: Arc<StubContext>,
    prop_key: String,
}

/// Memoized handle to a `Function` property
///
/// Each [`call`](Self::call) sends a fresh request.
#[derive(Clone)]
pub struct RemoteFunction {
    inner: Arc<Handle>,
}

impl RemoteFunction {
    /// Invoke the remote function with positional arguments
    pub fn call(&self, args: Vec<Value>) -> RemoteCall {
        let request = Request::apply(self.inner.prop_key.clone(), args);
        RemoteCall {
            request_id: request.id(),
            reply: self.inner.ctx.request(request),
        }
    }

    /// Property this handle invokes
    pub fn prop_key(&self) -> &str {
        &self.inner.prop_key
    }

    /// Whether both handles are the same memoized function
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction").field("prop_key", &self.inner.prop_key).finish()
    }
}

struct StreamHandle {
    ctx: Arc<StubContext>,
    prop_key: String,
    args: Option<Vec<Value>>,
}

/// Handle to a remote stream
///
/// Nothing is sent until [`subscribe`](Self::subscribe); each subscription
/// is an independent stream on the host.
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<StreamHandle>,
}

impl RemoteStream {
    /// Open a new subscription
    pub fn subscribe(&self) -> Subscription {
        self.inner.ctx.subscribe(&self.inner.prop_key, self.inner.args.clone())
    }

    /// Property this stream comes from
    pub fn prop_key(&self) -> &str {
        &self.inner.prop_key
    }

    /// Whether both handles are the same stream object
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("prop_key", &self.inner.prop_key)
            .field("args", &self.inner.args)
            .finish()
    }
}

/// Memoized handle to a `FunctionStream` property
#[derive(Clone)]
pub struct RemoteStreamFunction {
    inner: Arc<Handle>,
}

impl RemoteStreamFunction {
    /// Bind arguments, producing a new stream handle on every call
    pub fn call(&self, args: Vec<Value>) -> RemoteStream {
        RemoteStream {
            inner: Arc::new(StreamHandle {
                ctx: Arc::clone(&self.inner.ctx),
                prop_key: self.inner.prop_key.clone(),
                args: Some(args),
            }),
        }
    }

    /// Property this handle invokes
    pub fn prop_key(&self) -> &str {
        &self.inner.prop_key
    }

    /// Whether both handles are the same memoized function
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RemoteStreamFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStreamFunction")
            .field("prop_key", &self.inner.prop_key)
            .finish()
    }
}

/// Any stub property handle
#[derive(Debug, Clone)]
pub enum StubMember {
    /// Handle for a `Value` property
    Value(RemoteValue),
    /// Handle for a `Function` property
    Function(RemoteFunction),
    /// Handle for a `ValueStream` property
    ValueStream(RemoteStream),
    /// Handle for a `FunctionStream` property
    FunctionStream(RemoteStreamFunction),
}

impl StubMember {
    /// Declared kind this handle was built for
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Value(_) => PropertyKind::Value,
            Self::Function(_) => PropertyKind::Function,
            Self::ValueStream(_) => PropertyKind::ValueStream,
            Self::FunctionStream(_) => PropertyKind::FunctionStream,
        }
    }
}

/// Lazily built, cached handle for one declared property
enum Accessor {
    Value(OnceLock<RemoteValue>),
    Function(OnceLock<RemoteFunction>),
    ValueStream(OnceLock<RemoteStream>),
    FunctionStream(OnceLock<RemoteStreamFunction>),
}

impl Accessor {
    fn for_kind(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Value => Self::Value(OnceLock::new()),
            PropertyKind::Function => Self::Function(OnceLock::new()),
            PropertyKind::ValueStream => Self::ValueStream(OnceLock::new()),
            PropertyKind::FunctionStream => Self::FunctionStream(OnceLock::new()),
        }
    }
}

struct StubInner {
    ctx: Arc<StubContext>,
    descriptor: Descriptor,
    accessors: BTreeMap<String, Accessor>,
}

/// Client-side object exposing exactly the properties of a descriptor
///
/// Handles are created on first access and cached for the stub's lifetime,
/// so reading the same property twice yields the same handle. Clones of a
/// stub share that cache. Undeclared properties are not reachable.
#[derive(Clone)]
pub struct Stub {
    inner: Arc<StubInner>,
}

impl Stub {
    /// Build a stub for `descriptor` over `transport`
    ///
    /// A stream constructor is required when the descriptor declares stream
    /// properties.
    pub fn new(
        descriptor: Descriptor,
        stream_constructor: Option<Arc<dyn StreamConstructor>>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        let stream_constructor = match stream_constructor {
            Some(constructor) => constructor,
            None if descriptor.has_streams() => {
                return Err(BridgeError::MissingStreamConstructor {
                    channel: descriptor.channel().to_string(),
                });
            }
            None => Arc::new(DefaultStreamConstructor),
        };

        let accessors = descriptor
            .properties()
            .map(|(name, kind)| (name.to_string(), Accessor::for_kind(kind)))
            .collect();

        let ctx = Arc::new(StubContext {
            channel: descriptor.channel().to_string(),
            address: descriptor.address(),
            disconnected: transport.disconnected(),
            transport,
            stream_constructor,
            open: Mutex::new(HashSet::new()),
        });

        debug!(
            "Created stub for [{}] with {} properties on transport {}",
            ctx.channel,
            descriptor.len(),
            ctx.transport.name()
        );

        Ok(Self {
            inner: Arc::new(StubInner {
                ctx,
                descriptor,
                accessors,
            }),
        })
    }

    /// Build a stub whose streams use [`DefaultStreamConstructor`]
    pub fn with_default_streams(
        descriptor: Descriptor,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        Self::new(descriptor, Some(Arc::new(DefaultStreamConstructor)), transport)
    }

    /// Descriptor this stub was built from
    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    /// Channel requests are sent on
    pub fn channel(&self) -> &str {
        &self.inner.ctx.channel
    }

    /// Whether the transport is still up
    pub fn is_connected(&self) -> bool {
        !self.inner.ctx.disconnected.is_cancelled()
    }

    /// Number of subscriptions whose handle is still alive
    pub fn open_subscriptions(&self) -> usize {
        self.inner.ctx.open().len()
    }

    /// Handle for any declared property; `None` for undeclared names
    ///
    /// The first access of a `Value` property sends its `Get` request.
    pub fn get(&self, key: &str) -> Option<StubMember> {
        let accessor = self.inner.accessors.get(key)?;
        let ctx = &self.inner.ctx;

        let member = match accessor {
            Accessor::Value(cell) => StubMember::Value(
                cell.get_or_init(|| RemoteValue {
                    prop_key: Arc::from(key),
                    reply: ctx.request(Request::get(key)).shared(),
                })
                .clone(),
            ),
            Accessor::Function(cell) => StubMember::Function(
                cell.get_or_init(|| RemoteFunction {
                    inner: Arc::new(Handle {
                        ctx: Arc::clone(ctx),
                        prop_key: key.to_string(),
                    }),
                })
                .clone(),
            ),
            Accessor::ValueStream(cell) => StubMember::ValueStream(
                cell.get_or_init(|| RemoteStream {
                    inner: Arc::new(StreamHandle {
                        ctx: Arc::clone(ctx),
                        prop_key: key.to_string(),
                        args: None,
                    }),
                })
                .clone(),
            ),
            Accessor::FunctionStream(cell) => StubMember::FunctionStream(
                cell.get_or_init(|| RemoteStreamFunction {
                    inner: Arc::new(Handle {
                        ctx: Arc::clone(ctx),
                        prop_key: key.to_string(),
                    }),
                })
                .clone(),
            ),
        };
        Some(member)
    }

    /// Handle for a declared `Value` property
    pub fn value(&self, key: &str) -> Option<RemoteValue> {
        match self.get(key)? {
            StubMember::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Handle for a declared `Function` property
    pub fn function(&self, key: &str) -> Option<RemoteFunction> {
        match self.get(key)? {
            StubMember::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Handle for a declared `ValueStream` property
    pub fn stream(&self, key: &str) -> Option<RemoteStream> {
        match self.get(key)? {
            StubMember::ValueStream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Handle for a declared `FunctionStream` property
    pub fn stream_function(&self, key: &str) -> Option<RemoteStreamFunction> {
        match self.get(key)? {
            StubMember::FunctionStream(function) => Some(function),
            _ => None,
        }
    }

    /// Stub properties cannot be assigned
    pub fn set(&self, key: &str, _value: Value) -> Result<(), BridgeError> {
        Err(BridgeError::ReadOnlyProperty { key: key.to_string() })
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("channel", &self.inner.ctx.channel)
            .field("properties", &self.inner.descriptor.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
