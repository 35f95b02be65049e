//! Client-side streams
//!
//! A subscription's raw pushes arrive as an [`EventFeed`]. A
//! [`StreamConstructor`] turns that feed into the stream of values the
//! caller consumes, so applications can plug in their own buffering or
//! mapping. [`DefaultStreamConstructor`] yields each value and ends on
//! completion or after the first error.

use crate::error::RemoteError;
use crate::stub::StubContext;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tether_proto::{Address, Message, Request, StreamEvent, Value};
use tether_transport::{Listener, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Raw events pushed for one subscription
///
/// Yields `Next` events, then at most one terminal `Error` or `Complete`,
/// then ends. Once the transport disconnects it stops yielding and never
/// ends.
pub struct EventFeed {
    subscription_id: Uuid,
    listener: Option<Listener>,
    /// Locally produced terminal event
    queued: Option<StreamEvent>,
    disconnected: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl EventFeed {
    pub(crate) fn new(subscription_id: Uuid, listener: Listener, disconnected: CancellationToken) -> Self {
        Self {
            subscription_id,
            listener: Some(listener),
            queued: None,
            disconnected,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Feed for a subscription that could not be opened
    pub(crate) fn failed(subscription_id: Uuid, error: RemoteError) -> Self {
        Self {
            subscription_id,
            listener: None,
            queued: Some(StreamEvent::Error {
                subscription_id,
                error: error.into(),
            }),
            disconnected: CancellationToken::new(),
            // nothing is open on the host, so there is nothing to unsubscribe
            finished: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Subscription this feed belongs to
    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }
}

impl Stream for EventFeed {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = &mut *self;

        if let Some(event) = this.queued.take() {
            this.listener = None;
            return Poll::Ready(Some(event));
        }

        let Some(listener) = this.listener.as_mut() else {
            return Poll::Ready(None);
        };

        loop {
            if this.disconnected.is_cancelled() {
                return Poll::Pending;
            }

            match listener.poll_recv(cx) {
                Poll::Ready(Some(Message::Stream(event)))
                    if event.subscription_id() == this.subscription_id =>
                {
                    if event.is_terminal() {
                        this.finished.store(true, Ordering::Release);
                        this.listener = None;
                    }
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(other)) => {
                    warn!("subscription {} ignoring unexpected message: {:?}", this.subscription_id, other);
                }
                // listener removed during teardown; treat like a disconnect
                Poll::Ready(None) => return Poll::Pending,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscription_id", &self.subscription_id)
            .field("finished", &self.finished.load(Ordering::Acquire))
            .finish()
    }
}

/// Builds the caller-facing stream for a subscription
pub trait StreamConstructor: Send + Sync + 'static {
    /// Turn raw events into values
    fn construct(&self, feed: EventFeed) -> BoxStream<'static, Result<Value, RemoteError>>;
}

impl<F> StreamConstructor for F
where
    F: Fn(EventFeed) -> BoxStream<'static, Result<Value, RemoteError>> + Send + Sync + 'static,
{
    fn construct(&self, feed: EventFeed) -> BoxStream<'static, Result<Value, RemoteError>> {
        self(feed)
    }
}

/// Yields values, ends on `Complete`, yields one `Err` and ends on `Error`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStreamConstructor;

impl StreamConstructor for DefaultStreamConstructor {
    fn construct(&self, feed: EventFeed) -> BoxStream<'static, Result<Value, RemoteError>> {
        stream::unfold(Some(feed), |feed| async move {
            let mut feed = feed?;
            match feed.next().await? {
                StreamEvent::Next { value, .. } => Some((Ok(value), Some(feed))),
                StreamEvent::Error { error, .. } => Some((Err(error.into()), None)),
                StreamEvent::Complete { .. } => None,
            }
        })
        .boxed()
    }
}

/// Sends `Unsubscribe` for a subscription that is still open
struct Closer {
    ctx: Arc<StubContext>,
    subscription_id: Uuid,
    finished: Arc<AtomicBool>,
}

impl Closer {
    fn close(self) {
        let address = Address::Subscription(self.subscription_id);
        self.ctx.forget(self.subscription_id);
        self.ctx.transport.remove_listener(&address);

        if self.finished.load(Ordering::Acquire) {
            return;
        }

        let request = Request::unsubscribe(self.subscription_id);
        match self.ctx.transport.send(&self.ctx.address, Message::request(request)) {
            Ok(()) => debug!("[{}] unsubscribed {}", self.ctx.channel, self.subscription_id),
            Err(TransportError::Disconnected) => {}
            Err(e) => warn!("[{}] failed to unsubscribe {}: {}", self.ctx.channel, self.subscription_id, e),
        }
    }
}

/// Live subscription to a remote stream
///
/// Dropping it, or calling [`unsubscribe`](Self::unsubscribe), closes the
/// stream on the host unless the host already ended it.
pub struct Subscription {
    subscription_id: Uuid,
    values: BoxStream<'static, Result<Value, RemoteError>>,
    finished: Arc<AtomicBool>,
    closer: Option<Closer>,
}

impl Subscription {
    pub(crate) fn new(ctx: Arc<StubContext>, feed: EventFeed) -> Self {
        let subscription_id = feed.subscription_id();
        let finished = feed.finished_flag();
        ctx.track(subscription_id);

        let values = ctx.stream_constructor.construct(feed);
        Self {
            subscription_id,
            values,
            finished: Arc::clone(&finished),
            closer: Some(Closer {
                ctx,
                subscription_id,
                finished,
            }),
        }
    }

    /// Id the host knows this subscription by
    pub fn id(&self) -> Uuid {
        self.subscription_id
    }

    /// Whether the host has sent its terminal event
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Close the subscription
    pub fn unsubscribe(mut self) {
        if let Some(closer) = self.closer.take() {
            closer.close();
        }
    }
}

impl Stream for Subscription {
    type Item = Result<Value, RemoteError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.values.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer.close();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscription_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
