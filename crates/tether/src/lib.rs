//! # Tether
//!
//! Share an object-shaped API between two processes over a message
//! transport.
//!
//! The host registers a target object under a [`Descriptor`]; the client
//! builds a [`Stub`] from the same descriptor. Reading a value, calling a
//! function or subscribing to a stream on the stub becomes a request to the
//! host, and the result, error or pushed values come back over the same
//! transport.
//!
//! ```ignore
//! let descriptor = Descriptor::builder("calc").function("add").build()?;
//!
//! // host process
//! let registration = tether::register(Arc::new(calculator), &descriptor, host_transport)?;
//!
//! // client process
//! let stub = Stub::new(descriptor, None, client_transport)?;
//! let sum = stub.function("add").unwrap().call(vec![json!(4), json!(5)]).await?;
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tether_proto as proto;
pub use tether_transport as transport;

/// Error types for the tether library
pub mod error;

/// Property schema shared by host and client
pub mod descriptor;

/// Host-side object abstraction
pub mod target;

/// Channel registrations
pub mod registry;

/// Client-side stub
pub mod stub;

/// Client-side streams
pub mod stream;

mod dispatcher;

use std::sync::Arc;

pub use descriptor::{Descriptor, DescriptorBuilder, PropertyKind};
pub use error::{BridgeError, DescriptorError, RemoteError};
pub use registry::{Registration, Registry};
pub use stream::{DefaultStreamConstructor, EventFeed, StreamConstructor, Subscription};
pub use stub::{
    RemoteCall, RemoteFunction, RemoteStream, RemoteStreamFunction, RemoteValue, Stub, StubMember,
};
pub use target::{arg, Member, Method, Target, TargetMap};
pub use tether_proto::Value;
pub use tether_transport::{IoTransport, MemoryTransport, Transport, TransportConfig};

/// Result type alias for tether operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Expose `target` on the descriptor's channel in the process-wide registry
///
/// Must be called from within a tokio runtime.
pub fn register(
    target: Arc<dyn Target>,
    descriptor: &Descriptor,
    transport: Arc<dyn Transport>,
) -> Result<Registration> {
    Registry::global().register(target, descriptor, transport)
}

/// Build a client stub; see [`Stub::new`]
pub fn create_stub(
    descriptor: Descriptor,
    stream_constructor: Option<Arc<dyn StreamConstructor>>,
    transport: Arc<dyn Transport>,
) -> Result<Stub> {
    Stub::new(descriptor, stream_constructor, transport)
}
