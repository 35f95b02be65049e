//! Host-side view of the object exposed through a descriptor

use crate::error::RemoteError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tether_proto::Value;

/// Asynchronously resolved member value
pub type PendingValue = BoxFuture<'static, Result<Value, RemoteError>>;

/// Continuous sequence of member values
pub type ValueStream = BoxStream<'static, Result<Value, RemoteError>>;

/// Callable member
///
/// Returning `Err` is a synchronous failure; returning a `Member::Pending`
/// that resolves to `Err` is an asynchronous one.
pub type Method = Arc<dyn Fn(Vec<Value>) -> Result<Member, RemoteError> + Send + Sync>;

/// What reading a property of the target yields
pub enum Member {
    /// Plain value
    Value(Value),
    /// Value that resolves later
    Pending(PendingValue),
    /// Callable, bound to the target it was read from
    Function(Method),
    /// Stream of values
    Stream(ValueStream),
}

impl Member {
    /// Plain value member
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Plain value member from any serializable data
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, RemoteError> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    /// Asynchronously resolved member
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }

    /// Callable member returning another member
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Member, RemoteError> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    /// Callable member whose result resolves asynchronously
    pub fn async_function<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        Self::function(move |args| Ok(Self::pending(f(args))))
    }

    /// Stream member
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Callable member returning a stream
    pub fn stream_function<F, S>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<S, RemoteError> + Send + Sync + 'static,
        S: Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        Self::function(move |args| f(args).map(Self::stream))
    }

    /// Short name of the member shape, for logs
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Pending(_) => "pending",
            Self::Function(_) => "function",
            Self::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            other => write!(f, "{}(..)", other.shape()),
        }
    }
}

/// Object exposed by a host dispatcher
///
/// `member` is called once per request, so stream members should produce a
/// fresh stream on each call. Members that need the target's own state
/// capture the `Arc<Self>` they were read from:
///
/// ```ignore
/// impl Target for Counter {
///     fn member(self: Arc<Self>, key: &str) -> Option<Member> {
///         match key {
///             "increment" => Some(Member::function(move |_| {
///                 Ok(Member::value(self.hits.fetch_add(1, Ordering::SeqCst) + 1))
///             })),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait Target: Send + Sync + 'static {
    /// Read a member by name; `None` when the target has no such member
    fn member(self: Arc<Self>, key: &str) -> Option<Member>;
}

type MemberFactory = Box<dyn Fn() -> Member + Send + Sync>;

/// Target assembled from named member factories
#[derive(Default)]
pub struct TargetMap {
    members: HashMap<String, MemberFactory>,
}

impl TargetMap {
    /// Create an empty target
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member produced by a factory on every read
    pub fn member<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Member + Send + Sync + 'static,
    {
        self.members.insert(key.into(), Box::new(factory));
        self
    }

    /// Add a plain value member
    pub fn value(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.member(key, move || Member::Value(value.clone()))
    }

    /// Add a callable member
    pub fn function<F>(self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Member, RemoteError> + Send + Sync + 'static,
    {
        let method: Method = Arc::new(f);
        self.member(key, move || Member::Function(Arc::clone(&method)))
    }

    /// Add a stream member; the factory runs once per subscription
    pub fn stream<F, S>(self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        self.member(key, move || Member::stream(factory()))
    }

    /// Names of all members
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }
}

impl Target for TargetMap {
    fn member(self: Arc<Self>, key: &str) -> Option<Member> {
        self.members.get(key).map(|factory| factory())
    }
}

/// Decode a positional argument
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, RemoteError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        RemoteError::new("TypeError", format!("argument {} is invalid: {}", index, e))
    })
}
