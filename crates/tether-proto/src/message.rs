//! Message types and enums

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Transport addressing key
///
/// Requests travel on a named channel. Replies to `Get`/`Apply` are addressed
/// to the caller's correlation id, and every push belonging to a subscription
/// is addressed to the subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// Logical channel a dispatcher listens on
    Channel(String),
    /// Reply slot for one `Get`/`Apply`
    Reply(Uuid),
    /// Push slot for one subscription
    Subscription(Uuid),
}

impl Address {
    /// Address of a named channel
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(name) => write!(f, "channel:{}", name),
            Self::Reply(id) => write!(f, "reply:{}", id),
            Self::Subscription(id) => write!(f, "subscription:{}", id),
        }
    }
}

/// Top-level message wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message
    Response(Response),
    /// Subscription push
    Stream(StreamEvent),
}

impl Message {
    /// Create a request message
    pub fn request(req: Request) -> Self {
        Self::Request(req)
    }

    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }

    /// Create a stream message
    pub fn stream(event: StreamEvent) -> Self {
        Self::Stream(event)
    }

    /// Address a reply or push for this message should be delivered to
    ///
    /// Requests return `None`: they go to the dispatcher's channel, which the
    /// message itself does not know.
    pub fn reply_address(&self) -> Option<Address> {
        match self {
            Self::Request(_) => None,
            Self::Response(resp) => Some(Address::Reply(resp.request_id())),
            Self::Stream(event) => Some(Address::Subscription(event.subscription_id())),
        }
    }
}

/// Request message types (client to host)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Read a `Value` property
    Get {
        /// Correlation id the reply is addressed to
        id: Uuid,
        /// Property name
        prop_key: String,
    },

    /// Invoke a `Function` property
    Apply {
        /// Correlation id the reply is addressed to
        id: Uuid,
        /// Property name
        prop_key: String,
        /// Positional arguments
        args: Vec<Value>,
    },

    /// Open a stream for a `ValueStream` or `FunctionStream` property
    Subscribe {
        /// Client-generated id, also the push address
        subscription_id: Uuid,
        /// Property name
        prop_key: String,
        /// Arguments when the property is a stream-returning function
        args: Option<Vec<Value>>,
    },

    /// Close a previously opened stream
    Unsubscribe {
        /// Subscription to close
        subscription_id: Uuid,
    },
}

impl Request {
    /// Create a get request with a fresh correlation id
    pub fn get(prop_key: impl Into<String>) -> Self {
        Self::Get {
            id: Uuid::new_v4(),
            prop_key: prop_key.into(),
        }
    }

    /// Create an apply request with a fresh correlation id
    pub fn apply(prop_key: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Apply {
            id: Uuid::new_v4(),
            prop_key: prop_key.into(),
            args,
        }
    }

    /// Create a subscribe request with a fresh subscription id
    pub fn subscribe(prop_key: impl Into<String>, args: Option<Vec<Value>>) -> Self {
        Self::Subscribe {
            subscription_id: Uuid::new_v4(),
            prop_key: prop_key.into(),
            args,
        }
    }

    /// Create an unsubscribe request
    pub fn unsubscribe(subscription_id: Uuid) -> Self {
        Self::Unsubscribe { subscription_id }
    }

    /// Correlation id for `Get`/`Apply`, subscription id otherwise
    pub fn id(&self) -> Uuid {
        match self {
            Self::Get { id, .. } => *id,
            Self::Apply { id, .. } => *id,
            Self::Subscribe { subscription_id, .. } => *subscription_id,
            Self::Unsubscribe { subscription_id } => *subscription_id,
        }
    }

    /// Address the reply (or pushes) for this request go to
    pub fn reply_address(&self) -> Address {
        match self {
            Self::Get { id, .. } | Self::Apply { id, .. } => Address::Reply(*id),
            Self::Subscribe { subscription_id, .. } | Self::Unsubscribe { subscription_id } => {
                Address::Subscription(*subscription_id)
            }
        }
    }

    /// Property name the request targets, if any
    pub fn prop_key(&self) -> Option<&str> {
        match self {
            Self::Get { prop_key, .. }
            | Self::Apply { prop_key, .. }
            | Self::Subscribe { prop_key, .. } => Some(prop_key),
            Self::Unsubscribe { .. } => None,
        }
    }

    /// Short name of the request kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Apply { .. } => "apply",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Terminal reply to a `Get` or `Apply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Successful result
    Result {
        /// Request this responds to
        request_id: Uuid,
        /// Resolved value
        value: Value,
    },

    /// Failure raised or rejected by the host
    Error {
        /// Request this responds to
        request_id: Uuid,
        /// Serialized error
        error: ErrorDetails,
    },
}

impl Response {
    /// Get the request ID this response corresponds to
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Result { request_id, .. } => *request_id,
            Self::Error { request_id, .. } => *request_id,
        }
    }

    /// Create a result response
    pub fn result(request_id: Uuid, value: Value) -> Self {
        Self::Result { request_id, value }
    }

    /// Create an error response
    pub fn error(request_id: Uuid, error: ErrorDetails) -> Self {
        Self::Error { request_id, error }
    }

    /// Convert into the carried outcome
    pub fn into_result(self) -> Result<Value, ErrorDetails> {
        match self {
            Self::Result { value, .. } => Ok(value),
            Self::Error { error, .. } => Err(error),
        }
    }
}

/// Push message belonging to one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Next emitted value
    Next {
        /// Owning subscription
        subscription_id: Uuid,
        /// Emitted value
        value: Value,
    },

    /// Terminal failure
    Error {
        /// Owning subscription
        subscription_id: Uuid,
        /// Serialized error
        error: ErrorDetails,
    },

    /// Terminal natural completion
    Complete {
        /// Owning subscription
        subscription_id: Uuid,
    },
}

impl StreamEvent {
    /// Get the subscription this event belongs to
    pub fn subscription_id(&self) -> Uuid {
        match self {
            Self::Next { subscription_id, .. } => *subscription_id,
            Self::Error { subscription_id, .. } => *subscription_id,
            Self::Complete { subscription_id } => *subscription_id,
        }
    }

    /// Whether no further event may follow this one
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next { .. })
    }
}

/// Canonical kinds for failures the host itself produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// `Apply`/`Subscribe` with arguments on a non-callable member
    NotAFunction,
    /// `Subscribe` resolved to something that is not a stream
    NotAStream,
    /// `Get`/`Apply` resolved to a function or stream
    NotAValue,
    /// `Subscribe` reused an open subscription id
    DuplicateSubscription,
    /// `Unsubscribe` for an unknown subscription id
    SubscriptionNotFound,
}

impl ErrorKind {
    /// Name carried in `ErrorDetails::kind`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAFunction => "NotAFunction",
            Self::NotAStream => "NotAStream",
            Self::NotAValue => "NotAValue",
            Self::DuplicateSubscription => "DuplicateSubscription",
            Self::SubscriptionNotFound => "SubscriptionNotFound",
        }
    }

    /// Parse a canonical kind name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NotAFunction" => Some(Self::NotAFunction),
            "NotAStream" => Some(Self::NotAStream),
            "NotAValue" => Some(Self::NotAValue),
            "DuplicateSubscription" => Some(Self::DuplicateSubscription),
            "SubscriptionNotFound" => Some(Self::SubscriptionNotFound),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized form of an error crossing the process boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error class or kind name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Best-effort backtrace or origin description
    pub stack: Option<String>,
    /// Additional context data
    pub context: HashMap<String, String>,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
            context: HashMap::new(),
        }
    }

    /// Create error details for a canonical host-side failure
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.as_str(), message)
    }

    /// `Remote property [key] is not a function`
    pub fn not_a_function(prop_key: &str) -> Self {
        Self::of_kind(
            ErrorKind::NotAFunction,
            format!("Remote property [{}] is not a function", prop_key),
        )
        .with_context("prop_key", prop_key)
    }

    /// `Remote property [key] is not a stream`
    pub fn not_a_stream(prop_key: &str) -> Self {
        Self::of_kind(
            ErrorKind::NotAStream,
            format!("Remote property [{}] is not a stream", prop_key),
        )
        .with_context("prop_key", prop_key)
    }

    /// `Remote property [key] is not a value`
    pub fn not_a_value(prop_key: &str) -> Self {
        Self::of_kind(
            ErrorKind::NotAValue,
            format!("Remote property [{}] is not a value", prop_key),
        )
        .with_context("prop_key", prop_key)
    }

    /// Attach a stack description
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Canonical kind, when this is a host-produced failure
    pub fn canonical_kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_name(&self.kind)
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_request_creation() {
        let req = Request::apply("add", vec![json!(4), json!(5)]);

        match &req {
            Request::Apply { prop_key, args, .. } => {
                assert_eq!(prop_key, "add");
                assert_eq!(args, &vec![json!(4), json!(5)]);
            }
            _ => panic!("Expected Apply request"),
        }
        assert_eq!(req.kind(), "apply");
        assert_eq!(req.prop_key(), Some("add"));
    }

    #[test]
    fn test_fresh_ids_per_request() {
        let a = Request::get("count");
        let b = Request::get("count");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_reply_addressing() {
        let get = Request::get("count");
        assert_eq!(get.reply_address(), Address::Reply(get.id()));

        let sub = Request::subscribe("ticks", None);
        assert_eq!(sub.reply_address(), Address::Subscription(sub.id()));

        let unsub = Request::unsubscribe(sub.id());
        assert_eq!(unsub.reply_address(), sub.reply_address());
        assert_eq!(unsub.prop_key(), None);
    }

    #[test]
    fn test_response_creation() {
        let request_id = Uuid::new_v4();
        let resp = Response::error(request_id, ErrorDetails::not_a_function("missingFunction"));

        assert_eq!(resp.request_id(), request_id);
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.canonical_kind(), Some(ErrorKind::NotAFunction));
        assert_eq!(
            err.to_string(),
            "NotAFunction: Remote property [missingFunction] is not a function"
        );
        assert_eq!(err.context.get("prop_key"), Some(&"missingFunction".to_string()));
    }

    #[test]
    fn test_stream_event_terminality() {
        let id = Uuid::new_v4();
        assert!(!StreamEvent::Next { subscription_id: id, value: json!(1) }.is_terminal());
        assert!(StreamEvent::Complete { subscription_id: id }.is_terminal());
        assert!(StreamEvent::Error {
            subscription_id: id,
            error: ErrorDetails::new("Error", "boom"),
        }
        .is_terminal());
    }

    #[test]
    fn test_message_reply_address() {
        let id = Uuid::new_v4();
        let msg = Message::stream(StreamEvent::Complete { subscription_id: id });
        assert_eq!(msg.reply_address(), Some(Address::Subscription(id)));
        assert_eq!(Message::request(Request::get("x")).reply_address(), None);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::request(Request::apply(
            "configure",
            vec![json!({"name": "probe", "ratio": 0.5, "tags": ["a", "b"], "inner": null})],
        ));

        let serialized = rmp_serde::to_vec(&msg).unwrap();
        let deserialized: Message = rmp_serde::from_slice(&serialized).unwrap();

        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::channel("calc").to_string(), "channel:calc");
    }

    #[test]
    fn test_canonical_kind_names() {
        for kind in [
            ErrorKind::NotAFunction,
            ErrorKind::NotAStream,
            ErrorKind::NotAValue,
            ErrorKind::DuplicateSubscription,
            ErrorKind::SubscriptionNotFound,
        ] {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("TypeError"), None);
    }

    proptest! {
        #[test]
        fn test_error_details_keep_kind_and_message(
            kind in "[A-Za-z][A-Za-z0-9_]{0,24}",
            message in ".{0,64}",
        ) {
            let details = ErrorDetails::new(kind.clone(), message.clone());
            let response = Message::response(Response::error(Uuid::new_v4(), details));

            let bytes = rmp_serde::to_vec(&response).unwrap();
            let decoded: Message = rmp_serde::from_slice(&bytes).unwrap();

            match decoded {
                Message::Response(Response::Error { error, .. }) => {
                    prop_assert_eq!(error.to_string(), format!("{}: {}", kind, message));
                }
                other => prop_assert!(false, "unexpected message {:?}", other),
            }
        }
    }
}
