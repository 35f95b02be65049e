//! Error types for the tether library

use std::collections::HashMap;
use std::fmt;
use tether_proto::{ErrorDetails, ErrorKind};
use tether_transport::TransportError;
use thiserror::Error;

/// Main error type for local, synchronous misuse and remote failures
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A dispatcher is already registered on the channel
    #[error("Channel [{channel}] is already registered")]
    DuplicateRegistration {
        /// Offending channel
        channel: String,
    },

    /// No matching registration exists for the channel
    #[error("Channel [{channel}] is not registered")]
    NotRegistered {
        /// Offending channel
        channel: String,
    },

    /// Stub properties cannot be assigned
    #[error("Stub property [{key}] is read-only")]
    ReadOnlyProperty {
        /// Property that was written
        key: String,
    },

    /// Stream properties were declared without a stream constructor
    #[error("Descriptor for channel [{channel}] declares stream properties but no stream constructor was supplied")]
    MissingStreamConstructor {
        /// Descriptor channel
        channel: String,
    },

    /// Descriptor failed validation
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Failure raised on the other side of the bridge
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Descriptor validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Channel name is empty
    #[error("channel name must not be empty")]
    EmptyChannel,

    /// A property name is empty
    #[error("property names must not be empty")]
    EmptyPropertyName,

    /// A property was declared twice
    #[error("property [{0}] is declared more than once")]
    DuplicateProperty(String),

    /// Descriptor source could not be parsed
    #[error("could not parse descriptor: {0}")]
    Parse(String),
}

/// Error raised by a target member, as seen on either side of the bridge
///
/// Renders as `"<kind>: <message>"`. On the host it is what target members
/// fail with; on the client it is what rejected handles and errored streams
/// yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    kind: String,
    message: String,
    stack: Option<String>,
    context: HashMap<String, String>,
}

impl RemoteError {
    /// Kind used when nothing more specific is known
    pub const GENERIC_KIND: &'static str = "Error";

    /// Kind used for local transport failures surfaced through a handle
    pub const TRANSPORT_KIND: &'static str = "TransportError";

    /// Create an error with an explicit kind name
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
            context: HashMap::new(),
        }
    }

    /// Create an error of the generic `Error` kind
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Self::GENERIC_KIND, message)
    }

    /// Capture a Rust error, using its type name as the kind
    ///
    /// The source chain is recorded as the stack.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut remote = Self::new(short_type_name::<E>(), error.to_string());

        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        if !chain.is_empty() {
            remote.stack = Some(chain.join("\n"));
        }
        remote
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

    /// Error kind name
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Best-effort stack, if one was captured
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Additional context data
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Canonical kind, when the host itself produced this failure
    pub fn canonical_kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_name(&self.kind)
    }

    /// Whether this is the given host-produced failure
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.canonical_kind() == Some(kind)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<ErrorDetails> for RemoteError {
    fn from(details: ErrorDetails) -> Self {
        Self {
            kind: details.kind,
            message: details.message,
            stack: details.stack,
            context: details.context,
        }
    }
}

impl From<RemoteError> for ErrorDetails {
    fn from(error: RemoteError) -> Self {
        Self {
            kind: error.kind,
            message: error.message,
            stack: error.stack,
            context: error.context,
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<TransportError> for RemoteError {
    fn from(err: TransportError) -> Self {
        Self::new(Self::TRANSPORT_KIND, err.to_string())
    }
}

fn short_type_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
