//! # Tether Protocol
//!
//! Wire shapes exchanged between a host dispatcher and a client stub, plus
//! the length-prefixed MessagePack frame codec used by byte-stream
//! transports.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Message types and enums
pub mod message;

/// Frame codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use frame::{Frame, FrameFlags};
pub use message::{Address, ErrorDetails, ErrorKind, Message, Request, Response, StreamEvent};
pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;

/// Values carried by requests, responses and stream pushes
pub use serde_json::Value;
