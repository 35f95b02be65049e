//! # Tether Transport
//!
//! The message transport contract a host dispatcher and client stub talk
//! through, with an in-process implementation for tests and embedding and a
//! framed implementation for real byte streams (child stdio, pipes, sockets).

#![warn(missing_docs)]

/// Transport abstraction and listener bookkeeping
pub mod transport;

/// In-process transport pairs
pub mod memory;

/// Framed transport over async byte streams
pub mod io;

/// Transport error types
pub mod error;

pub use transport::{Listener, ListenerTable, Transport, TransportConfig};
pub use memory::MemoryTransport;
pub use io::IoTransport;
pub use error::TransportError;
