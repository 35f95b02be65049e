//! Frame structure and serialization

use serde::{Deserialize, Serialize};
use bytes::Bytes;
use crate::{Address, Message, ProtocolError};

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// No special flags
    pub const NONE: Self = Self(0);
    /// Sender is closing the connection; no payload follows
    pub const DISCONNECT: Self = Self(1);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: FrameFlags) {
        self.0 |= flag.0;
    }

    /// Clear a flag
    pub fn clear_flag(&mut self, flag: FrameFlags) {
        self.0 &= !flag.0;
    }
}

/// Protocol frame structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Destination address on the receiving side
    pub address: Address,
    /// Frame flags
    pub flags: FrameFlags,
    /// MessagePack-encoded `Message`, empty for control frames
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(address: Address, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            address,
            flags,
            payload,
        }
    }

    /// Create a data frame carrying an encoded message
    pub fn message(address: Address, message: &Message) -> Result<Self, ProtocolError> {
        let payload = rmp_serde::to_vec(message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(address, FrameFlags::NONE, Bytes::from(payload)))
    }

    /// Create a disconnect notice
    pub fn disconnect() -> Self {
        Self::new(Address::channel(""), FrameFlags::DISCONNECT, Bytes::new())
    }

    /// Decode the carried message
    pub fn decode_message(&self) -> Result<Message, ProtocolError> {
        if self.is_disconnect() {
            return Err(ProtocolError::InvalidFrame);
        }
        rmp_serde::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Get the payload size
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Check if this is a disconnect notice
    pub fn is_disconnect(&self) -> bool {
        self.flags.has_flag(FrameFlags::DISCONNECT)
    }
}
