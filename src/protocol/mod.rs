//! Protocol module - Defines the wire protocol spoken between two screens
//!
//! Every link is a single TCP stream carrying framed messages:
//! - 4 bytes magic
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length bincode payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for the invite listener (0 lets the OS pick one)
pub const DEFAULT_PORT: u16 = 0;

/// Interface tag every screen advertises and scans for
pub const SERVICE_INTERFACE: &str = "triangles.Screen";

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x54, 0x52, 0x49, 0x41]; // "TRIA"
