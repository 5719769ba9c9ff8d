//! Burrow Protocol Definitions
//!
//! This crate defines the wire format spoken between a device agent and the
//! public proxy: the one-line JSON handshake and the binary frames that
//! multiplex local TCP services over a single connection.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, FrameCodec, FrameError, FrameType, StreamId};
pub use handshake::{HandshakeCodecError, HandshakeOutcome, HandshakeRequest, HandshakeResponse};

/// Maximum payload carried by a single frame (16MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum length of a handshake response line, newline included
pub const MAX_HANDSHAKE_LINE: usize = 8 * 1024;
