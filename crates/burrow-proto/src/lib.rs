//! Burrow relay protocol definitions
//!
//! This crate defines the messages exchanged between the relay and its agents
//! over a single control connection, the relay frames that multiplex many
//! request/response exchanges over that connection, and the length-delimited
//! codec used to put both on the wire.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{CodecError, RelayCodec};
pub use frame::{ExchangeId, FrameError, FrameType, RelayFrame};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
