//! Codec for encoding/decoding relay messages
//!
//! Wire format: `[length: u32 big-endian][bincode serialized RelayMessage]`

use crate::messages::RelayMessage;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length header size in bytes
const HEADER_SIZE: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay message codec, usable with `tokio_util::codec::Framed`
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayCodec;

impl RelayCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a relay message to a standalone buffer
    pub fn encode_message(msg: &RelayMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        RelayCodec.encode(msg.clone(), &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_SIZE];
        length_bytes.copy_from_slice(&src[..HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let msg_bytes = src.split_to(length);
        let msg: RelayMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RelayMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
