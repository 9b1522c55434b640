//! Relay frames: the multiplexing unit of the control connection
//!
//! Every public request relayed to an agent becomes an *exchange*. All frames
//! belonging to one exchange share an `exchange_id`; the relay never relies
//! on ordering across different exchanges.

use crate::messages::LocalTarget;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exchange identifier, unique within one agent connection
pub type ExchangeId = u64;

/// Frame types for exchange multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Opens an exchange; payload carries the destination `host:port`
    Open = 0,
    /// Body bytes
    Data = 1,
    /// Sender finished its half of the exchange
    End = 2,
    /// Exchange aborted; payload carries a UTF-8 reason
    Error = 3,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Open => "open",
            FrameType::Data => "data",
            FrameType::End => "end",
            FrameType::Error => "error",
        }
    }
}

/// Frame decoding errors
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("Frame type {0} has no destination")]
    NotAnOpenFrame(&'static str),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

/// Multiplexed relay frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayFrame {
    pub exchange_id: ExchangeId,
    pub tunnel_id: String,
    pub frame_type: FrameType,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl RelayFrame {
    pub fn new(
        exchange_id: ExchangeId,
        tunnel_id: impl Into<String>,
        frame_type: FrameType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            exchange_id,
            tunnel_id: tunnel_id.into(),
            frame_type,
            payload,
        }
    }

    pub fn open(exchange_id: ExchangeId, tunnel_id: impl Into<String>, target: &LocalTarget) -> Self {
        Self::new(
            exchange_id,
            tunnel_id,
            FrameType::Open,
            target.to_string().into_bytes(),
        )
    }

    pub fn data(exchange_id: ExchangeId, tunnel_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(exchange_id, tunnel_id, FrameType::Data, payload)
    }

    pub fn end(exchange_id: ExchangeId, tunnel_id: impl Into<String>) -> Self {
        Self::new(exchange_id, tunnel_id, FrameType::End, Vec::new())
    }

    pub fn error(exchange_id: ExchangeId, tunnel_id: impl Into<String>, reason: &str) -> Self {
        Self::new(
            exchange_id,
            tunnel_id,
            FrameType::Error,
            reason.as_bytes().to_vec(),
        )
    }

    /// `End` and `Error` close an exchange
    pub fn is_terminal(&self) -> bool {
        matches!(self.frame_type, FrameType::End | FrameType::Error)
    }

    /// Destination carried by an `Open` frame
    pub fn open_target(&self) -> Result<LocalTarget, FrameError> {
        if self.frame_type != FrameType::Open {
            return Err(FrameError::NotAnOpenFrame(self.frame_type.as_str()));
        }
        let address = std::str::from_utf8(&self.payload)
            .map_err(|_| FrameError::InvalidDestination("not UTF-8".to_string()))?;
        LocalTarget::parse(address).map_err(FrameError::InvalidDestination)
    }

    /// Reason carried by an `Error` frame (lossy for non UTF-8 payloads)
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// Serialize payloads as a byte string rather than a sequence of u8
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
