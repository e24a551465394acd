//! The relay control message.
//!
//! Exactly one of these is sent as a JSON text frame right after the
//! WebSocket upgrade; everything after it on the session is opaque payload.

use serde::{Deserialize, Serialize};

use crate::error::EdgeResult;

/// Tells the relay where to connect on its far side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Destination host (name or literal address) the relay should dial.
    pub hostname: String,
    /// Destination TCP port.
    pub port: u16,
    /// Shared secret proving the client may use the relay.
    pub psw: String,
}

impl ControlMessage {
    pub fn new(hostname: impl Into<String>, port: u16, psw: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            psw: psw.into(),
        }
    }

    /// Encode as the JSON text carried by the first relay frame.
    pub fn to_json(&self) -> EdgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> EdgeResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
