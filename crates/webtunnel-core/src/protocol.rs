//! Relay wire protocol.
//!
//! Every connection to the relay (control or data) opens with a JSON
//! [`Handshake`]. The control connection is answered with a
//! [`HandshakeAck`] and afterwards carries only the heartbeat literals.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::Identity;

/// Heartbeat request, written on the control connection.
pub const PING: &[u8] = b"ping";
/// Heartbeat reply from the relay.
pub const PONG: &[u8] = b"pong";

/// First message on every relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub uuid: String,
}

impl Handshake {
    pub fn new(identity: &Identity) -> Self {
        Self {
            uuid: identity.as_str().to_owned(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Relay answer to the control handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub ok: bool,
}

/// Parse the first JSON value of a control payload as an ack.
///
/// Returns `None` for anything that is not an object with a boolean `ok`.
/// Bytes after the first value are ignored.
pub fn parse_ack(payload: &[u8]) -> Option<bool> {
    serde_json::Deserializer::from_slice(payload)
        .into_iter::<HandshakeAck>()
        .next()?
        .ok()
        .map(|ack| ack.ok)
}
