//! Negotiation messages exchanged through the relay
//!
//! Every message is one websocket text frame of the form
//! `{"event": "offer", "data": {...}}`. The `data` payload is produced by the
//! peer-connection library and is never inspected on the way through.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// The three event names understood by participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        };
        f.write_str(name)
    }
}

/// A tagged negotiation message carrying an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Signal {
    /// A session description offering media.
    Offer(Value),
    /// A session description answering an offer.
    Answer(Value),
    /// One network path candidate.
    IceCandidate(Value),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Signal::Offer(v) | Signal::Answer(v) | Signal::IceCandidate(v) => v,
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(ChannelError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(ChannelError::Decode)
    }

    /// Best-effort look at a raw frame's event name, for logging only.
    pub fn peek_kind(text: &str) -> Option<SignalKind> {
        #[derive(Deserialize)]
        struct Tag {
            event: SignalKind,
        }

        serde_json::from_str::<Tag>(text).ok().map(|t| t.event)
    }
}
