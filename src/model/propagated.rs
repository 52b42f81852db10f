//! Events propagated from connection handlers to the relay hub
//!
//! Every connection task reports into one queue; the hub applies the events
//! in arrival order, so registration, deregistration and broadcast never
//! interleave.

use tokio_tungstenite::tungstenite::Message;

use crate::model::channel::{ChannelEntry, ChannelId};

#[derive(Debug)]
pub enum Propagated {
    /// A channel finished its handshake and wants to receive broadcasts.
    Connected(ChannelEntry),

    /// A frame to forward unchanged to every other channel.
    Frame(ChannelId, Message),

    /// A channel closed or failed.
    Disconnected(ChannelId),
}

impl Propagated {
    /// The channel this event originates from.
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Propagated::Connected(entry) => entry.id,
            Propagated::Frame(id, _) | Propagated::Disconnected(id) => *id,
        }
    }
}
