//! Data models for signaling and negotiation
//!
//! This module contains the wire messages, relay registry entries, hub events,
//! local/remote track types and the participant's observable call status.

pub mod channel;
pub mod propagated;
pub mod session;
pub mod signal;
pub mod tracks;
