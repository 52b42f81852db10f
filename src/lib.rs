//! Two-party calls negotiated through a broadcast signaling relay.
//!
//! The relay ([`server`]) forwards offers, answers and candidates between
//! connected participants without reading them. Each participant runs a
//! [`negotiation::Negotiator`] that drives one peer connection from media
//! acquisition to hang-up, with [`control`] providing mute and screen share.

pub mod backend;
pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod model;
pub mod negotiation;
pub mod peer;
pub mod server;
pub mod util;

#[cfg(test)]
mod testing;
