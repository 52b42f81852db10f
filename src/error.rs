//! Error types
//!
//! None of these are fatal to a running session: the state machine logs them
//! and keeps its current phase.

use thiserror::Error;

/// Failures acquiring local media or building a peer connection.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The user or platform refused access to a capture device.
    #[error("capture of {0} was denied")]
    Denied(&'static str),
    /// No device of the requested type exists.
    #[error("no {0} device available")]
    Unavailable(&'static str),
    /// The peer-connection object could not be created.
    #[error("peer connection setup failed: {0}")]
    PeerSetup(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures reported by the peer-connection library during negotiation.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A session description was rejected.
    #[error("session description rejected: {0}")]
    Sdp(String),
    /// A remote candidate was rejected.
    #[error("candidate rejected: {0}")]
    Candidate(String),
    /// The opaque payload could not be interpreted by the library.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// An answer arrived but no local offer is outstanding.
    #[error("no local offer is pending")]
    NoPendingOffer,
    /// There was nothing to put in an offer.
    #[error("nothing to offer")]
    NothingToOffer,
    /// The peer connection has already been closed.
    #[error("peer connection is closed")]
    Closed,
}

/// Failures of the transport channel to the relay.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("could not reach relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    /// The channel has disconnected; the caller owns any retry.
    #[error("channel is closed")]
    Closed,
    #[error("could not encode message: {0}")]
    Encode(serde_json::Error),
    #[error("could not decode message: {0}")]
    Decode(serde_json::Error),
}
