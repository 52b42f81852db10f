//! Participant-side session state and the inputs that drive it

use std::fmt;

use serde_json::Value;

use crate::model::signal::Signal;
use crate::model::tracks::{RemoteStream, RemoteTrack};

/// Connection phase of the negotiation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No local media and no peer connection.
    Idle,
    /// Microphone captured and peer connection constructed.
    MediaAcquired,
    /// Local offer sent, waiting for an answer.
    Offering,
    /// Remote offer answered.
    Answering,
    /// Remote media attached.
    Connected,
    /// Torn down by hang-up.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the remote presentation surface is showing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Presentation {
    #[default]
    Remote,
    LocalScreen,
}

/// Everything a UI host needs to render the call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub phase: Phase,
    pub muted: bool,
    pub sharing: bool,
    pub remote: Option<RemoteStream>,
    pub presentation: Presentation,
    pub last_error: Option<String>,
}

impl CallStatus {
    pub fn connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Call controls are usable once media has been acquired and until hang-up.
    pub fn controls_enabled(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Closed)
    }
}

impl Default for CallStatus {
    fn default() -> Self {
        CallStatus {
            phase: Phase::Idle,
            muted: false,
            sharing: false,
            remote: None,
            presentation: Presentation::Remote,
            last_error: None,
        }
    }
}

/// User intents supplied by the UI host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCall,
    ToggleMute,
    HangUp,
    StartScreenShare,
    StopScreenShare,
}

impl Command {
    /// Parses the words accepted on the peer's command line.
    pub fn parse(word: &str) -> Option<Command> {
        match word.trim() {
            "call" | "start" => Some(Command::StartCall),
            "mute" | "unmute" => Some(Command::ToggleMute),
            "hangup" | "hang-up" | "bye" => Some(Command::HangUp),
            "share" => Some(Command::StartScreenShare),
            "unshare" | "stop-share" => Some(Command::StopScreenShare),
            _ => None,
        }
    }
}

/// Events raised inside the peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local network path was discovered and must be sent to the remote.
    LocalCandidate(Value),
    /// Media started arriving from the remote.
    RemoteTrack(RemoteTrack),
}

/// One entry of the participant's single event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Signal(Signal),
    Peer(PeerEvent),
    /// The transport channel to the relay went away.
    ChannelClosed,
}
