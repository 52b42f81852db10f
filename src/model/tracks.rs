//! Media track management
//!
//! Local tracks are owned by the participant and only mutated through the
//! media controls. Remote tracks are what the peer connection reports as
//! arriving from the other side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use str0m::media::{MediaKind, Mid};

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<MediaKind> for TrackKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => TrackKind::Audio,
            MediaKind::Video => TrackKind::Video,
        }
    }
}

impl From<TrackKind> for MediaKind {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => MediaKind::Audio,
            TrackKind::Video => MediaKind::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Which capture device produced a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl TrackId {
    pub fn next() -> TrackId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        TrackId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// One locally captured track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub source: TrackSource,
    /// Muting clears this flag; the track keeps flowing silence.
    pub enabled: bool,
    /// Cleared once the track has been stopped; stopped tracks never restart.
    pub live: bool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> LocalTrack {
        LocalTrack {
            id: TrackId::next(),
            kind,
            source,
            enabled: true,
            live: true,
        }
    }

    pub fn stop(&mut self) {
        self.live = false;
    }
}

/// A group of tracks captured together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> MediaStream {
        MediaStream {
            id: id.into(),
            tracks,
        }
    }
}

/// Microphone capture plus an optional screen capture.
#[derive(Debug, Default)]
pub struct LocalMediaSet {
    pub microphone: Option<MediaStream>,
    pub screen: Option<MediaStream>,
}

impl LocalMediaSet {
    pub fn is_empty(&self) -> bool {
        self.microphone.is_none() && self.screen.is_none()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.microphone
            .iter()
            .chain(self.screen.iter())
            .flat_map(|s| s.tracks.iter())
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut LocalTrack> {
        self.microphone
            .iter_mut()
            .chain(self.screen.iter_mut())
            .flat_map(|s| s.tracks.iter_mut())
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut LocalTrack> {
        self.tracks_mut().find(|t| t.id == id)
    }

    /// Stops every track and forgets all streams.
    pub fn stop_all(&mut self) {
        for track in self.tracks_mut() {
            track.stop();
        }
        self.microphone = None;
        self.screen = None;
    }
}

/// A track the peer connection reports as arriving from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The remote media currently attached for presentation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

/// An outgoing track as seen by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender {
    pub track_id: TrackId,
    pub kind: TrackKind,
}

/// Represents an outgoing media track in a str0m session.
#[derive(Debug)]
pub struct TrackOut {
    pub(crate) sender: Sender,
    pub(crate) stream_id: String,
    pub(crate) state: TrackOutState,
}

/// The negotiation state of an outgoing track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutState {
    /// Track needs to be opened in the next locally created offer
    ToOpen,
    /// Track negotiation is in progress with the given Mid
    Negotiating(Mid),
    /// Track is fully negotiated and open for media transmission
    Open(Mid),
}

impl TrackOut {
    pub fn mid(&self) -> Option<Mid> {
        match self.state {
            TrackOutState::ToOpen => None,
            TrackOutState::Negotiating(m) | TrackOutState::Open(m) => Some(m),
        }
    }
}
