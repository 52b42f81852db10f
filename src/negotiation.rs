//! Negotiation state machine
//!
//! One [`Negotiator`] drives one peer connection from media acquisition
//! through the offer/answer/candidate exchange to hang-up. All inputs arrive
//! through [`Negotiator::handle`], one at a time, from a single event queue.
//!
//! ```text
//! Idle -> MediaAcquired -> Offering ----> Connected
//!              |               |              ^
//!              +---------------+-> Answering -+
//! any -> Closed (hang-up)
//! ```

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::TransportChannel;
use crate::error::{MediaError, NegotiationError};
use crate::model::session::{CallStatus, Command, Input, PeerEvent, Phase, Presentation};
use crate::model::signal::Signal;
use crate::model::tracks::{
    LocalMediaSet, LocalTrack, MediaStream, RemoteStream, RemoteTrack, Sender, TrackId,
};

/// The peer-connection object supplied by the media library.
///
/// Descriptions and candidates are opaque JSON values that are only stored
/// and forwarded.
pub trait PeerConnection {
    /// Creates an offer and sets it as the local description.
    fn create_offer(&mut self) -> Result<Value, NegotiationError>;

    /// Sets `offer` as the remote description, then creates and sets an answer.
    fn accept_offer(&mut self, offer: &Value) -> Result<Value, NegotiationError>;

    /// Sets `answer` as the remote description for the outstanding offer.
    fn accept_answer(&mut self, answer: &Value) -> Result<(), NegotiationError>;

    fn add_remote_candidate(&mut self, candidate: &Value) -> Result<(), NegotiationError>;

    fn has_remote_description(&self) -> bool;

    /// True while a locally created offer awaits its answer.
    fn has_pending_offer(&self) -> bool;

    fn add_track(&mut self, track: &LocalTrack, stream_id: &str) -> Result<(), NegotiationError>;

    fn remove_track(&mut self, track: TrackId) -> Result<(), NegotiationError>;

    /// The outgoing tracks currently attached.
    fn senders(&self) -> Vec<Sender>;

    /// Drains events raised since the last call.
    fn poll_events(&mut self) -> Vec<PeerEvent>;

    fn close(&mut self);
}

/// Device capture and peer-connection construction.
pub trait MediaBackend {
    type Peer: PeerConnection;

    fn capture_microphone(&mut self) -> Result<MediaStream, MediaError>;

    /// Screen capture: one video track and optionally one audio track.
    fn capture_display(&mut self) -> Result<MediaStream, MediaError>;

    fn create_peer(&mut self) -> Result<Self::Peer, MediaError>;
}

pub struct Negotiator<B: MediaBackend> {
    pub(crate) backend: B,
    pub(crate) channel: TransportChannel,
    pub(crate) phase: Phase,
    pub(crate) peer: Option<B::Peer>,
    pub(crate) media: LocalMediaSet,
    pub(crate) remote: Option<RemoteStream>,
    /// Remote candidates received before any remote description was set.
    pub(crate) pending_candidates: Vec<Value>,
    pub(crate) muted: bool,
    pub(crate) sharing: bool,
    pub(crate) presentation: Presentation,
    pub(crate) last_error: Option<String>,
    status: watch::Sender<CallStatus>,
}

impl<B: MediaBackend> Negotiator<B> {
    pub fn new(backend: B, channel: TransportChannel) -> (Self, watch::Receiver<CallStatus>) {
        let (status, status_rx) = watch::channel(CallStatus::default());
        let negotiator = Negotiator {
            backend,
            channel,
            phase: Phase::Idle,
            peer: None,
            media: LocalMediaSet::default(),
            remote: None,
            pending_candidates: vec![],
            muted: false,
            sharing: false,
            presentation: Presentation::Remote,
            last_error: None,
            status,
        };
        (negotiator, status_rx)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peer(&self) -> Option<&B::Peer> {
        self.peer.as_ref()
    }

    pub fn peer_mut(&mut self) -> Option<&mut B::Peer> {
        self.peer.as_mut()
    }

    pub fn media(&self) -> &LocalMediaSet {
        &self.media
    }

    pub fn status(&self) -> CallStatus {
        CallStatus {
            phase: self.phase,
            muted: self.muted,
            sharing: self.sharing,
            remote: self.remote.clone(),
            presentation: self.presentation,
            last_error: self.last_error.clone(),
        }
    }

    /// Acquires the microphone and builds the peer connection.
    ///
    /// On failure the machine stays `Idle` and the error is published in the
    /// call status.
    pub fn start(&mut self) -> Result<(), MediaError> {
        if self.phase != Phase::Idle {
            debug!("Media already acquired (phase {})", self.phase);
            return Ok(());
        }

        let mut microphone = match self.backend.capture_microphone() {
            Ok(stream) => stream,
            Err(e) => return Err(self.media_failed(e)),
        };

        let mut peer = match self.backend.create_peer() {
            Ok(peer) => peer,
            Err(e) => {
                for track in &mut microphone.tracks {
                    track.stop();
                }
                return Err(self.media_failed(e));
            }
        };

        for track in &microphone.tracks {
            if let Err(e) = peer.add_track(track, &microphone.id) {
                warn!("Could not attach {} {}: {}", track.kind, track.id, e);
            }
        }

        info!(
            "Microphone acquired ({} track(s)), peer connection ready",
            microphone.tracks.len()
        );

        self.media.microphone = Some(microphone);
        self.peer = Some(peer);
        self.last_error = None;
        self.transition(Phase::MediaAcquired);
        self.pump();

        Ok(())
    }

    /// Applies one input, then drains whatever the peer connection raised.
    pub fn handle(&mut self, input: Input) {
        self.apply(input);
        self.pump();
    }

    /// Feeds pending peer-connection events back through the machine.
    pub fn pump(&mut self) {
        loop {
            let events = match self.peer.as_mut() {
                Some(peer) => peer.poll_events(),
                None => return,
            };

            if events.is_empty() {
                return;
            }

            for event in events {
                self.apply(Input::Peer(event));
            }
        }
    }

    fn apply(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command),
            Input::Signal(Signal::Offer(offer)) => self.handle_offer(offer),
            Input::Signal(Signal::Answer(answer)) => self.handle_answer(answer),
            Input::Signal(Signal::IceCandidate(candidate)) => {
                self.handle_remote_candidate(candidate)
            }
            Input::Peer(PeerEvent::LocalCandidate(candidate)) => {
                self.handle_local_candidate(candidate)
            }
            Input::Peer(PeerEvent::RemoteTrack(track)) => self.handle_remote_track(track),
            Input::ChannelClosed => {
                warn!("Relay channel closed, negotiation can no longer progress");
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Command {:?} in phase {}", command, self.phase);
        match command {
            Command::StartCall => self.start_call(),
            Command::ToggleMute => self.toggle_mute(),
            Command::HangUp => self.hang_up(),
            Command::StartScreenShare => self.start_screen_share(),
            Command::StopScreenShare => self.stop_screen_share(),
        }
    }

    /// Sends an offer. Once a call is up this renegotiates, carrying tracks
    /// added since the last exchange.
    fn start_call(&mut self) {
        let renegotiating = match self.phase {
            Phase::MediaAcquired => false,
            Phase::Answering | Phase::Connected => true,
            _ => {
                warn!("Cannot start a call in phase {}", self.phase);
                return;
            }
        };

        let Some(peer) = self.peer.as_mut() else {
            return;
        };

        if peer.has_pending_offer() {
            debug!("Offer already outstanding");
            return;
        }

        match peer.create_offer() {
            Ok(offer) if renegotiating => {
                info!("Sending renegotiation offer");
                self.send(Signal::Offer(offer));
            }
            Ok(offer) => {
                info!("Sending offer");
                self.send(Signal::Offer(offer));
                self.transition(Phase::Offering);
            }
            Err(NegotiationError::NothingToOffer) if renegotiating => {
                debug!("Nothing new to offer");
            }
            Err(e) => self.negotiation_failed("creating offer", e),
        }
    }

    fn handle_offer(&mut self, offer: Value) {
        if matches!(self.phase, Phase::Idle | Phase::Closed) {
            debug!("Ignoring offer in phase {}", self.phase);
            return;
        }

        let Some(peer) = self.peer.as_mut() else {
            return;
        };

        if self.phase == Phase::Offering {
            info!("Offer received while offering, accepting the remote offer");
        } else {
            info!("Offer received");
        }

        match peer.accept_offer(&offer) {
            Ok(answer) => {
                info!("Sending answer");
                self.send(Signal::Answer(answer));
                self.flush_candidates();
                self.transition(Phase::Answering);
            }
            Err(e) => self.negotiation_failed("accepting offer", e),
        }
    }

    fn handle_answer(&mut self, answer: Value) {
        let Some(peer) = self.peer.as_mut() else {
            debug!("Ignoring answer in phase {}", self.phase);
            return;
        };

        if self.phase == Phase::Closed || !peer.has_pending_offer() {
            debug!("Ignoring answer, no offer outstanding (phase {})", self.phase);
            return;
        }

        info!("Answer received");
        match peer.accept_answer(&answer) {
            Ok(()) => {
                self.flush_candidates();
                if self.remote.is_some() {
                    self.transition(Phase::Connected);
                }
            }
            Err(e) => self.negotiation_failed("accepting answer", e),
        }
    }

    fn handle_remote_candidate(&mut self, candidate: Value) {
        let Some(peer) = self.peer.as_mut() else {
            debug!("Ignoring candidate in phase {}", self.phase);
            return;
        };

        if !peer.has_remote_description() {
            debug!("Buffering candidate until a remote description is set");
            self.pending_candidates.push(candidate);
            return;
        }

        if let Err(e) = peer.add_remote_candidate(&candidate) {
            self.negotiation_failed("adding candidate", e);
        }
    }

    fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }

        let candidates = std::mem::take(&mut self.pending_candidates);
        debug!("Applying {} buffered candidate(s)", candidates.len());

        for candidate in candidates {
            let Some(peer) = self.peer.as_mut() else {
                return;
            };
            if let Err(e) = peer.add_remote_candidate(&candidate) {
                self.negotiation_failed("adding buffered candidate", e);
            }
        }
    }

    fn handle_local_candidate(&mut self, candidate: Value) {
        if self.peer.is_none() {
            return;
        }
        debug!("Sending local candidate");
        self.send(Signal::IceCandidate(candidate));
    }

    fn handle_remote_track(&mut self, track: RemoteTrack) {
        if self.peer.is_none() {
            return;
        }

        info!("Remote {} track {} attached", track.kind, track.id);
        self.remote.get_or_insert_with(RemoteStream::default).tracks.push(track);
        self.transition(Phase::Connected);
    }

    pub(crate) fn send(&mut self, signal: Signal) {
        let kind = signal.kind();
        if let Err(e) = self.channel.send(signal) {
            warn!("Could not send {}: {}", kind, e);
        }
    }

    pub(crate) fn transition(&mut self, phase: Phase) {
        if self.phase != phase {
            info!("Phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
        self.publish();
    }

    pub(crate) fn publish(&self) {
        self.status.send_replace(self.status());
    }

    fn media_failed(&mut self, e: MediaError) -> MediaError {
        error!("Error accessing media: {}", e);
        self.last_error = Some(e.to_string());
        self.publish();
        e
    }

    pub(crate) fn negotiation_failed(&mut self, what: &str, e: NegotiationError) {
        error!("Error {}: {}", what, e);
        self.last_error = Some(format!("{what}: {e}"));
        self.publish();
    }
}
