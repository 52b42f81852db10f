//! str0m-backed peer connection
//!
//! str0m is sans-I/O: [`Str0mPeer`] owns the `Rtc` state and a handle to the
//! UDP socket, and the runtime in [`crate::peer`] feeds it datagrams and
//! timeouts. Everything str0m emits is translated into [`PeerEvent`]s for the
//! negotiation state machine.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use str0m::{
    change::{SdpAnswer, SdpOffer, SdpPendingOffer},
    media::{Direction, MediaAdded},
    net::{Protocol, Receive},
    Candidate, Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{MediaError, NegotiationError};
use crate::model::session::PeerEvent;
use crate::model::tracks::{
    LocalTrack, MediaStream, RemoteTrack, Sender, TrackId, TrackKind, TrackOut, TrackOutState,
    TrackSource,
};
use crate::negotiation::{MediaBackend, PeerConnection};

/// Builds str0m peers on one UDP socket and hands out synthetic capture.
///
/// Real device capture belongs to the UI host; the tracks produced here only
/// carry metadata, which is all negotiation needs.
pub struct Str0mBackend {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    screen_audio: bool,
}

impl Str0mBackend {
    pub async fn bind(ip: IpAddr) -> Result<Str0mBackend, MediaError> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        info!("Bound UDP port: {}", local_addr);

        Ok(Str0mBackend {
            socket: Arc::new(socket),
            local_addr,
            screen_audio: true,
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl MediaBackend for Str0mBackend {
    type Peer = Str0mPeer;

    fn capture_microphone(&mut self) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new(
            "microphone",
            vec![LocalTrack::new(TrackKind::Audio, TrackSource::Microphone)],
        ))
    }

    fn capture_display(&mut self) -> Result<MediaStream, MediaError> {
        static SCREEN_COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = SCREEN_COUNTER.fetch_add(1, Ordering::SeqCst);

        let mut tracks = vec![LocalTrack::new(TrackKind::Video, TrackSource::Screen)];
        if self.screen_audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, TrackSource::Screen));
        }

        Ok(MediaStream::new(format!("screen-{n}"), tracks))
    }

    fn create_peer(&mut self) -> Result<Str0mPeer, MediaError> {
        let mut rtc = Rtc::new();
        let mut events = VecDeque::new();

        let candidate = Candidate::host(self.local_addr, "udp")
            .map_err(|e| MediaError::PeerSetup(e.to_string()))?;

        if rtc.add_local_candidate(candidate.clone()).is_some() {
            events.push_back(PeerEvent::LocalCandidate(candidate_payload(&candidate)));
        } else {
            warn!("str0m refused host candidate {}", self.local_addr);
        }

        Ok(Str0mPeer {
            rtc,
            socket: self.socket.clone(),
            local_addr: self.local_addr,
            pending: None,
            remote_description: false,
            connected: false,
            tracks_out: vec![],
            events,
            timeout: None,
        })
    }
}

/// Browser-compatible candidate payload.
fn candidate_payload(candidate: &Candidate) -> Value {
    json!({
        "candidate": candidate.to_sdp_string(),
        "sdpMid": null,
        "sdpMLineIndex": 0,
    })
}

#[derive(Debug)]
pub struct Str0mPeer {
    rtc: Rtc,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pending: Option<SdpPendingOffer>,
    remote_description: bool,
    connected: bool,
    tracks_out: Vec<TrackOut>,
    events: VecDeque<PeerEvent>,
    timeout: Option<Instant>,
}

impl Str0mPeer {
    pub fn is_alive(&self) -> bool {
        self.rtc.is_alive()
    }

    /// True once ICE and DTLS are up.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// When str0m next wants [`Str0mPeer::handle_timeout`] called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timeout
    }

    pub fn handle_receive(&mut self, source: SocketAddr, buf: &[u8]) {
        let Ok(contents) = buf.try_into() else {
            debug!("Ignoring unrecognised datagram from {}", source);
            return;
        };

        self.handle_input(Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        ));
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.handle_input(Input::Timeout(now));
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer connection failed: {:?}", e);
            self.rtc.disconnect();
        }
    }

    /// Polls str0m until it returns a timeout, transmitting as it goes.
    fn drive(&mut self) {
        loop {
            if !self.rtc.is_alive() {
                self.timeout = None;
                return;
            }

            match self.rtc.poll_output() {
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&transmit.contents, transmit.destination)
                    {
                        debug!("UDP send to {} failed: {}", transmit.destination, e);
                    }
                }
                Ok(Output::Timeout(t)) => {
                    self.timeout = Some(t);
                    return;
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("Peer connection poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE connection state: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    info!("Media path lost");
                }
            }
            Event::Connected => {
                info!("Peer connection established");
                self.connected = true;
            }
            Event::MediaAdded(added) => self.handle_media_added(added),
            other => debug!("Peer event: {:?}", other),
        }
    }

    /// Only fires for m-lines the remote offered. A local track of the same
    /// kind that is still waiting for a line is sent on it.
    fn handle_media_added(&mut self, added: MediaAdded) {
        let kind: TrackKind = added.kind.into();

        if added.direction.is_sending() {
            let claimed = self.tracks_out.iter().any(|t| t.mid() == Some(added.mid));
            let waiting = self
                .tracks_out
                .iter_mut()
                .find(|t| t.state == TrackOutState::ToOpen && t.sender.kind == kind);

            if let (false, Some(track)) = (claimed, waiting) {
                debug!("Sending {} on remote mid {}", track.sender.track_id, added.mid);
                track.state = TrackOutState::Open(added.mid);
            }
        }

        if added.direction.is_receiving() {
            self.events.push_back(PeerEvent::RemoteTrack(RemoteTrack {
                id: added.mid.to_string(),
                kind,
            }));
        }
    }
}

impl PeerConnection for Str0mPeer {
    fn create_offer(&mut self) -> Result<Value, NegotiationError> {
        if !self.rtc.is_alive() {
            return Err(NegotiationError::Closed);
        }

        let mut change = self.rtc.sdp_api();

        for track in &mut self.tracks_out {
            if let TrackOutState::ToOpen = track.state {
                let mid = change.add_media(
                    track.sender.kind.into(),
                    Direction::SendRecv,
                    Some(track.stream_id.clone()),
                    Some(track.sender.track_id.to_string()),
                    None,
                );
                track.state = TrackOutState::Negotiating(mid);
            }
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(NegotiationError::NothingToOffer);
        };

        self.pending = Some(pending);

        Ok(serde_json::to_value(&offer)?)
    }

    fn accept_offer(&mut self, offer: &Value) -> Result<Value, NegotiationError> {
        let offer: SdpOffer = serde_json::from_value(offer.clone())?;

        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;

        // A remote offer supersedes our own; tracks that were in flight get
        // offered again next time.
        self.pending = None;
        for track in &mut self.tracks_out {
            if let TrackOutState::Negotiating(_) = track.state {
                track.state = TrackOutState::ToOpen;
            }
        }
        self.remote_description = true;

        Ok(serde_json::to_value(&answer)?)
    }

    fn accept_answer(&mut self, answer: &Value) -> Result<(), NegotiationError> {
        let answer: SdpAnswer = serde_json::from_value(answer.clone())?;
        let pending = self.pending.take().ok_or(NegotiationError::NoPendingOffer)?;

        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;

        // Lines we offered never raise MediaAdded; report what the answer
        // lets us receive here instead.
        for track in &mut self.tracks_out {
            if let TrackOutState::Negotiating(m) = track.state {
                track.state = TrackOutState::Open(m);

                if let Some(media) = self.rtc.media(m) {
                    if media.direction().is_receiving() {
                        self.events.push_back(PeerEvent::RemoteTrack(RemoteTrack {
                            id: m.to_string(),
                            kind: media.kind().into(),
                        }));
                    }
                }
            }
        }
        self.remote_description = true;

        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &Value) -> Result<(), NegotiationError> {
        let sdp = candidate
            .get("candidate")
            .and_then(Value::as_str)
            .or_else(|| candidate.as_str())
            .ok_or_else(|| NegotiationError::Candidate("no candidate string".to_string()))?;

        // End-of-candidates marker.
        if sdp.is_empty() {
            return Ok(());
        }

        let candidate = Candidate::from_sdp_string(sdp)
            .map_err(|e| NegotiationError::Candidate(e.to_string()))?;
        self.rtc.add_remote_candidate(candidate);

        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_description
    }

    fn has_pending_offer(&self) -> bool {
        self.pending.is_some()
    }

    fn add_track(&mut self, track: &LocalTrack, stream_id: &str) -> Result<(), NegotiationError> {
        if !self.rtc.is_alive() {
            return Err(NegotiationError::Closed);
        }

        self.tracks_out.push(TrackOut {
            sender: Sender {
                track_id: track.id,
                kind: track.kind,
            },
            stream_id: stream_id.to_string(),
            state: TrackOutState::ToOpen,
        });

        Ok(())
    }

    /// str0m keeps a negotiated m-line; once nothing is written to it the
    /// remote sees the track go silent.
    fn remove_track(&mut self, track: TrackId) -> Result<(), NegotiationError> {
        if let Some(out) = self.tracks_out.iter().find(|t| t.sender.track_id == track) {
            debug!("Removing {} (mid {:?})", track, out.mid());
        }
        self.tracks_out.retain(|t| t.sender.track_id != track);
        Ok(())
    }

    fn senders(&self) -> Vec<Sender> {
        self.tracks_out.iter().map(|t| t.sender).collect()
    }

    fn poll_events(&mut self) -> Vec<PeerEvent> {
        self.drive();
        self.events.drain(..).collect()
    }

    fn close(&mut self) {
        self.rtc.disconnect();
        self.pending = None;
        self.connected = false;
        self.tracks_out.clear();
        self.events.clear();
        self.timeout = None;
    }
}
