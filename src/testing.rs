//! In-memory media backend for exercising the state machine.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::channel::TransportChannel;
use crate::error::{MediaError, NegotiationError};
use crate::model::session::PeerEvent;
use crate::model::signal::Signal;
use crate::model::tracks::{LocalTrack, MediaStream, Sender, TrackId, TrackKind, TrackSource};
use crate::negotiation::{MediaBackend, Negotiator, PeerConnection};

/// Knobs and counters shared between a test and its fake peer.
#[derive(Debug, Default)]
pub struct FakeState {
    pub deny_microphone: bool,
    pub deny_display: bool,
    pub reject_sdp: bool,
    pub reject_candidates: bool,
    pub candidates_on_create: usize,
    pub offers_created: usize,
    pub offers_accepted: usize,
    pub answers_accepted: usize,
    pub remote_candidates: Vec<Value>,
    pub removed: Vec<TrackId>,
    pub closes: usize,
    pub events: VecDeque<PeerEvent>,
}

pub type Shared = Rc<RefCell<FakeState>>;

pub struct FakeBackend {
    state: Shared,
}

impl FakeBackend {
    pub fn new() -> (FakeBackend, Shared) {
        let state = Shared::default();
        (
            FakeBackend {
                state: state.clone(),
            },
            state,
        )
    }
}

impl MediaBackend for FakeBackend {
    type Peer = FakePeer;

    fn capture_microphone(&mut self) -> Result<MediaStream, MediaError> {
        if self.state.borrow().deny_microphone {
            return Err(MediaError::Denied("microphone"));
        }
        Ok(MediaStream::new(
            "microphone",
            vec![LocalTrack::new(TrackKind::Audio, TrackSource::Microphone)],
        ))
    }

    fn capture_display(&mut self) -> Result<MediaStream, MediaError> {
        if self.state.borrow().deny_display {
            return Err(MediaError::Denied("screen"));
        }
        Ok(MediaStream::new(
            "screen",
            vec![
                LocalTrack::new(TrackKind::Video, TrackSource::Screen),
                LocalTrack::new(TrackKind::Audio, TrackSource::Screen),
            ],
        ))
    }

    fn create_peer(&mut self) -> Result<FakePeer, MediaError> {
        {
            let mut state = self.state.borrow_mut();
            for i in 0..state.candidates_on_create {
                state
                    .events
                    .push_back(PeerEvent::LocalCandidate(json!({ "candidate": i })));
            }
        }
        Ok(FakePeer {
            state: self.state.clone(),
            pending: false,
            remote: false,
            senders: vec![],
        })
    }
}

pub struct FakePeer {
    state: Shared,
    pending: bool,
    remote: bool,
    senders: Vec<Sender>,
}

impl FakePeer {
    fn check_sdp(&self) -> Result<(), NegotiationError> {
        if self.state.borrow().reject_sdp {
            return Err(NegotiationError::Sdp("rejected".to_string()));
        }
        Ok(())
    }
}

impl PeerConnection for FakePeer {
    fn create_offer(&mut self) -> Result<Value, NegotiationError> {
        self.check_sdp()?;
        let mut state = self.state.borrow_mut();
        state.offers_created += 1;
        self.pending = true;
        Ok(json!({ "type": "offer", "sdp": format!("offer-{}", state.offers_created) }))
    }

    fn accept_offer(&mut self, _offer: &Value) -> Result<Value, NegotiationError> {
        self.check_sdp()?;
        self.state.borrow_mut().offers_accepted += 1;
        self.pending = false;
        self.remote = true;
        Ok(json!({ "type": "answer", "sdp": "answer" }))
    }

    fn accept_answer(&mut self, _answer: &Value) -> Result<(), NegotiationError> {
        self.check_sdp()?;
        if !self.pending {
            return Err(NegotiationError::NoPendingOffer);
        }
        self.state.borrow_mut().answers_accepted += 1;
        self.pending = false;
        self.remote = true;
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &Value) -> Result<(), NegotiationError> {
        let mut state = self.state.borrow_mut();
        if state.reject_candidates {
            return Err(NegotiationError::Candidate("rejected".to_string()));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote
    }

    fn has_pending_offer(&self) -> bool {
        self.pending
    }

    fn add_track(&mut self, track: &LocalTrack, _stream_id: &str) -> Result<(), NegotiationError> {
        self.senders.push(Sender {
            track_id: track.id,
            kind: track.kind,
        });
        Ok(())
    }

    fn remove_track(&mut self, track: TrackId) -> Result<(), NegotiationError> {
        self.senders.retain(|s| s.track_id != track);
        self.state.borrow_mut().removed.push(track);
        Ok(())
    }

    fn senders(&self) -> Vec<Sender> {
        self.senders.clone()
    }

    fn poll_events(&mut self) -> Vec<PeerEvent> {
        self.state.borrow_mut().events.drain(..).collect()
    }

    fn close(&mut self) {
        self.state.borrow_mut().closes += 1;
    }
}

/// A transport channel whose outbound side is readable by the test.
pub fn channel() -> (TransportChannel, mpsc::UnboundedReceiver<Signal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransportChannel::new(tx), rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<Signal> {
    let mut out = vec![];
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

pub fn fake_negotiator() -> (
    Negotiator<FakeBackend>,
    Shared,
    mpsc::UnboundedReceiver<Signal>,
) {
    let (channel, out) = channel();
    let (backend, state) = FakeBackend::new();
    let (negotiator, _status) = Negotiator::new(backend, channel);
    (negotiator, state, out)
}
