//! Media control surface
//!
//! Mute, hang-up and screen sharing. These mutate the local media set and the
//! peer connection's outgoing tracks without sending any negotiation message.

use tracing::{debug, error, info, warn};

use crate::model::session::{Phase, Presentation};
use crate::model::tracks::TrackKind;
use crate::negotiation::{MediaBackend, Negotiator, PeerConnection};

impl<B: MediaBackend> Negotiator<B> {
    /// Flips the mute state and applies it to every outgoing audio track.
    pub fn toggle_mute(&mut self) {
        let muted = !self.muted;

        let mut applied = 0;
        for track in self.media.tracks_mut().filter(|t| t.kind == TrackKind::Audio) {
            track.enabled = !muted;
            applied += 1;
        }

        if applied == 0 {
            debug!("No audio tracks to mute");
            return;
        }

        self.muted = muted;
        info!(
            "{} {} audio track(s)",
            if self.muted { "Muted" } else { "Unmuted" },
            applied
        );
        self.publish();
    }

    /// Closes the peer connection and stops all local tracks.
    ///
    /// Calling it again once closed does nothing.
    pub fn hang_up(&mut self) {
        if self.phase == Phase::Closed {
            debug!("Already hung up");
            return;
        }

        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }

        self.media.stop_all();
        self.remote = None;
        self.pending_candidates.clear();
        self.muted = false;
        self.sharing = false;
        self.presentation = Presentation::Remote;

        info!("Hung up");
        self.transition(Phase::Closed);
    }

    /// Captures the screen and adds its tracks to the peer connection.
    ///
    /// The new tracks are not offered to the remote until the next locally
    /// created offer.
    pub fn start_screen_share(&mut self) {
        if self.sharing {
            debug!("Already sharing the screen");
            return;
        }

        let Some(peer) = self.peer.as_mut() else {
            warn!("Cannot share the screen without a peer connection");
            return;
        };

        let mut stream = match self.backend.capture_display() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Error sharing screen: {}", e);
                self.last_error = Some(e.to_string());
                self.publish();
                return;
            }
        };

        for track in stream.tracks.iter_mut().filter(|t| t.kind == TrackKind::Audio) {
            track.enabled = !self.muted;
        }

        for track in &stream.tracks {
            if let Err(e) = peer.add_track(track, &stream.id) {
                warn!("Could not add screen {} track: {}", track.kind, e);
            }
        }

        info!("Sharing screen ({} track(s))", stream.tracks.len());

        match self.media.screen.as_mut() {
            Some(screen) => screen.tracks.extend(stream.tracks),
            None => self.media.screen = Some(stream),
        }
        self.sharing = true;
        self.presentation = Presentation::LocalScreen;
        self.publish();
    }

    /// Stops and removes every outgoing video track. Audio is left alone.
    pub fn stop_screen_share(&mut self) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };

        let video: Vec<_> = peer
            .senders()
            .into_iter()
            .filter(|s| s.kind == TrackKind::Video)
            .collect();

        for sender in &video {
            if let Some(track) = self.media.track_mut(sender.track_id) {
                track.stop();
            }
            if let Err(e) = peer.remove_track(sender.track_id) {
                warn!("Could not remove {}: {}", sender.track_id, e);
            }
        }

        if let Some(screen) = self.media.screen.as_mut() {
            screen.tracks.retain(|t| t.live);
            if screen.tracks.is_empty() {
                self.media.screen = None;
            }
        }

        if video.is_empty() && !self.sharing {
            debug!("Not sharing the screen");
            return;
        }

        info!("Stopped sharing screen ({} video track(s))", video.len());
        self.sharing = false;
        self.presentation = Presentation::Remote;
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use crate::model::session::{Command, Input, Phase, Presentation};
    use crate::model::signal::Signal;
    use crate::model::tracks::{TrackKind, TrackSource};
    use crate::negotiation::PeerConnection;
    use crate::testing::{drain, fake_negotiator};

    #[test]
    fn mute_flips_every_audio_track() {
        let (mut n, _state, _out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Command(Command::StartScreenShare));
        n.handle(Input::Command(Command::ToggleMute));

        let before: Vec<_> = n
            .media()
            .tracks()
            .filter(|t| t.kind == TrackKind::Audio)
            .map(|t| (t.id, t.enabled))
            .collect();
        assert_eq!(before.len(), 2);

        n.handle(Input::Command(Command::ToggleMute));

        for (id, enabled) in before {
            let track = n.media().tracks().find(|t| t.id == id).unwrap();
            assert_eq!(track.enabled, !enabled);
        }
    }

    #[test]
    fn screen_audio_follows_mute_state() {
        let (mut n, _state, _out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Command(Command::ToggleMute));

        n.handle(Input::Command(Command::StartScreenShare));

        let audio = |n: &crate::negotiation::Negotiator<crate::testing::FakeBackend>| {
            n.media()
                .tracks()
                .filter(|t| t.kind == TrackKind::Audio)
                .map(|t| (t.source, t.enabled))
                .collect::<Vec<_>>()
        };
        assert!(n.status().muted);
        assert_eq!(
            audio(&n),
            vec![(TrackSource::Microphone, false), (TrackSource::Screen, false)]
        );

        n.handle(Input::Command(Command::ToggleMute));

        assert!(!n.status().muted);
        assert_eq!(
            audio(&n),
            vec![(TrackSource::Microphone, true), (TrackSource::Screen, true)]
        );
    }

    #[test]
    fn mute_sends_nothing() {
        let (mut n, state, mut out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Command(Command::StartCall));
        drain(&mut out);
        let offers = state.borrow().offers_created;

        n.handle(Input::Command(Command::ToggleMute));

        assert!(n.status().muted);
        assert!(drain(&mut out).is_empty());
        assert_eq!(state.borrow().offers_created, offers);
        assert_eq!(n.phase(), Phase::Offering);

        n.handle(Input::Command(Command::ToggleMute));
        assert!(!n.status().muted);
    }

    #[test]
    fn hang_up_is_idempotent() {
        let (mut n, state, _out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Command(Command::StartCall));

        n.handle(Input::Command(Command::HangUp));
        let first = n.status();
        n.handle(Input::Command(Command::HangUp));

        assert_eq!(n.status(), first);
        assert_eq!(first.phase, Phase::Closed);
        assert_eq!(state.borrow().closes, 1);
        assert!(n.peer().is_none());
        assert!(n.media().is_empty());
    }

    #[test]
    fn hang_up_stops_tracks_and_clears_remote() {
        let (mut n, _state, _out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Signal(Signal::Offer(serde_json::json!({"sdp": "X"}))));
        n.handle(Input::Peer(crate::model::session::PeerEvent::RemoteTrack(
            crate::model::tracks::RemoteTrack {
                id: "0".to_string(),
                kind: TrackKind::Audio,
            },
        )));
        assert!(n.status().connected());

        n.hang_up();

        let status = n.status();
        assert_eq!(status.phase, Phase::Closed);
        assert!(status.remote.is_none());
        assert!(!status.controls_enabled());
    }

    #[test]
    fn inputs_after_hang_up_are_ignored() {
        let (mut n, _state, mut out) = fake_negotiator();
        n.start().unwrap();
        n.hang_up();
        drain(&mut out);

        n.handle(Input::Signal(Signal::Offer(serde_json::json!({"sdp": "X"}))));
        n.handle(Input::Command(Command::StartCall));
        n.handle(Input::Command(Command::StartScreenShare));

        assert_eq!(n.phase(), Phase::Closed);
        assert!(drain(&mut out).is_empty());
    }

    #[test]
    fn screen_share_adds_tracks_without_renegotiating() {
        let (mut n, state, mut out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Command(Command::StartCall));
        drain(&mut out);

        n.handle(Input::Command(Command::StartScreenShare));

        let status = n.status();
        assert!(status.sharing);
        assert_eq!(status.presentation, Presentation::LocalScreen);
        assert_eq!(n.peer().unwrap().senders().len(), 3);
        assert_eq!(state.borrow().offers_created, 1);
        assert!(drain(&mut out).is_empty());
    }

    #[test]
    fn stop_screen_share_removes_only_video() {
        let (mut n, state, _out) = fake_negotiator();
        n.start().unwrap();
        n.handle(Input::Command(Command::StartScreenShare));

        n.handle(Input::Command(Command::StopScreenShare));

        let senders = n.peer().unwrap().senders();
        assert_eq!(senders.len(), 2);
        assert!(senders.iter().all(|s| s.kind == TrackKind::Audio));
        assert_eq!(state.borrow().removed.len(), 1);

        let status = n.status();
        assert!(!status.sharing);
        assert_eq!(status.presentation, Presentation::Remote);

        // The screen's audio keeps flowing.
        let screen_audio = n
            .media()
            .tracks()
            .filter(|t| t.source == TrackSource::Screen)
            .collect::<Vec<_>>();
        assert_eq!(screen_audio.len(), 1);
        assert_eq!(screen_audio[0].kind, TrackKind::Audio);
        assert!(screen_audio[0].live);
    }

    #[test]
    fn denied_screen_capture_keeps_call() {
        let (mut n, state, _out) = fake_negotiator();
        n.start().unwrap();
        state.borrow_mut().deny_display = true;

        n.handle(Input::Command(Command::StartScreenShare));

        let status = n.status();
        assert!(!status.sharing);
        assert_eq!(status.phase, Phase::MediaAcquired);
        assert!(status.last_error.is_some());
        assert_eq!(n.peer().unwrap().senders().len(), 1);
    }

    #[test]
    fn share_can_restart_after_stop() {
        let (mut n, _state, _out) = fake_negotiator();
        n.start().unwrap();
        n.start_screen_share();
        n.stop_screen_share();
        n.start_screen_share();

        assert!(n.status().sharing);
        let screen = n.media().screen.as_ref().unwrap();
        assert_eq!(screen.tracks.len(), 3);
        assert_eq!(
            screen
                .tracks
                .iter()
                .filter(|t| t.kind == TrackKind::Video)
                .count(),
            1
        );
    }
}
