//! The single live call
//!
//! A `CallSession` exclusively owns the local camera/mic stream, the display
//! stream while sharing, and the peer session. [`CallSession::release`] is
//! the only place those are let go of.

use super::state::{CallRole, CallSnapshot, CallState, EndReason, LocalPreview};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::peer::PeerSession;
use crate::types::{CallId, CallKind, UserProfile};

pub struct CallSession {
    pub(super) id: CallId,
    pub(super) kind: CallKind,
    pub(super) role: CallRole,
    pub(super) peer: UserProfile,
    pub(super) state: CallState,

    pub(super) local_stream: Option<MediaStream>,
    pub(super) screen_stream: Option<MediaStream>,
    pub(super) transport: Option<Box<dyn PeerSession>>,

    pub(super) audio_enabled: bool,
    pub(super) video_enabled: bool,
    pub(super) preview: LocalPreview,

    /// Remote track kinds reported by the transport
    pub(super) remote_tracks: Vec<TrackKind>,
    pub(super) connected: bool,
    pub(super) remote_description_set: bool,
    /// Remote candidates received before the remote description
    pub(super) pending_candidates: Vec<String>,
    /// The other party knows about this call (hangups are only sent then)
    pub(super) announced: bool,
    pub(super) end_reason: Option<EndReason>,
}

impl CallSession {
    pub(super) fn new(id: CallId, kind: CallKind, role: CallRole, peer: UserProfile) -> Self {
        let state = match role {
            CallRole::Initiator => CallState::Requesting,
            CallRole::Receiver => CallState::Ringing,
        };
        Self {
            id,
            kind,
            role,
            peer,
            state,
            local_stream: None,
            screen_stream: None,
            transport: None,
            audio_enabled: true,
            video_enabled: kind.has_video(),
            preview: LocalPreview::None,
            remote_tracks: Vec::new(),
            connected: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            announced: role == CallRole::Receiver,
            end_reason: None,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    /// Takes ownership of freshly acquired media, applying the current flags
    pub(super) fn attach_local_stream(&mut self, stream: MediaStream) {
        if let Some(track) = stream.audio_track() {
            track.set_enabled(self.audio_enabled);
        }
        if let Some(track) = stream.video_track() {
            track.set_enabled(self.video_enabled);
            self.preview = LocalPreview::Camera(stream.id());
        }
        self.local_stream = Some(stream);
    }

    pub(super) fn local_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        let stream = self.local_stream.as_ref()?;
        match kind {
            TrackKind::Audio => stream.audio_track(),
            TrackKind::Video => stream.video_track(),
        }
    }

    /// Live camera track, if the camera was acquired and not released since
    pub(super) fn live_camera(&self) -> Option<MediaTrack> {
        self.local_track(TrackKind::Video)
            .filter(|t| t.is_live())
            .cloned()
    }

    /// Becomes `Active` once connectivity and a remote track are both in
    pub(super) fn ready_to_activate(&self) -> bool {
        self.state == CallState::Negotiating && self.connected && !self.remote_tracks.is_empty()
    }

    /// Stops every held stream and closes the transport.
    ///
    /// Safe to call more than once; release failures are logged and
    /// swallowed so the session always reaches `Ended`.
    pub(super) async fn release(&mut self) {
        let mut released = 0;
        if let Some(stream) = self.screen_stream.take() {
            released += stream.stop();
        }
        if let Some(stream) = self.local_stream.take() {
            released += stream.stop();
        }
        self.pending_candidates.clear();

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(call_id = %self.id, "Failed to close peer session: {}", e);
            }
        }

        tracing::debug!(call_id = %self.id, released, "Call resources released");
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            kind: self.kind,
            role: self.role,
            state: self.state,
            peer: self.peer.clone(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            preview: self.preview,
            end_reason: self.end_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    fn camera_stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackSource::Microphone, "mic"),
            MediaTrack::new(TrackSource::Camera, "cam"),
        ])
    }

    #[test]
    fn test_flags_applied_on_attach() {
        let mut session = CallSession::new(
            CallId::generate(),
            CallKind::Video,
            CallRole::Initiator,
            UserProfile::new("bob", "bob"),
        );
        session.audio_enabled = false;

        let stream = camera_stream();
        session.attach_local_stream(stream.clone());

        assert!(!stream.audio_track().unwrap().is_enabled());
        assert!(stream.video_track().unwrap().is_enabled());
        assert_eq!(session.preview, LocalPreview::Camera(stream.id()));
    }

    #[test]
    fn test_audio_call_starts_with_video_off() {
        let session = CallSession::new(
            CallId::generate(),
            CallKind::Audio,
            CallRole::Receiver,
            UserProfile::new("bob", "bob"),
        );
        assert!(!session.video_enabled);
        assert_eq!(session.state, CallState::Ringing);
        assert!(session.announced);
    }

    #[tokio::test]
    async fn test_release_stops_everything_once() {
        let mut session = CallSession::new(
            CallId::generate(),
            CallKind::Video,
            CallRole::Initiator,
            UserProfile::new("bob", "bob"),
        );
        let stream = camera_stream();
        let screen = MediaStream::new(vec![MediaTrack::new(TrackSource::Display, "screen")]);
        session.attach_local_stream(stream.clone());
        session.screen_stream = Some(screen.clone());

        session.release().await;
        session.release().await;

        assert!(!stream.is_live());
        assert!(!screen.is_live());
        assert!(session.local_stream.is_none());
        assert!(session.live_camera().is_none());
    }
}
