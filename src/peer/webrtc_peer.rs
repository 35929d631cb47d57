//! webrtc-rs backed Peer Transport
//!
//! One `RTCPeerConnection` per call. Connection-state and ICE callbacks are
//! forwarded as [`PeerEvent`]s; senders are tracked per kind so screen sharing
//! can swap the video source in place.
//!
//! Remote tracks are reported from the negotiated remote description rather
//! than from `on_track`, which webrtc-rs only fires once the first RTP packet
//! arrives.

use super::{IceServer, PeerConnectionState, PeerError, PeerEvent, PeerHandle, PeerSession, PeerTransport};
use crate::media::{MediaTrack, TrackId, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "convotalk";

fn rtc_err(e: webrtc::Error) -> PeerError {
    PeerError::Transport(e.to_string())
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Creates webrtc-rs peer connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }

    fn rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
        ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<PeerHandle, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        // Interceptors for RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: Self::rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);

        let (event_tx, events) = mpsc::unbounded_channel();
        register_handlers(&pc, event_tx.clone());

        tracing::debug!("Created webrtc peer connection");

        Ok(PeerHandle {
            session: Box::new(WebRtcSession {
                pc,
                senders: Mutex::new(HashMap::new()),
                events: event_tx,
            }),
            events,
        })
    }
}

/// Translates peer connection callbacks into events
fn register_handlers(pc: &Arc<RTCPeerConnection>, event_tx: mpsc::UnboundedSender<PeerEvent>) {
    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        let state = match s {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            let _ = tx.send(PeerEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json().map(|init| serde_json::to_string(&init)) {
                Ok(Ok(json)) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(json));
                }
                Ok(Err(e)) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                Err(e) => tracing::warn!("Failed to encode ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _, _| {
        if matches!(track.kind(), RTPCodecType::Audio | RTPCodecType::Video) {
            tracing::debug!(kind = ?track.kind(), "First RTP packet on remote track");
        }
        Box::pin(async {})
    }));
}

/// Media kinds the remote side announces it sends (`sendrecv`/`sendonly`)
fn remote_sending_kinds(desc: &RTCSessionDescription) -> Result<Vec<TrackKind>, PeerError> {
    let parsed = desc
        .unmarshal()
        .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

    let mut kinds = Vec::new();
    for media in &parsed.media_descriptions {
        let kind = match media.media_name.media.as_str() {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => continue,
        };
        let sending = media.attribute("sendrecv").is_some() || media.attribute("sendonly").is_some();
        if sending && !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

// ============================================================================
// SESSION
// ============================================================================

struct SenderSlot {
    sender: Arc<RTCRtpSender>,
    track_id: Option<TrackId>,
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, SenderSlot>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl WebRtcSession {
    async fn apply_remote(&self, desc: RTCSessionDescription) -> Result<(), PeerError> {
        let kinds = remote_sending_kinds(&desc)?;
        self.pc.set_remote_description(desc).await.map_err(rtc_err)?;

        for kind in kinds {
            tracing::info!(?kind, "Remote track negotiated");
            let _ = self.events.send(PeerEvent::RemoteTrack { kind });
        }
        Ok(())
    }

    /// Local RTP source for a captured track; the capture backend feeds samples
    fn local_source(track: &MediaTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        let codec = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ))
    }
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(Self::local_source(track))
            .await
            .map_err(rtc_err)?;

        self.senders.lock().insert(
            track.kind(),
            SenderSlot {
                sender,
                track_id: Some(track.id()),
            },
        );
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .map(|slot| Arc::clone(&slot.sender))
            .ok_or(PeerError::NoSender(kind))?;

        sender
            .replace_track(track.map(Self::local_source))
            .await
            .map_err(rtc_err)?;

        if let Some(slot) = self.senders.lock().get_mut(&kind) {
            slot.track_id = track.map(MediaTrack::id);
        }
        Ok(())
    }

    fn sender_track(&self, kind: TrackKind) -> Option<TrackId> {
        self.senders.lock().get(&kind).and_then(|slot| slot.track_id)
    }

    fn has_sender(&self, kind: TrackKind) -> bool {
        self.senders.lock().contains_key(&kind)
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError> {
        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.apply_remote(offer).await?;

        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.apply_remote(answer).await
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))?;
        self.pc.add_ice_candidate(init).await.map_err(rtc_err)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(rtc_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use std::time::Duration;

    async fn with_tracks(kinds: &[TrackSource]) -> PeerHandle {
        let handle = WebRtcTransport::new().create(&[]).await.unwrap();
        for source in kinds {
            let track = MediaTrack::new(*source, "local");
            handle.session.add_track(&track).await.unwrap();
        }
        handle
    }

    #[derive(Default)]
    struct Seen {
        connected: bool,
        remote: Vec<TrackKind>,
    }

    impl Seen {
        fn record(&mut self, event: PeerEvent) {
            match event {
                PeerEvent::ConnectionState(PeerConnectionState::Connected) => self.connected = true,
                PeerEvent::RemoteTrack { kind } if !self.remote.contains(&kind) => {
                    self.remote.push(kind)
                }
                _ => {}
            }
        }

        fn done(&self) -> bool {
            self.connected && self.remote.len() == 2
        }
    }

    #[tokio::test]
    async fn test_loopback_connects_and_reports_remote_tracks() {
        let sources = [TrackSource::Microphone, TrackSource::Camera];
        let mut offerer = with_tracks(&sources).await;
        let mut answerer = with_tracks(&sources).await;

        let offer = offerer.session.create_offer().await.unwrap();
        let answer = answerer.session.accept_offer(offer).await.unwrap();
        offerer.session.accept_answer(answer).await.unwrap();

        let mut offerer_seen = Seen::default();
        let mut answerer_seen = Seen::default();
        let finished = tokio::time::timeout(Duration::from_secs(20), async {
            while !(offerer_seen.done() && answerer_seen.done()) {
                tokio::select! {
                    Some(event) = offerer.events.recv() => match event {
                        PeerEvent::LocalCandidate(c) => answerer.session.add_ice_candidate(c).await.unwrap(),
                        other => offerer_seen.record(other),
                    },
                    Some(event) = answerer.events.recv() => match event {
                        PeerEvent::LocalCandidate(c) => offerer.session.add_ice_candidate(c).await.unwrap(),
                        other => answerer_seen.record(other),
                    },
                    else => break,
                }
            }
        })
        .await;

        assert!(finished.is_ok(), "loopback call never connected");
        for seen in [&offerer_seen, &answerer_seen] {
            assert!(seen.connected);
            assert!(seen.remote.contains(&TrackKind::Audio));
            assert!(seen.remote.contains(&TrackKind::Video));
        }

        let _ = offerer.session.close().await;
        let _ = answerer.session.close().await;
    }

    #[tokio::test]
    async fn test_remote_tracks_reported_before_any_media() {
        let offerer = with_tracks(&[TrackSource::Microphone]).await;
        let mut answerer = with_tracks(&[TrackSource::Microphone]).await;

        let offer = offerer.session.create_offer().await.unwrap();
        answerer.session.accept_offer(offer).await.unwrap();

        let mut remote = Vec::new();
        while let Ok(event) = answerer.events.try_recv() {
            if let PeerEvent::RemoteTrack { kind } = event {
                remote.push(kind);
            }
        }
        assert_eq!(remote, vec![TrackKind::Audio]);

        let _ = offerer.session.close().await;
        let _ = answerer.session.close().await;
    }

    #[tokio::test]
    async fn test_offer_carries_added_tracks() {
        let handle = WebRtcTransport::new().create(&[]).await.unwrap();
        let mic = MediaTrack::new(TrackSource::Microphone, "mic");
        let cam = MediaTrack::new(TrackSource::Camera, "cam");

        handle.session.add_track(&mic).await.unwrap();
        handle.session.add_track(&cam).await.unwrap();

        let sdp = handle.session.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        assert_eq!(handle.session.sender_track(TrackKind::Video), Some(cam.id()));

        handle.session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_swaps_sender_source() {
        let handle = WebRtcTransport::new().create(&[]).await.unwrap();
        let cam = MediaTrack::new(TrackSource::Camera, "cam");
        let screen = MediaTrack::new(TrackSource::Display, "screen");
        handle.session.add_track(&cam).await.unwrap();

        handle
            .session
            .replace_track(TrackKind::Video, Some(&screen))
            .await
            .unwrap();
        assert_eq!(handle.session.sender_track(TrackKind::Video), Some(screen.id()));

        handle
            .session
            .replace_track(TrackKind::Video, Some(&cam))
            .await
            .unwrap();
        assert_eq!(handle.session.sender_track(TrackKind::Video), Some(cam.id()));

        let _ = handle.session.close().await;
    }

    #[tokio::test]
    async fn test_replace_without_sender_fails() {
        let handle = WebRtcTransport::new().create(&[]).await.unwrap();
        let screen = MediaTrack::new(TrackSource::Display, "screen");
        let result = handle
            .session
            .replace_track(TrackKind::Video, Some(&screen))
            .await;
        assert!(matches!(result, Err(PeerError::NoSender(TrackKind::Video))));
        let _ = handle.session.close().await;
    }

    #[test]
    fn test_ice_server_mapping() {
        let servers = WebRtcTransport::rtc_ice_servers(&[IceServer {
            urls: vec!["turn:turn.example:3478".to_string()],
            username: Some("u".to_string()),
            credential: Some("p".to_string()),
        }]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }
}
