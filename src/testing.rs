//! Test doubles for the capability seams and an in-process relay harness

use crate::bus::{Envelope, EventBus, FramePipe};
use crate::call::{CallManager, CallManagerHandle, CallState};
use crate::config::ClientConfig;
use crate::hub::RelayHub;
use crate::media::{
    MediaCapture, MediaConstraints, MediaError, MediaStream, MediaTrack, TrackId, TrackKind,
    TrackSource,
};
use crate::peer::{IceServer, PeerConnectionState, PeerError, PeerEvent, PeerHandle, PeerSession, PeerTransport};
use crate::types::UserProfile;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// FAKE CAPTURE
// ============================================================================

#[derive(Default)]
struct CaptureState {
    streams: Vec<MediaStream>,
    displays: Vec<MediaStream>,
    acquire_error: Option<MediaError>,
    display_error: Option<MediaError>,
    gate: Option<Arc<Notify>>,
}

/// Hands out fresh tracks and remembers every stream it produced
#[derive(Default)]
pub(crate) struct FakeCapture {
    state: Mutex<CaptureState>,
}

impl FakeCapture {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_acquire(&self, error: MediaError) {
        self.state.lock().acquire_error = Some(error);
    }

    pub(crate) fn fail_display(&self, error: MediaError) {
        self.state.lock().display_error = Some(error);
    }

    /// Camera/mic acquisitions wait for a permit on the returned gate
    pub(crate) fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().gate = Some(Arc::clone(&gate));
        gate
    }

    /// Camera/mic acquisitions that succeeded
    pub(crate) fn acquisitions(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub(crate) fn display_acquisitions(&self) -> usize {
        self.state.lock().displays.len()
    }

    /// Tracks not yet released, across every stream handed out
    pub(crate) fn live_tracks(&self) -> usize {
        let state = self.state.lock();
        state
            .streams
            .iter()
            .chain(state.displays.iter())
            .flat_map(|s| s.tracks().iter())
            .filter(|t| t.is_live())
            .count()
    }

    pub(crate) fn last_stream(&self) -> Option<MediaStream> {
        self.state.lock().streams.last().cloned()
    }

    pub(crate) fn last_display(&self) -> Option<MediaStream> {
        self.state.lock().displays.last().cloned()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        let gate = self.state.lock().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.acquire_error.clone() {
            return Err(error);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackSource::Microphone, "fake mic"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackSource::Camera, "fake camera"));
        }
        let stream = MediaStream::new(tracks);
        state.streams.push(stream.clone());
        Ok(stream)
    }

    async fn acquire_display(&self) -> Result<MediaStream, MediaError> {
        let mut state = self.state.lock();
        if let Some(error) = state.display_error.clone() {
            return Err(error);
        }
        let stream = MediaStream::new(vec![MediaTrack::new(TrackSource::Display, "fake screen")]);
        state.displays.push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// FAKE TRANSPORT
// ============================================================================

const SDP_PREFIX: &str = "fake-sdp;tracks=";

fn encode_sdp(kinds: &[TrackKind]) -> String {
    let names: Vec<&str> = kinds
        .iter()
        .map(|k| match k {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
        .collect();
    format!("{SDP_PREFIX}{}", names.join(","))
}

fn decode_sdp(sdp: &str) -> Result<Vec<TrackKind>, PeerError> {
    let list = sdp
        .strip_prefix(SDP_PREFIX)
        .ok_or_else(|| PeerError::InvalidSdp(sdp.to_string()))?;
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "audio" => Ok(TrackKind::Audio),
            "video" => Ok(TrackKind::Video),
            other => Err(PeerError::InvalidSdp(other.to_string())),
        })
        .collect()
}

#[derive(Default)]
struct PeerState {
    senders: Vec<(TrackKind, Option<TrackId>)>,
    remote_kinds: Option<Vec<TrackKind>>,
    remote_candidates: usize,
    local_candidates: usize,
    connected: bool,
    closed: bool,
    replacements: usize,
}

/// Signal-driven stand-in for a peer connection.
///
/// Connects once it has a remote description and at least one remote
/// candidate, then reports one remote track per kind the other side offered.
pub(crate) struct FakePeer {
    state: Mutex<PeerState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeer {
    pub(crate) fn sender_track(&self, kind: TrackKind) -> Option<TrackId> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|(k, _)| *k == kind)
            .and_then(|(_, id)| *id)
    }

    pub(crate) fn replacements(&self) -> usize {
        self.state.lock().replacements
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simulates ICE failure
    pub(crate) fn fail(&self) {
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Failed));
    }

    fn local_sdp(state: &PeerState) -> String {
        let kinds: Vec<TrackKind> = state.senders.iter().map(|(k, _)| *k).collect();
        encode_sdp(&kinds)
    }

    fn emit_local_candidate(&self, state: &mut PeerState) {
        state.local_candidates += 1;
        let _ = self.events.send(PeerEvent::LocalCandidate(format!(
            "candidate:{}",
            state.local_candidates
        )));
    }

    fn maybe_connect(&self, state: &mut PeerState) {
        if state.connected || state.remote_candidates == 0 {
            return;
        }
        let Some(kinds) = state.remote_kinds.clone() else {
            return;
        };
        state.connected = true;
        for kind in kinds {
            let _ = self.events.send(PeerEvent::RemoteTrack { kind });
        }
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Connected));
    }
}

struct FakeSession(Arc<FakePeer>);

#[async_trait]
impl PeerSession for FakeSession {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.0.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.senders.push((track.kind(), Some(track.id())));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<&MediaTrack>) -> Result<(), PeerError> {
        let mut state = self.0.state.lock();
        let slot = state
            .senders
            .iter_mut()
            .find(|(k, _)| *k == kind)
            .ok_or(PeerError::NoSender(kind))?;
        slot.1 = track.map(MediaTrack::id);
        state.replacements += 1;
        Ok(())
    }

    fn sender_track(&self, kind: TrackKind) -> Option<TrackId> {
        self.0.sender_track(kind)
    }

    fn has_sender(&self, kind: TrackKind) -> bool {
        self.0.state.lock().senders.iter().any(|(k, _)| *k == kind)
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let mut state = self.0.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        self.0.emit_local_candidate(&mut state);
        Ok(FakePeer::local_sdp(&state))
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError> {
        let kinds = decode_sdp(&sdp)?;
        let mut state = self.0.state.lock();
        state.remote_kinds = Some(kinds);
        self.0.emit_local_candidate(&mut state);
        self.0.maybe_connect(&mut state);
        Ok(FakePeer::local_sdp(&state))
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        let kinds = decode_sdp(&sdp)?;
        let mut state = self.0.state.lock();
        state.remote_kinds = Some(kinds);
        self.0.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: String) -> Result<(), PeerError> {
        let mut state = self.0.state.lock();
        if state.remote_kinds.is_none() {
            return Err(PeerError::InvalidCandidate("no remote description".to_string()));
        }
        state.remote_candidates += 1;
        self.0.maybe_connect(&mut state);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.0.state.lock();
        state.closed = true;
        let _ = self
            .0
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    attempts: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Peer creation waits for a permit on the returned gate
    pub(crate) fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Calls to `create`, including ones still held
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub(crate) fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create(&self, _ice_servers: &[IceServer]) -> Result<PeerHandle, PeerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            state: Mutex::new(PeerState::default()),
            events: events_tx,
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(PeerHandle {
            session: Box::new(FakeSession(peer)),
            events,
        })
    }
}

// ============================================================================
// RELAY HARNESS
// ============================================================================

/// A client wired to an in-process hub with fake capabilities
pub(crate) struct TestClient {
    pub(crate) profile: UserProfile,
    pub(crate) bus: EventBus,
    pub(crate) calls: CallManagerHandle,
    pub(crate) capture: Arc<FakeCapture>,
    pub(crate) transport: Arc<FakeTransport>,
}

impl TestClient {
    pub(crate) async fn connect(hub: &RelayHub, id: &str) -> Self {
        let profile = UserProfile::new(id, id);
        let bus = EventBus::connect(Arc::new(hub.clone()), profile.clone(), &ClientConfig::default())
            .await
            .expect("hub connection");
        let capture = FakeCapture::new();
        let transport = FakeTransport::new();
        let calls = CallManager::spawn(bus.clone(), capture.clone(), transport.clone(), Vec::new());
        Self {
            profile,
            bus,
            calls,
            capture,
            transport,
        }
    }

    pub(crate) async fn wait_for(&self, state: CallState) {
        let mut rx = self.calls.watch_snapshot();
        let reached = tokio::time::timeout(
            WAIT,
            rx.wait_for(|s| s.as_ref().map(|s| s.state) == Some(state)),
        )
        .await
        .is_ok_and(|seen| seen.is_ok());
        assert!(
            reached,
            "{} never reached {:?} (now {:?})",
            self.profile.id,
            state,
            self.calls.state()
        );
    }
}

/// Raw hub connection for scripting one side of a call by hand
pub(crate) struct RawPeer {
    pub(crate) profile: UserProfile,
    pipe: FramePipe,
}

impl RawPeer {
    pub(crate) fn attach(hub: &RelayHub, id: &str) -> Self {
        let profile = UserProfile::new(id, id);
        let pipe = hub.attach(profile.clone());
        Self { profile, pipe }
    }

    pub(crate) fn send(&self, envelope: Envelope) {
        let frame = serde_json::to_string(&envelope).expect("encode envelope");
        self.pipe.outbound.send(frame).expect("hub gone");
    }

    /// Next envelope matching `pred`, skipping the rest
    pub(crate) async fn expect(&mut self, pred: impl Fn(&Envelope) -> bool) -> Envelope {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.pipe.inbound.recv().await.expect("pipe closed");
                let envelope: Envelope = serde_json::from_str(&frame).expect("valid envelope");
                if pred(&envelope) {
                    return envelope;
                }
            }
        })
        .await
        .expect("expected envelope never arrived")
    }
}

/// Polls `cond` until it holds or the wait runs out
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
