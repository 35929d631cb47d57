//! Call session manager
//!
//! One actor task owns the (at most one) [`CallSession`]. User commands,
//! call signaling from the bus, transport events and the end of a shared
//! display track are folded into a single `select!` loop, so the session
//! only ever has one writer.
//!
//! Handshake (both sides):
//! 1. initiator → `call_incoming` (after local media is acquired)
//! 2. receiver accepts, creates the transport → `call_offer`
//! 3. initiator applies the offer → `call_answer`
//! 4. both trickle `call_ice_candidate`; early candidates are buffered

use super::error::CallError;
use super::session::CallSession;
use super::state::{CallEvent, CallRole, CallSnapshot, CallState, EndReason, LocalPreview};
use crate::bus::{Body, Envelope, EnvelopeKind, EventBus, Subscription, TransportError};
use crate::media::{MediaCapture, MediaConstraints, MediaError, MediaStream, MediaTrack, TrackKind};
use crate::peer::{
    IceServer, PeerConnectionState, PeerError, PeerEvent, PeerHandle, PeerSession, PeerTransport,
};
use crate::types::{CallId, CallKind, UserId, UserProfile};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate {
        target: UserProfile,
        kind: CallKind,
        reply: Reply<CallId>,
    },
    Accept(Reply<()>),
    Reject(Reply<()>),
    End(Reply<()>),
    ToggleAudio(Reply<bool>),
    ToggleVideo(Reply<bool>),
    StartScreenShare(Reply<()>),
    StopScreenShare(Reply<()>),
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cloneable front end of the call manager
#[derive(Clone)]
pub struct CallManagerHandle {
    commands: mpsc::Sender<Command>,
    abort: Arc<watch::Sender<u64>>,
    snapshot: watch::Receiver<Option<CallSnapshot>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManagerHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::ManagerGone)?;
        response.await.map_err(|_| CallError::ManagerGone)?
    }

    /// Starts an outgoing call. Returns once local media is acquired and
    /// the callee has been signaled; the call then waits in `Requesting`.
    pub async fn initiate_call(&self, target: UserProfile, kind: CallKind) -> Result<CallId, CallError> {
        self.request(|reply| Command::Initiate { target, kind, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Command::Reject).await
    }

    /// Ends the current call from any state, cancelling in-flight media
    /// acquisition or negotiation first
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.abort.send_modify(|epoch| *epoch += 1);
        self.request(Command::End).await
    }

    /// Returns the new audio-enabled flag
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleAudio).await
    }

    /// Returns the new video-enabled flag
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleVideo).await
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(Command::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(Command::StopScreenShare).await
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot
            .borrow()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<CallSnapshot>> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// Runs `work` until it finishes or `end_call` bumps the abort epoch
async fn guarded<T>(
    mut abort: watch::Receiver<u64>,
    work: impl Future<Output = T>,
) -> Result<T, CallError> {
    tokio::select! {
        output = work => Ok(output),
        _ = abort.changed() => Err(CallError::Cancelled),
    }
}

/// Like [`guarded`], for work that yields a resource: the work runs as its
/// own task, and if it completes after cancellation `reap` disposes of the
/// late result.
async fn detached<T, F, R>(abort: watch::Receiver<u64>, work: F, reap: R) -> Result<T, CallError>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
    R: FnOnce(T) + Send + 'static,
{
    let mut abort = abort;
    let mut task = tokio::spawn(work);
    tokio::select! {
        joined = &mut task => {
            joined.map_err(|e| CallError::Negotiation(format!("background task failed: {e}")))
        }
        _ = abort.changed() => {
            tokio::spawn(async move {
                if let Ok(late) = task.await {
                    reap(late);
                }
            });
            Err(CallError::Cancelled)
        }
    }
}

fn end_reason_for(error: &CallError) -> EndReason {
    match error {
        CallError::MediaAccess(e) => EndReason::MediaAccess(e.to_string()),
        CallError::Transport(e) => EndReason::Transport(e.to_string()),
        CallError::Cancelled => EndReason::Hangup,
        other => EndReason::Negotiation(other.to_string()),
    }
}

fn constraints_for(kind: CallKind) -> MediaConstraints {
    MediaConstraints {
        audio: true,
        video: kind.has_video(),
    }
}

async fn next_signal(signals: &mut Option<Subscription>) -> Option<Envelope> {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_peer_event(events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn track_ended(track: Option<MediaTrack>) {
    match track {
        Some(track) => track.ended().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// ACTOR
// ============================================================================

pub struct CallManager {
    local: UserProfile,
    bus: EventBus,
    capture: Arc<dyn MediaCapture>,
    transport: Arc<dyn PeerTransport>,
    ice_servers: Vec<IceServer>,

    session: Option<CallSession>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    /// Video track of the display stream while sharing
    screen_track: Option<MediaTrack>,

    abort: watch::Receiver<u64>,
    /// `abort` as seen when the current command or signal was dequeued
    armed: watch::Receiver<u64>,
    snapshot_tx: watch::Sender<Option<CallSnapshot>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Subscribes to call signaling on `bus` and starts the actor
    pub fn spawn(
        bus: EventBus,
        capture: Arc<dyn MediaCapture>,
        transport: Arc<dyn PeerTransport>,
        ice_servers: Vec<IceServer>,
    ) -> CallManagerHandle {
        let signals = bus.subscribe(&EnvelopeKind::CALL);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (abort_tx, abort_rx) = watch::channel(0);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let manager = CallManager {
            local: bus.profile().clone(),
            bus,
            capture,
            transport,
            ice_servers,
            session: None,
            peer_events: None,
            screen_track: None,
            armed: abort_rx.clone(),
            abort: abort_rx,
            snapshot_tx,
            events: events.clone(),
        };
        tokio::spawn(manager.run(commands_rx, signals));

        CallManagerHandle {
            commands: commands_tx,
            abort: Arc::new(abort_tx),
            snapshot: snapshot_rx,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, signals: Subscription) {
        let mut signals = Some(signals);
        tracing::debug!(user = %self.local.id, "Call manager started");

        loop {
            let screen = self.screen_track.clone();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        self.arm();
                        self.handle_command(command).await
                    }
                    None => break,
                },
                envelope = next_signal(&mut signals) => match envelope {
                    Some(envelope) => {
                        self.arm();
                        self.handle_signal(envelope).await
                    }
                    None => {
                        tracing::warn!("Call signaling subscription closed");
                        signals = None;
                    }
                },
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => self.peer_events = None,
                },
                _ = track_ended(screen) => self.handle_screen_ended().await,
            }
        }

        self.finish(EndReason::Hangup).await;
        tracing::debug!(user = %self.local.id, "Call manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                target,
                kind,
                reply,
            } => {
                // The caller may have stopped waiting
                let _ = reply.send(self.initiate(target, kind).await);
            }
            Command::Accept(reply) => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject(reply) => {
                let _ = reply.send(self.reject().await);
            }
            Command::End(reply) => {
                let _ = reply.send(self.end().await);
            }
            Command::ToggleAudio(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Audio));
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Video));
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                let _ = reply.send(self.stop_screen_share().await);
            }
        }
    }

    // ========================================================================
    // SESSION BOOKKEEPING
    // ========================================================================

    fn current_state(&self) -> CallState {
        self.session
            .as_ref()
            .map(CallSession::state)
            .unwrap_or(CallState::Idle)
    }

    fn invalid(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.current_state(),
        }
    }

    /// The session, unless there is none or it already ended
    fn live_session(&mut self) -> Option<&mut CallSession> {
        self.session.as_mut().filter(|s| !s.is_ended())
    }

    fn is_current(&self, call_id: CallId, from: Option<&UserId>) -> bool {
        match &self.session {
            Some(s) if s.id == call_id && !s.is_ended() => from.map_or(true, |f| *f == s.peer.id),
            _ => false,
        }
    }

    fn transport_ref(&self) -> Result<&dyn PeerSession, CallError> {
        self.session
            .as_ref()
            .and_then(|s| s.transport.as_deref())
            .ok_or_else(|| CallError::Negotiation("no peer session".to_string()))
    }

    fn arm(&mut self) {
        let mut armed = self.abort.clone();
        armed.borrow_and_update();
        self.armed = armed;
    }

    /// Fires on any `end_call` since the work in hand was dequeued, even
    /// one that landed between two earlier steps
    fn abort_signal(&self) -> watch::Receiver<u64> {
        self.armed.clone()
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(self.session.as_ref().map(CallSession::snapshot));
    }

    fn notice(&self, text: impl Into<String>) {
        let _ = self.events.send(CallEvent::Notice(text.into()));
    }

    fn set_state(&mut self, state: CallState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == state {
            return;
        }
        tracing::info!(call_id = %session.id, from = ?session.state, to = ?state, "Call state changed");
        session.state = state;
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: session.id,
            state,
        });
        self.publish();
    }

    /// Installs a new session in place of an ended one (or none)
    fn install(&mut self, session: CallSession) {
        let (call_id, state) = (session.id, session.state);
        self.session = Some(session);
        self.peer_events = None;
        self.screen_track = None;
        let _ = self.events.send(CallEvent::StateChanged { call_id, state });
        self.publish();
    }

    fn signal(&self, to: &UserId, body: Body) -> Result<(), TransportError> {
        self.bus.send(Envelope::new(body).to(to.clone()))
    }

    /// The one terminal path: notify (best effort), release everything,
    /// mark `Ended`. No-op without a live session.
    async fn finish(&mut self, reason: EndReason) {
        let Some(session) = self.session.as_mut().filter(|s| !s.is_ended()) else {
            return;
        };
        let call_id = session.id;

        if session.announced && reason.notifies_peer() {
            let hangup = Envelope::new(Body::CallEnd {
                call_id,
                reason: reason.wire().to_string(),
            })
            .to(session.peer.id.clone());
            if let Err(e) = self.bus.send(hangup) {
                tracing::warn!(call_id = %call_id, "Hangup notice not delivered: {}", e);
            }
        }

        self.peer_events = None;
        self.screen_track = None;
        session.release().await;
        session.end_reason = Some(reason.clone());

        tracing::info!(call_id = %call_id, ?reason, "Call ended");
        self.set_state(CallState::Ended);
        let _ = self.events.send(CallEvent::Ended { call_id, reason });
    }

    // ========================================================================
    // CAPABILITY CALLS
    // ========================================================================

    async fn acquire_media(&self, constraints: MediaConstraints) -> Result<MediaStream, CallError> {
        let capture = Arc::clone(&self.capture);
        let acquired = detached(
            self.abort_signal(),
            async move { capture.acquire(constraints).await },
            |late: Result<MediaStream, MediaError>| {
                if let Ok(stream) = late {
                    tracing::info!(stream = %stream.id(), "Releasing media acquired after cancellation");
                    stream.stop();
                }
            },
        )
        .await?;
        Ok(acquired?)
    }

    async fn acquire_display(&self) -> Result<MediaStream, CallError> {
        let capture = Arc::clone(&self.capture);
        let acquired = detached(
            self.abort_signal(),
            async move { capture.acquire_display().await },
            |late: Result<MediaStream, MediaError>| {
                if let Ok(stream) = late {
                    stream.stop();
                }
            },
        )
        .await?;
        Ok(acquired?)
    }

    /// Creates the peer session and attaches every local track to it
    async fn open_transport(&mut self) -> Result<(), CallError> {
        let transport = Arc::clone(&self.transport);
        let ice_servers = self.ice_servers.clone();
        let PeerHandle { session, events } = detached(
            self.abort_signal(),
            async move { transport.create(&ice_servers).await },
            |late: Result<PeerHandle, PeerError>| {
                if let Ok(handle) = late {
                    tokio::spawn(async move {
                        let _ = handle.session.close().await;
                    });
                }
            },
        )
        .await??;

        let Some(call) = self.live_session() else {
            let _ = session.close().await;
            return Err(CallError::Cancelled);
        };
        call.transport = Some(session);
        self.peer_events = Some(events);

        let Some(call) = self.session.as_ref() else {
            return Err(CallError::Cancelled);
        };
        if let (Some(transport), Some(stream)) = (call.transport.as_deref(), call.local_stream.as_ref()) {
            for track in stream.tracks() {
                transport.add_track(track).await?;
            }
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let pending = std::mem::take(&mut session.pending_candidates);
        let Some(transport) = session.transport.as_deref() else {
            return;
        };
        if !pending.is_empty() {
            tracing::debug!(call_id = %session.id, count = pending.len(), "Applying buffered ICE candidates");
        }
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(call_id = %session.id, "Rejected ICE candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // USER COMMANDS
    // ========================================================================

    async fn initiate(&mut self, target: UserProfile, kind: CallKind) -> Result<CallId, CallError> {
        if self.live_session().is_some() {
            return Err(self.invalid("initiate_call"));
        }

        let call_id = CallId::generate();
        let peer_id = target.id.clone();
        tracing::info!(call_id = %call_id, to = %peer_id, ?kind, "Starting call");
        self.install(CallSession::new(call_id, kind, CallRole::Initiator, target));

        let stream = match self.acquire_media(constraints_for(kind)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(call_id = %call_id, "Local media unavailable: {}", e);
                self.finish(end_reason_for(&e)).await;
                return Err(e);
            }
        };
        match self.live_session() {
            Some(session) => session.attach_local_stream(stream),
            None => {
                stream.stop();
                return Err(CallError::Cancelled);
            }
        }
        self.publish();

        let caller = self.local.clone();
        if let Err(e) = self.signal(&peer_id, Body::CallIncoming { call_id, kind, caller }) {
            let e = CallError::from(e);
            self.finish(end_reason_for(&e)).await;
            return Err(e);
        }
        if let Some(session) = self.live_session() {
            session.announced = true;
        }
        Ok(call_id)
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let Some((call_id, kind, peer_id)) = self
            .session
            .as_ref()
            .filter(|s| s.state == CallState::Ringing)
            .map(|s| (s.id, s.kind, s.peer.id.clone()))
        else {
            return Err(self.invalid("accept_call"));
        };

        tracing::info!(call_id = %call_id, "Accepting call");
        self.set_state(CallState::Negotiating);

        match self.send_offer(call_id, kind, &peer_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(call_id = %call_id, "Accept failed: {}", e);
                self.finish(end_reason_for(&e)).await;
                Err(e)
            }
        }
    }

    /// Receiver side of the handshake: media, transport, offer
    async fn send_offer(&mut self, call_id: CallId, kind: CallKind, peer_id: &UserId) -> Result<(), CallError> {
        let stream = self.acquire_media(constraints_for(kind)).await?;
        match self.live_session() {
            Some(session) => session.attach_local_stream(stream),
            None => {
                stream.stop();
                return Err(CallError::Cancelled);
            }
        }
        self.publish();

        self.open_transport().await?;
        let sdp = guarded(self.abort_signal(), self.transport_ref()?.create_offer()).await??;
        self.signal(peer_id, Body::CallOffer { call_id, sdp })?;
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        if self.current_state() != CallState::Ringing {
            return Err(self.invalid("reject_call"));
        }
        self.finish(EndReason::Declined).await;
        Ok(())
    }

    async fn end(&mut self) -> Result<(), CallError> {
        match self.session.as_ref().map(CallSession::is_ended) {
            None => Err(self.invalid("end_call")),
            Some(true) => Ok(()),
            Some(false) => {
                self.finish(EndReason::Hangup).await;
                Ok(())
            }
        }
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let operation = match kind {
            TrackKind::Audio => "toggle_audio",
            TrackKind::Video => "toggle_video",
        };
        let state = self.current_state();
        let Some(session) = self.live_session() else {
            return Err(CallError::InvalidState { operation, state });
        };

        let enabled = match kind {
            TrackKind::Audio => {
                session.audio_enabled = !session.audio_enabled;
                session.audio_enabled
            }
            TrackKind::Video => {
                session.video_enabled = !session.video_enabled;
                session.video_enabled
            }
        };
        if let Some(track) = session.local_track(kind) {
            track.set_enabled(enabled);
        }
        tracing::debug!(call_id = %session.id, ?kind, enabled, "Local track toggled");

        self.publish();
        Ok(enabled)
    }

    async fn start_screen_share(&mut self) -> Result<(), CallError> {
        let state = self.current_state();
        let has_video_sender = self
            .transport_ref()
            .map(|t| t.has_sender(TrackKind::Video))
            .unwrap_or(false);
        if !state.is_connected() || !has_video_sender {
            return Err(CallError::InvalidState {
                operation: "start_screen_share",
                state,
            });
        }

        // Last call wins: the previous display stream goes first
        if let Some(previous) = self.session.as_mut().and_then(|s| s.screen_stream.take()) {
            self.screen_track = None;
            previous.stop();
        }

        let display = match self.acquire_display().await {
            Ok(display) => display,
            Err(e) => return self.screen_share_failed(state, e).await,
        };
        // Screen audio is not mixed into the call
        if let Some(audio) = display.audio_track() {
            audio.stop();
        }
        let Some(track) = display.video_track().cloned() else {
            display.stop();
            let e = CallError::MediaAccess(MediaError::DeviceUnavailable(
                "display stream has no video track".to_string(),
            ));
            return self.screen_share_failed(state, e).await;
        };

        let replaced = match self.transport_ref() {
            Ok(transport) => guarded(
                self.abort_signal(),
                transport.replace_track(TrackKind::Video, Some(&track)),
            )
            .await
            .and_then(|r| r.map_err(CallError::from)),
            Err(e) => Err(e),
        };
        if let Err(e) = replaced {
            display.stop();
            return self.screen_share_failed(state, e).await;
        }

        let Some(session) = self.live_session() else {
            display.stop();
            return Err(CallError::Cancelled);
        };
        let stream_id = display.id();
        tracing::info!(call_id = %session.id, stream = %stream_id, "Screen sharing started");
        session.preview = LocalPreview::Display(display.id());
        session.screen_stream = Some(display);
        self.screen_track = Some(track);
        self.set_state(CallState::ScreenSharing);
        self.publish();
        Ok(())
    }

    /// Display capture or track replacement failed: the call goes on with
    /// the camera, unless the failure was a cancellation.
    async fn screen_share_failed(&mut self, previous: CallState, error: CallError) -> Result<(), CallError> {
        if error == CallError::Cancelled {
            self.finish(EndReason::Hangup).await;
            return Err(error);
        }
        tracing::warn!("Screen sharing failed: {}", error);
        self.notice(format!("Screen sharing unavailable: {error}"));
        if previous == CallState::ScreenSharing {
            self.restore_camera().await;
        }
        Err(error)
    }

    async fn stop_screen_share(&mut self) -> Result<(), CallError> {
        if self.current_state() != CallState::ScreenSharing {
            return Err(self.invalid("stop_screen_share"));
        }
        self.restore_camera().await;
        Ok(())
    }

    /// Puts the camera back on the video sender and leaves `ScreenSharing`.
    ///
    /// Without a live camera the sender is detached and the preview falls
    /// back to the placeholder.
    async fn restore_camera(&mut self) {
        self.screen_track = None;
        let Some(session) = self.live_session() else {
            return;
        };

        let display = session.screen_stream.take();
        let camera = session.live_camera();

        if let Some(transport) = session.transport.as_deref() {
            if transport.has_sender(TrackKind::Video) {
                if let Err(e) = transport.replace_track(TrackKind::Video, camera.as_ref()).await {
                    tracing::warn!(call_id = %session.id, "Failed to restore camera track: {}", e);
                }
            }
        }

        session.preview = match (&camera, &session.local_stream) {
            (Some(_), Some(stream)) => LocalPreview::Camera(stream.id()),
            _ => LocalPreview::Placeholder,
        };
        if let Some(display) = display {
            display.stop();
        }
        tracing::info!(call_id = %session.id, "Screen sharing stopped");

        if session.state == CallState::ScreenSharing {
            self.set_state(CallState::Active);
        }
        self.publish();
    }

    /// The display track ended outside our control (OS "stop sharing")
    async fn handle_screen_ended(&mut self) {
        let Some(track) = self.screen_track.take() else {
            return;
        };
        let still_shared = self
            .session
            .as_ref()
            .and_then(|s| s.screen_stream.as_ref())
            .and_then(MediaStream::video_track)
            .is_some_and(|current| current.same_track(&track));

        if still_shared && self.current_state() == CallState::ScreenSharing {
            self.notice("Screen sharing stopped");
            self.restore_camera().await;
        }
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn handle_signal(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.body {
            Body::CallIncoming {
                call_id,
                kind,
                mut caller,
            } => {
                if let Some(from) = from {
                    caller.id = from;
                }
                self.on_incoming(call_id, kind, caller).await;
            }
            Body::CallOffer { call_id, sdp } => self.on_offer(call_id, from.as_ref(), sdp).await,
            Body::CallAnswer { call_id, sdp } => self.on_answer(call_id, from.as_ref(), sdp).await,
            Body::CallIceCandidate { call_id, candidate } => {
                self.on_candidate(call_id, from.as_ref(), candidate).await
            }
            Body::CallEnd { call_id, reason } => self.on_remote_end(call_id, from.as_ref(), &reason).await,
            other => {
                tracing::debug!(kind = other.kind().as_str(), "Ignoring non-call envelope");
            }
        }
    }

    fn stale(&self, call_id: CallId, kind: EnvelopeKind) {
        tracing::warn!(
            kind = kind.as_str(),
            state = ?self.current_state(),
            "Dropping envelope: {}",
            CallError::SignalingOrder(call_id)
        );
    }

    async fn on_incoming(&mut self, call_id: CallId, kind: CallKind, caller: UserProfile) {
        if let Some(session) = self.session.as_ref().filter(|s| !s.is_ended()) {
            if session.id == call_id {
                tracing::debug!(call_id = %call_id, "Duplicate call_incoming");
                return;
            }

            // Both sides called each other: the lower call id survives on
            // both ends, the owner of the higher one drops it silently
            let crossed = session.state == CallState::Requesting
                && session.role == CallRole::Initiator
                && session.peer.id == caller.id;
            if crossed && call_id < session.id {
                tracing::info!(
                    call_id = %call_id,
                    ours = %session.id,
                    from = %caller.id,
                    "Calls crossed, yielding to the incoming one"
                );
                self.finish(EndReason::Crossed).await;
            } else {
                tracing::info!(call_id = %call_id, from = %caller.id, "Busy, declining incoming call");
                let busy = Body::CallEnd {
                    call_id,
                    reason: EndReason::Busy.wire().to_string(),
                };
                if let Err(e) = self.signal(&caller.id, busy) {
                    tracing::warn!(call_id = %call_id, "Busy notice not delivered: {}", e);
                }
                if !crossed {
                    self.notice(format!("Missed call from {}", caller.username));
                }
                return;
            }
        }

        tracing::info!(call_id = %call_id, from = %caller.id, ?kind, "Incoming call");
        self.install(CallSession::new(call_id, kind, CallRole::Receiver, caller.clone()));
        let _ = self.events.send(CallEvent::Incoming {
            call_id,
            caller,
            kind,
        });
    }

    /// Initiator side: the callee accepted and sent its offer
    async fn on_offer(&mut self, call_id: CallId, from: Option<&UserId>, sdp: String) {
        let expected = self.is_current(call_id, from)
            && self.current_state() == CallState::Requesting
            && self.session.as_ref().is_some_and(|s| s.role == CallRole::Initiator);
        if !expected {
            self.stale(call_id, EnvelopeKind::CallOffer);
            return;
        }

        self.set_state(CallState::Negotiating);
        if let Err(e) = self.send_answer(call_id, sdp).await {
            tracing::warn!(call_id = %call_id, "Negotiation failed: {}", e);
            self.finish(end_reason_for(&e)).await;
        }
    }

    async fn send_answer(&mut self, call_id: CallId, offer: String) -> Result<(), CallError> {
        self.open_transport().await?;
        let answer = guarded(self.abort_signal(), self.transport_ref()?.accept_offer(offer)).await??;

        let peer_id = match self.live_session() {
            Some(session) => {
                session.remote_description_set = true;
                session.peer.id.clone()
            }
            None => return Err(CallError::Cancelled),
        };
        self.signal(&peer_id, Body::CallAnswer { call_id, sdp: answer })?;
        self.flush_candidates().await;
        Ok(())
    }

    /// Receiver side: the initiator answered our offer
    async fn on_answer(&mut self, call_id: CallId, from: Option<&UserId>, sdp: String) {
        let expected = self.is_current(call_id, from)
            && self.current_state() == CallState::Negotiating
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.role == CallRole::Receiver && !s.remote_description_set);
        if !expected {
            self.stale(call_id, EnvelopeKind::CallAnswer);
            return;
        }

        let applied = match self.transport_ref() {
            Ok(transport) => guarded(self.abort_signal(), transport.accept_answer(sdp))
                .await
                .and_then(|r| r.map_err(CallError::from)),
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            tracing::warn!(call_id = %call_id, "Failed to apply answer: {}", e);
            self.finish(end_reason_for(&e)).await;
            return;
        }

        if let Some(session) = self.live_session() {
            session.remote_description_set = true;
        }
        self.flush_candidates().await;
    }

    async fn on_candidate(&mut self, call_id: CallId, from: Option<&UserId>, candidate: String) {
        if !self.is_current(call_id, from) {
            self.stale(call_id, EnvelopeKind::CallIceCandidate);
            return;
        }
        let Some(session) = self.live_session() else {
            return;
        };

        match session.transport.as_deref() {
            Some(transport) if session.remote_description_set => {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    tracing::warn!(call_id = %call_id, "Rejected ICE candidate: {}", e);
                }
            }
            _ => session.pending_candidates.push(candidate),
        }
    }

    async fn on_remote_end(&mut self, call_id: CallId, from: Option<&UserId>, reason: &str) {
        if !self.is_current(call_id, from) {
            if self.session.as_ref().is_some_and(|s| s.id == call_id) {
                tracing::debug!(call_id = %call_id, "call_end for an already ended call");
            } else {
                self.stale(call_id, EnvelopeKind::CallEnd);
            }
            return;
        }
        tracing::info!(call_id = %call_id, reason, "Remote ended the call");
        self.finish(EndReason::from_remote(reason)).await;
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(session) = self.live_session() else {
            return;
        };
        let (call_id, peer_id) = (session.id, session.peer.id.clone());

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.signal(&peer_id, Body::CallIceCandidate { call_id, candidate }) {
                    tracing::warn!(call_id = %call_id, "ICE candidate not sent: {}", e);
                }
            }
            PeerEvent::RemoteTrack { kind } => {
                tracing::debug!(call_id = %call_id, ?kind, "Remote track received");
                if !session.remote_tracks.contains(&kind) {
                    session.remote_tracks.push(kind);
                }
                self.maybe_activate();
            }
            PeerEvent::ConnectionState(PeerConnectionState::Connected) => {
                session.connected = true;
                self.maybe_activate();
            }
            PeerEvent::ConnectionState(PeerConnectionState::Disconnected) => {
                tracing::warn!(call_id = %call_id, "Peer connection interrupted");
                session.connected = false;
            }
            PeerEvent::ConnectionState(state) if state.is_fatal() => {
                self.finish(EndReason::Negotiation(format!("peer connection {state:?}")))
                    .await;
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(call_id = %call_id, ?state, "Peer connection state");
            }
        }
    }

    fn maybe_activate(&mut self) {
        if self.session.as_ref().is_some_and(CallSession::ready_to_activate) {
            self.set_state(CallState::Active);
        }
    }
}
