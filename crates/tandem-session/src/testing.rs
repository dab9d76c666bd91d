//! In-memory doubles for the media runtime and host, plus a [`Harness`] that
//! drives a [`SessionCoordinator`] deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_signal::{LocalBus, Signal, SignalBus};
use tokio::sync::{broadcast, mpsc};

use crate::config::{EngineConfig, IceServer};
use crate::coordinator::SessionCoordinator;
use crate::error::{MediaError, RuntimeError};
use crate::event::EngineEvent;
use crate::host::{CallHost, SessionEvent};
use crate::media::StreamHandle;
use crate::runtime::{
    AudioLevels, CaptureConstraints, ConnectionEventSink, ConnectionState, IceCandidate,
    MediaKind, MediaRuntime, MediaTrack, PeerConnection, SdpKind, SenderInfo,
    SessionDescription, SignalingState,
};

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    live: AtomicBool,
    enabled: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            live: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        })
    }

    /// Ends the track as if the device went away.
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.end();
    }
}

#[derive(Debug, Default)]
struct FakeRuntimeState {
    failing_rungs: HashSet<String>,
    capture_attempts: Vec<String>,
    connections: Vec<Arc<FakeConnection>>,
    failing_connections: usize,
    killing_attaches: usize,
}

/// Media runtime that never touches a device or the network.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeRuntimeState>,
    next_id: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture attempts with these ladder labels fail.
    pub fn fail_capture_rungs<I, S>(&self, rungs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .failing_rungs
            .extend(rungs.into_iter().map(Into::into));
    }

    /// Ladder labels tried so far, in order.
    pub fn capture_attempts(&self) -> Vec<String> {
        self.state.lock().capture_attempts.clone()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.state.lock().connections.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.state.lock().connections.last().cloned()
    }

    /// The next `count` connection constructors fail.
    pub fn fail_next_connections(&self, count: usize) {
        self.state.lock().failing_connections = count;
    }

    /// The next `count` connections end every local track while attaching
    /// them, as if the camera was yanked mid-setup.
    pub fn end_tracks_on_attach(&self, count: usize) {
        self.state.lock().killing_attaches = count;
    }

    fn next(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl MediaRuntime for FakeRuntime {
    async fn acquire_local_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<StreamHandle, MediaError> {
        {
            let mut state = self.state.lock();
            state.capture_attempts.push(constraints.label.clone());
            if state.failing_rungs.contains(&constraints.label) {
                return Err(MediaError::Unavailable {
                    rung: constraints.label.clone(),
                    reason: "device busy".into(),
                });
            }
        }
        let id = format!("local-{}", self.next());
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(FakeTrack::new(format!("{id}-audio"), MediaKind::Audio));
        }
        if constraints.video.is_some() {
            tracks.push(FakeTrack::new(format!("{id}-video"), MediaKind::Video));
        }
        Ok(StreamHandle::new(id, tracks))
    }

    async fn create_connection(
        &self,
        _ice_servers: &[IceServer],
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn PeerConnection>, RuntimeError> {
        let mut state = self.state.lock();
        if state.failing_connections > 0 {
            state.failing_connections -= 1;
            return Err(RuntimeError::Native("peer connection constructor failed".into()));
        }
        let kill_on_attach = if state.killing_attaches > 0 {
            state.killing_attaches -= 1;
            true
        } else {
            false
        };
        let connection = Arc::new(FakeConnection::build(
            self.next(),
            Some(events),
            kill_on_attach,
        ));
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

#[derive(Debug)]
struct FakeConnectionState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    rejected: HashSet<String>,
    offers: Vec<SessionDescription>,
    ice_restarts: u32,
    answers: u32,
    rollbacks: u32,
    candidates_emitted: bool,
    attached: Vec<String>,
    senders: Vec<SenderInfo>,
    senders_stopped: bool,
    closed: bool,
    levels: AudioLevels,
}

/// Peer connection double with a real signaling-state machine.
#[derive(Debug)]
pub struct FakeConnection {
    id: u32,
    /// Keeps offers from separate runtimes distinct.
    nonce: String,
    sink: Option<ConnectionEventSink>,
    kill_on_attach: bool,
    state: Mutex<FakeConnectionState>,
}

impl FakeConnection {
    /// A detached connection whose callbacks go nowhere.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(0, None, false))
    }

    fn build(id: u32, sink: Option<ConnectionEventSink>, kill_on_attach: bool) -> Self {
        let mut nonce = uuid::Uuid::new_v4().simple().to_string();
        nonce.truncate(8);
        Self {
            id,
            nonce,
            sink,
            kill_on_attach,
            state: Mutex::new(FakeConnectionState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                stable_local: None,
                applied: Vec::new(),
                rejected: HashSet::new(),
                offers: Vec::new(),
                ice_restarts: 0,
                answers: 0,
                rollbacks: 0,
                candidates_emitted: false,
                attached: Vec::new(),
                senders: Vec::new(),
                senders_stopped: false,
                closed: false,
                levels: AudioLevels::default(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.state.lock().rejected.insert(candidate.to_string());
    }

    pub fn accept_all_candidates(&self) {
        self.state.lock().rejected.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn senders_stopped(&self) -> bool {
        self.state.lock().senders_stopped
    }

    pub fn attached_streams(&self) -> Vec<String> {
        self.state.lock().attached.clone()
    }

    pub fn offers(&self) -> Vec<SessionDescription> {
        self.state.lock().offers.clone()
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    pub fn answers(&self) -> u32 {
        self.state.lock().answers
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn set_audio_levels(&self, levels: AudioLevels) {
        self.state.lock().levels = levels;
    }

    /// Moves the transport state and reports it like the runtime would.
    pub fn transition(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        if let Some(sink) = &self.sink {
            sink.state_changed(state);
        }
    }

    /// Reports a remote track on `stream_id` and returns it for later control.
    pub fn add_remote_track(&self, stream_id: &str, kind: MediaKind) -> Arc<FakeTrack> {
        let suffix = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        let track = FakeTrack::new(format!("{stream_id}-{suffix}"), kind);
        if let Some(sink) = &self.sink {
            sink.remote_track(stream_id.to_string(), track.clone());
        }
        track
    }

    fn ensure_open(state: &FakeConnectionState) -> Result<(), RuntimeError> {
        if state.closed {
            Err(RuntimeError::Closed)
        } else {
            Ok(())
        }
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 192.168.1.{} 5{:04} typ host",
                self.id,
                self.id % 250,
                self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RuntimeError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let n = state.offers.len() + 1;
        let restart = if ice_restart { "-restart" } else { "" };
        let offer = SessionDescription::offer(format!("offer-{}-{n}-{}{restart}", self.id, self.nonce));
        state.offers.push(offer.clone());
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RuntimeError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(RuntimeError::InvalidState(format!(
                "create_answer in {:?}",
                state.signaling
            )));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "answer-{}-{}",
            self.id, state.answers
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RuntimeError> {
        let emit = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.signaling = match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (kind, found) => {
                    return Err(RuntimeError::InvalidState(format!(
                        "local {kind:?} in {found:?}"
                    )))
                }
            };
            if state.signaling == SignalingState::Stable {
                state.stable_local = Some(description.clone());
            }
            state.local = Some(description);
            !std::mem::replace(&mut state.candidates_emitted, true)
        };
        if emit {
            if let Some(sink) = &self.sink {
                sink.local_candidate(self.local_candidate());
            }
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.signaling = match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, found) => {
                return Err(RuntimeError::InvalidState(format!(
                    "remote {kind:?} in {found:?}"
                )))
            }
        };
        if state.signaling == SignalingState::Stable {
            state.stable_local = state.local.clone();
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(RuntimeError::InvalidState(format!(
                "rollback in {:?}",
                state.signaling
            )));
        }
        state.signaling = SignalingState::Stable;
        state.local = state.stable_local.clone();
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            return Err(RuntimeError::InvalidState("no remote description".into()));
        }
        if state.rejected.contains(&candidate.candidate) {
            return Err(RuntimeError::Native("candidate rejected".into()));
        }
        if state.applied.iter().any(|c| c.key() == candidate.key()) {
            return Err(RuntimeError::AlreadyApplied);
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn has_local_description(&self) -> bool {
        self.state.lock().local.is_some()
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn attach_stream(&self, stream: &StreamHandle) -> Result<(), RuntimeError> {
        if self.kill_on_attach {
            for track in stream.tracks() {
                track.stop();
            }
            return Err(RuntimeError::Native("track ended while attaching".into()));
        }
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.attached.push(stream.id().to_string());
        state.senders = stream
            .tracks()
            .iter()
            .map(|track| SenderInfo {
                kind: track.kind(),
                track_id: Some(track.id().to_string()),
            })
            .collect();
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.state.lock().senders.clone()
    }

    async fn stop_senders(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.senders.clear();
        state.senders_stopped = true;
        Ok(())
    }

    async fn audio_levels(&self) -> Result<AudioLevels, RuntimeError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(state.levels)
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
        }
        if let Some(sink) = &self.sink {
            sink.state_changed(ConnectionState::Closed);
        }
        Ok(())
    }
}

/// Host with settable answers that records the friend lookups it served.
#[derive(Debug, Default)]
pub struct RecordingHost {
    peer_id: Option<String>,
    user_id: Option<String>,
    inactive: AtomicBool,
    strangers: Mutex<HashSet<String>>,
    friend_checks: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn set_call_mode_active(&self, active: bool) {
        self.inactive.store(!active, Ordering::SeqCst);
    }

    pub fn not_a_friend(&self, user_id: impl Into<String>) {
        self.strangers.lock().insert(user_id.into());
    }

    pub fn friend_checks(&self) -> Vec<String> {
        self.friend_checks.lock().clone()
    }
}

impl CallHost for RecordingHost {
    fn local_peer_id(&self) -> Option<String> {
        self.peer_id.clone()
    }

    fn local_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn is_call_mode_active(&self) -> bool {
        !self.inactive.load(Ordering::SeqCst)
    }

    fn is_friend(&self, user_id: &str) -> bool {
        self.friend_checks.lock().push(user_id.to_string());
        !self.strangers.lock().contains(user_id)
    }
}

const HARNESS_STEP: Duration = Duration::from_millis(25);
const YIELDS_PER_PUMP: usize = 8;

/// A coordinator wired to fakes, pumped by hand.
///
/// Nothing runs unless the test calls [`pump`](Self::pump) or
/// [`advance`](Self::advance), so every interleaving is explicit. Meant for
/// runtimes built with a paused clock.
pub struct Harness {
    pub coordinator: SessionCoordinator,
    pub bus: Arc<LocalBus>,
    pub runtime: Arc<FakeRuntime>,
    pub host: Arc<RecordingHost>,
    internal: mpsc::UnboundedReceiver<EngineEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    inbound: broadcast::Receiver<Signal>,
}

impl Harness {
    pub fn new(id: &str) -> Self {
        Self::with_config(id, EngineConfig::default())
    }

    pub fn with_config(id: &str, config: EngineConfig) -> Self {
        Self::build(LocalBus::new(id), RecordingHost::new().with_peer_id(id), config)
    }

    /// Two harnesses sharing a loopback relay.
    pub fn pair(left: &str, right: &str, config: EngineConfig) -> (Self, Self) {
        let (a, b) = LocalBus::pair(left, right);
        (
            Self::build(a, RecordingHost::new().with_peer_id(left), config.clone()),
            Self::build(b, RecordingHost::new().with_peer_id(right), config),
        )
    }

    /// Like [`Harness::pair`], but neither host knows its own relay id.
    pub fn anonymous_pair(left: &str, right: &str, config: EngineConfig) -> (Self, Self) {
        let (a, b) = LocalBus::pair(left, right);
        (
            Self::build(a, RecordingHost::new(), config.clone()),
            Self::build(b, RecordingHost::new(), config),
        )
    }

    pub fn build(bus: LocalBus, host: RecordingHost, config: EngineConfig) -> Self {
        let bus = Arc::new(bus);
        let runtime = Arc::new(FakeRuntime::new());
        let host = Arc::new(host);
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let inbound = bus.subscribe();
        let coordinator = SessionCoordinator::new(
            config,
            runtime.clone(),
            bus.clone(),
            host.clone(),
            internal_tx,
            events_tx,
        );
        Self {
            coordinator,
            bus,
            runtime,
            host,
            internal,
            events,
            inbound,
        }
    }

    /// Runs queued work until both the engine queue and the relay are idle.
    pub async fn pump(&mut self) {
        loop {
            for _ in 0..YIELDS_PER_PUMP {
                tokio::task::yield_now().await;
            }
            let mut progressed = false;
            while let Ok(event) = self.internal.try_recv() {
                self.coordinator.handle_engine_event(event).await;
                progressed = true;
            }
            loop {
                match self.inbound.try_recv() {
                    Ok(signal) => {
                        self.coordinator.handle_signal(signal).await;
                        progressed = true;
                    }
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Injects a relay message and pumps.
    pub async fn deliver(&mut self, signal: Signal) {
        if let Err(err) = self.bus.deliver(signal) {
            panic!("harness bus closed: {err}");
        }
        self.pump().await;
    }

    /// Moves the paused clock forward in small steps, pumping after each.
    pub async fn advance(&mut self, by: Duration) {
        let mut left = by;
        while !left.is_zero() {
            let step = left.min(HARNESS_STEP);
            tokio::time::advance(step).await;
            self.pump().await;
            left -= step;
        }
    }

    /// Session events emitted since the last call.
    pub fn events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Relay messages emitted since the last call.
    pub fn sent(&self) -> Vec<Signal> {
        self.bus.take_sent()
    }

    pub fn connection(&self) -> Arc<FakeConnection> {
        match self.runtime.last_connection() {
            Some(connection) => connection,
            None => panic!("harness has no connection yet"),
        }
    }
}

/// Pumps two paired harnesses until neither makes progress.
pub async fn pump_pair(a: &mut Harness, b: &mut Harness) {
    for _ in 0..16 {
        a.pump().await;
        b.pump().await;
    }
}

/// Advances the paused clock for a pair, pumping both after each step.
pub async fn advance_pair(a: &mut Harness, b: &mut Harness, by: Duration) {
    let mut left = by;
    while !left.is_zero() {
        let step = left.min(HARNESS_STEP);
        tokio::time::advance(step).await;
        pump_pair(a, b).await;
        left -= step;
    }
}
