//! [`MediaRuntime`] backed by `webrtc-rs`.
//!
//! There is no capture device access here: a captured stream is a pair of
//! sample tracks (Opus audio, VP8 video) that the host feeds through
//! [`LocalSampleTrack::sample_track`]. Remote tracks are drained in a
//! background task whose packet flow drives liveness and the enabled flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use ::webrtc::api::{APIBuilder, API};
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use ::webrtc::rtp_transceiver::RTCRtpTransceiver;
use ::webrtc::stats::StatsReportType;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_remote::TrackRemote;

use crate::config::IceServer;
use crate::error::{MediaError, RuntimeError};
use crate::media::StreamHandle;

use super::{
    AudioLevels, CaptureConstraints, ConnectionEventSink, ConnectionState, IceCandidate,
    MediaKind, MediaRuntime, MediaTrack, PeerConnection, SdpKind, SenderInfo,
    SessionDescription, SignalingState,
};

/// Remote tracks without a packet for this long read as disabled.
const REMOTE_IDLE_AFTER: Duration = Duration::from_millis(1_000);
/// Byte rate that maps to a full-scale level (roughly Opus at 64 kbit/s).
const FULL_SCALE_BYTES_PER_SEC: f32 = 8_000.0;

fn native(err: ::webrtc::Error) -> RuntimeError {
    match err {
        ::webrtc::Error::ErrConnectionClosed => RuntimeError::Closed,
        other => RuntimeError::Native(other.to_string()),
    }
}

fn build_api() -> Result<API, RuntimeError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(native)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(native)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// A captured track the host writes encoded samples into.
#[derive(Debug)]
pub struct LocalSampleTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
    enabled: AtomicBool,
}

impl LocalSampleTrack {
    fn new(kind: MediaKind, id: String, stream_id: String) -> Self {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id,
            stream_id,
        );
        Self {
            kind,
            track: Arc::new(track),
            live: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl MediaTrack for LocalSampleTrack {
    fn id(&self) -> &str {
        self.track.id()
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
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Receive side of a remote track, observed through its packet flow.
#[derive(Debug)]
struct RemoteRtpTrack {
    id: String,
    kind: MediaKind,
    live: AtomicBool,
    stopped: AtomicBool,
    last_packet: Mutex<Option<Instant>>,
}

impl RemoteRtpTrack {
    fn touch(&self) {
        *self.last_packet.lock() = Some(Instant::now());
    }
}

impl MediaTrack for RemoteRtpTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    fn is_enabled(&self) -> bool {
        self.last_packet
            .lock()
            .map(|at| at.elapsed() < REMOTE_IDLE_AFTER)
            .unwrap_or(false)
    }

    fn set_enabled(&self, _enabled: bool) {}

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

type TrackRegistry = Arc<Mutex<HashMap<String, Arc<LocalSampleTrack>>>>;

pub struct WebRtcRuntime {
    api: Arc<API>,
    captured: TrackRegistry,
    next_stream: AtomicU64,
}

impl WebRtcRuntime {
    pub fn new() -> Result<Self, RuntimeError> {
        Ok(Self {
            api: Arc::new(build_api()?),
            captured: Arc::new(Mutex::new(HashMap::new())),
            next_stream: AtomicU64::new(1),
        })
    }

    /// The sample track behind a captured track id, for the host to feed.
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<LocalSampleTrack>> {
        self.captured.lock().get(track_id).cloned()
    }
}

#[async_trait]
impl MediaRuntime for WebRtcRuntime {
    async fn acquire_local_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<StreamHandle, MediaError> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(MediaError::Unavailable {
                rung: constraints.label.clone(),
                reason: "nothing to capture".into(),
            });
        }
        let stream_id = format!(
            "tandem-local-{}",
            self.next_stream.fetch_add(1, Ordering::SeqCst)
        );
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(MediaKind::Audio);
        }
        if constraints.video.is_some() {
            kinds.push(MediaKind::Video);
        }

        let mut captured = self.captured.lock();
        captured.retain(|_, track| track.is_live());
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let suffix = match kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            let track = Arc::new(LocalSampleTrack::new(
                kind,
                format!("{stream_id}-{suffix}"),
                stream_id.clone(),
            ));
            captured.insert(track.id().to_string(), track.clone());
            tracks.push(track);
        }
        tracing::debug!(
            target = "tandem::media",
            rung = %constraints.label,
            stream = %stream_id,
            "sample tracks created"
        );
        Ok(StreamHandle::new(stream_id, tracks))
    }

    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn PeerConnection>, RuntimeError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config.clone())
                .await
                .map_err(native)?,
        );
        wire_callbacks(&pc, events.clone());
        Ok(Arc::new(RtcConnection {
            pc: Mutex::new(pc),
            api: self.api.clone(),
            config,
            events,
            captured: self.captured.clone(),
            counters: Mutex::new(None),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: ConnectionEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.local_candidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                }),
                Err(err) => {
                    tracing::warn!(target = "tandem::ice", error = %err, "candidate serialisation failed")
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.state_changed(connection_state(state));
        })
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                let remote = Arc::new(RemoteRtpTrack {
                    id: track.id(),
                    kind,
                    live: AtomicBool::new(true),
                    stopped: AtomicBool::new(false),
                    last_packet: Mutex::new(Some(Instant::now())),
                });
                sink.remote_track(track.stream_id(), remote.clone());
                tokio::spawn(async move {
                    while !remote.stopped.load(Ordering::SeqCst) {
                        if track.read_rtp().await.is_err() {
                            break;
                        }
                        remote.touch();
                    }
                    remote.live.store(false, Ordering::SeqCst);
                    tracing::debug!(target = "tandem::media", track = %remote.id, "remote track ended");
                });
            })
        },
    ));
}

/// Silences a connection that is about to be replaced so its close does not
/// reach the engine.
fn unwire_callbacks(pc: &RTCPeerConnection) {
    pc.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
    pc.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
    pc.on_track(Box::new(
        |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| Box::pin(async {}),
    ));
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn to_native(description: SessionDescription) -> Result<RTCSessionDescription, RuntimeError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(native),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(native),
    }
}

#[derive(Debug, Clone, Copy)]
struct ByteCounters {
    at: Instant,
    sent: u64,
    received: u64,
}

struct RtcConnection {
    pc: Mutex<Arc<RTCPeerConnection>>,
    api: Arc<API>,
    config: RTCConfiguration,
    events: ConnectionEventSink,
    captured: TrackRegistry,
    counters: Mutex<Option<ByteCounters>>,
}

impl RtcConnection {
    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.pc.lock().clone()
    }
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RuntimeError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc().create_offer(Some(options)).await.map_err(native)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RuntimeError> {
        let answer = self.pc().create_answer(None).await.map_err(native)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RuntimeError> {
        self.pc()
            .set_local_description(to_native(description)?)
            .await
            .map_err(native)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RuntimeError> {
        self.pc()
            .set_remote_description(to_native(description)?)
            .await
            .map_err(native)
    }

    /// webrtc-rs has no HaveLocalOffer to Stable transition, so the pending
    /// offer is dropped by swapping in a fresh peer connection that carries
    /// the same local tracks.
    async fn rollback_local_description(&self) -> Result<(), RuntimeError> {
        let current = self.pc();
        let state = current.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(RuntimeError::InvalidState(format!(
                "cannot roll back from {state}"
            )));
        }

        let mut tracks = Vec::new();
        for sender in current.get_senders().await {
            if let Some(track) = sender.track().await {
                tracks.push(track);
            }
        }
        let fresh = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(native)?,
        );
        for track in tracks {
            fresh.add_track(track).await.map_err(native)?;
        }
        wire_callbacks(&fresh, self.events.clone());

        unwire_callbacks(&current);
        *self.pc.lock() = fresh;
        *self.counters.lock() = None;
        if let Err(err) = current.close().await {
            tracing::trace!(target = "tandem::connection", error = %err, "close after rollback failed");
        }
        tracing::debug!(target = "tandem::connection", "local offer rolled back");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RuntimeError> {
        self.pc()
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(native)
    }

    async fn has_local_description(&self) -> bool {
        self.pc().local_description().await.is_some()
    }

    async fn has_remote_description(&self) -> bool {
        self.pc().remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc().signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc().connection_state())
    }

    async fn attach_stream(&self, stream: &StreamHandle) -> Result<(), RuntimeError> {
        for track in stream.tracks() {
            let sample = self
                .captured
                .lock()
                .get(track.id())
                .filter(|sample| sample.is_live())
                .cloned();
            let Some(sample) = sample else {
                return Err(RuntimeError::InvalidState(format!(
                    "track {} is not a live capture",
                    track.id()
                )));
            };
            let local: Arc<dyn TrackLocal + Send + Sync> = sample.sample_track();
            self.pc().add_track(local).await.map_err(native)?;
        }
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        let mut senders = Vec::new();
        for sender in self.pc().get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            senders.push(SenderInfo {
                kind,
                track_id: Some(track.id().to_string()),
            });
        }
        senders
    }

    async fn stop_senders(&self) -> Result<(), RuntimeError> {
        let pc = self.pc();
        for sender in pc.get_senders().await {
            if let Err(err) = pc.remove_track(&sender).await {
                tracing::trace!(target = "tandem::connection", error = %err, "remove track failed");
            }
        }
        Ok(())
    }

    async fn audio_levels(&self) -> Result<AudioLevels, RuntimeError> {
        let report = self.pc().get_stats().await;
        let mut sent = 0u64;
        let mut received = 0u64;
        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(outbound) if outbound.kind == "audio" => {
                    sent += outbound.bytes_sent;
                }
                StatsReportType::InboundRTP(inbound) if inbound.kind == "audio" => {
                    received += inbound.bytes_received;
                }
                _ => {}
            }
        }

        let now = Instant::now();
        let previous = self.counters.lock().replace(ByteCounters {
            at: now,
            sent,
            received,
        });
        let Some(previous) = previous else {
            return Ok(AudioLevels::default());
        };
        let elapsed = now.saturating_duration_since(previous.at).as_secs_f32();
        if elapsed <= f32::EPSILON {
            return Ok(AudioLevels::default());
        }
        let level = |now: u64, before: u64| {
            let rate = now.saturating_sub(before) as f32 / elapsed;
            (rate / FULL_SCALE_BYTES_PER_SEC).clamp(0.0, 1.0)
        };
        Ok(AudioLevels {
            local: Some(level(sent, previous.sent)),
            remote: Some(level(received, previous.received)),
        })
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        self.pc().close().await.map_err(native)
    }
}
