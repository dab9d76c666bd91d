//! Seam between the engine and the native WebRTC implementation.
//!
//! The engine never touches codec, capture or transport details. It drives a
//! [`PeerConnection`] through the standard offer/answer operations and
//! receives callbacks as token-tagged [`ConnectionEvent`]s on its own queue.
//!
//! [`ConnectionEvent`]: crate::event::ConnectionEvent

pub mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_signal::CandidatePayload;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::{MediaError, RuntimeError};
use crate::event::{ConnectionEvent, ConnectionEventKind, EngineEvent};
use crate::media::StreamHandle;
use crate::token::GenerationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }

    pub fn is_degraded(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Identity used for candidate deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    candidate: String,
    sdp_mline_index: Option<u16>,
    sdp_mid: Option<String>,
}

impl IceCandidate {
    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            candidate: self.candidate.trim().to_string(),
            sdp_mline_index: self.sdp_mline_index,
            sdp_mid: self.sdp_mid.clone(),
        }
    }
}

impl From<CandidatePayload> for IceCandidate {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
        }
    }
}

impl From<IceCandidate> for CandidatePayload {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    Front,
    Back,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing: Facing,
}

/// One rung of the capture fallback ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub label: String,
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default)]
    pub video: Option<VideoConstraints>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioLevels {
    pub local: Option<f32>,
    pub remote: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub kind: MediaKind,
    pub track_id: Option<String>,
}

/// A capture or receive track as seen by the engine.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// False once the track has ended; ended tracks never come back.
    fn is_live(&self) -> bool;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

#[async_trait]
pub trait MediaRuntime: Send + Sync {
    async fn acquire_local_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<StreamHandle, MediaError>;

    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn PeerConnection>, RuntimeError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RuntimeError>;
    async fn create_answer(&self) -> Result<SessionDescription, RuntimeError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RuntimeError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RuntimeError>;
    /// Discards a pending local offer, returning to `Stable`.
    async fn rollback_local_description(&self) -> Result<(), RuntimeError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RuntimeError>;
    async fn has_local_description(&self) -> bool;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn attach_stream(&self, stream: &StreamHandle) -> Result<(), RuntimeError>;
    async fn senders(&self) -> Vec<SenderInfo>;
    /// Detaches every outbound track without closing the connection.
    async fn stop_senders(&self) -> Result<(), RuntimeError>;
    async fn audio_levels(&self) -> Result<AudioLevels, RuntimeError>;
    async fn close(&self) -> Result<(), RuntimeError>;
}

/// Callback endpoint handed to the runtime for one connection generation.
///
/// Every event is tagged with the token the connection was built under, so a
/// callback from a torn-down connection is recognisable after the fact.
#[derive(Debug, Clone)]
pub struct ConnectionEventSink {
    token: GenerationToken,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ConnectionEventSink {
    pub fn new(token: GenerationToken, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { token, tx }
    }

    pub fn token(&self) -> GenerationToken {
        self.token
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.send(ConnectionEventKind::LocalCandidate(candidate));
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.send(ConnectionEventKind::StateChanged(state));
    }

    pub fn remote_track(&self, stream_id: String, track: Arc<dyn MediaTrack>) {
        self.send(ConnectionEventKind::RemoteTrack { stream_id, track });
    }

    fn send(&self, kind: ConnectionEventKind) {
        let event = EngineEvent::Connection(ConnectionEvent {
            token: self.token,
            kind,
        });
        if self.tx.send(event).is_err() {
            tracing::trace!(
                target = "tandem::connection",
                token = %self.token,
                "engine queue closed; dropping runtime callback"
            );
        }
    }
}
