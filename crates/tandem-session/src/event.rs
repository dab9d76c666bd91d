use std::fmt;
use std::sync::Arc;

use crate::runtime::{ConnectionState, IceCandidate, MediaTrack};
use crate::token::GenerationToken;

/// Internal traffic delivered to the engine task alongside commands and
/// inbound signals.
#[derive(Debug)]
pub enum EngineEvent {
    Connection(ConnectionEvent),
    Timer(TimerFired),
}

/// A runtime callback, tagged with the generation it was registered under.
#[derive(Debug)]
pub struct ConnectionEvent {
    pub token: GenerationToken,
    pub kind: ConnectionEventKind,
}

pub enum ConnectionEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteTrack {
        stream_id: String,
        track: Arc<dyn MediaTrack>,
    },
}

impl fmt::Debug for ConnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEventKind::LocalCandidate(candidate) => f
                .debug_tuple("LocalCandidate")
                .field(&candidate.candidate)
                .finish(),
            ConnectionEventKind::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
            ConnectionEventKind::RemoteTrack { stream_id, track } => f
                .debug_struct("RemoteTrack")
                .field("stream_id", stream_id)
                .field("track", &track.id())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub token: GenerationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    RingTimeout,
    /// Periodic connection-state poll.
    HealthPoll,
    /// One-shot re-check after the disconnect grace elapses.
    HealthCheck,
    RemoteTrackPoll,
    MicLevel,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::RingTimeout => "ring-timeout",
            TimerKind::HealthPoll => "health-poll",
            TimerKind::HealthCheck => "health-check",
            TimerKind::RemoteTrackPoll => "remote-track-poll",
            TimerKind::MicLevel => "mic-level",
        }
    }
}
