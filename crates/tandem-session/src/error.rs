use thiserror::Error;

use crate::runtime::SignalingState;
use crate::token::GenerationToken;

/// Failures reported by a [`PeerConnection`](crate::runtime::PeerConnection).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("operation not valid in the current signaling state: {0}")]
    InvalidState(String),
    #[error("candidate already applied")]
    AlreadyApplied,
    #[error("connection closed")]
    Closed,
    #[error("native runtime error: {0}")]
    Native(String),
}

impl RuntimeError {
    /// Candidate rejections that are a normal consequence of redelivery or
    /// teardown.
    pub fn is_expected_candidate_rejection(&self) -> bool {
        matches!(self, RuntimeError::AlreadyApplied | RuntimeError::Closed)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("capture unavailable for {rung}: {reason}")]
    Unavailable { rung: String, reason: String },
    #[error("every track in stream {0} has ended")]
    StreamEnded(String),
    #[error("all capture strategies failed")]
    Exhausted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{operation} requires {expected} but connection is {found:?}")]
    InvalidStateTransition {
        operation: &'static str,
        expected: &'static str,
        found: SignalingState,
    },
    #[error("stale continuation (captured {captured}, current {current})")]
    Stale {
        captured: GenerationToken,
        current: GenerationToken,
    },
    #[error("no live connection")]
    NoConnection,
    #[error("incoming offer ignored during glare")]
    GlareIgnored,
    #[error("duplicate signaling message")]
    Duplicate,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Dropped silently.
    Stale,
    /// Resolved locally, never surfaced.
    TransientRace,
    Duplicate,
    /// Retried through the capture ladder or stream recreation.
    Media,
    /// Handed to the reconnection supervisor.
    Connection,
    Fatal,
}

impl NegotiationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NegotiationError::Stale { .. } | NegotiationError::NoConnection => ErrorClass::Stale,
            NegotiationError::InvalidStateTransition { .. } | NegotiationError::GlareIgnored => {
                ErrorClass::TransientRace
            }
            NegotiationError::Duplicate => ErrorClass::Duplicate,
            NegotiationError::Runtime(RuntimeError::Closed) => ErrorClass::Stale,
            NegotiationError::Runtime(RuntimeError::InvalidState(_)) => ErrorClass::TransientRace,
            NegotiationError::Runtime(RuntimeError::AlreadyApplied) => ErrorClass::Duplicate,
            NegotiationError::Runtime(RuntimeError::Native(_)) => ErrorClass::Connection,
            NegotiationError::Media(MediaError::Exhausted) => ErrorClass::Fatal,
            NegotiationError::Media(_) => ErrorClass::Media,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Bus(#[from] tandem_signal::BusError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        let stale = NegotiationError::Stale {
            captured: GenerationToken::default(),
            current: GenerationToken::default(),
        };
        assert_eq!(stale.class(), ErrorClass::Stale);
        assert_eq!(
            NegotiationError::GlareIgnored.class(),
            ErrorClass::TransientRace
        );
        assert_eq!(
            NegotiationError::from(RuntimeError::Closed).class(),
            ErrorClass::Stale
        );
        assert_eq!(
            NegotiationError::from(MediaError::StreamEnded("s".into())).class(),
            ErrorClass::Media
        );
        assert_eq!(
            NegotiationError::from(MediaError::Exhausted).class(),
            ErrorClass::Fatal
        );
        assert!(RuntimeError::AlreadyApplied.is_expected_candidate_rejection());
        assert!(!RuntimeError::Native("x".into()).is_expected_candidate_rejection());
    }

    #[test]
    fn invalid_transition_message_names_operation() {
        let err = NegotiationError::InvalidStateTransition {
            operation: "create_answer",
            expected: "have-remote-offer",
            found: SignalingState::Stable,
        };
        assert_eq!(
            err.to_string(),
            "create_answer requires have-remote-offer but connection is Stable"
        );
    }
}
