use std::time::Duration;

use tokio::time::Instant;

use crate::connection::Politeness;
use crate::presence::RemotePresenceState;
use crate::runtime::{ConnectionState, SignalingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

impl Role {
    /// The receiver yields during glare.
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Receiver)
    }

    pub fn politeness(self) -> Politeness {
        if self.is_polite() {
            Politeness::Polite
        } else {
            Politeness::Impolite
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Random match; moves on to the next partner instead of ending.
    Ephemeral,
    /// Friend call; rings, then ends for good.
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Negotiating,
    Active,
    Ending,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub role: Role,
    pub kind: SessionKind,
    /// Absent while an ephemeral session is searching.
    pub partner_id: Option<String>,
    pub partner_user_id: Option<String>,
    pub room_id: Option<String>,
    pub call_id: Option<String>,
    pub lifecycle: Lifecycle,
    pub started_at: Instant,
}

impl Session {
    pub fn new(kind: SessionKind, role: Role) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            kind,
            partner_id: None,
            partner_user_id: None,
            room_id: None,
            call_id: None,
            lifecycle: Lifecycle::Negotiating,
            started_at: Instant::now(),
        }
    }

    pub fn is_partner(&self, sender: Option<&str>) -> bool {
        match (self.partner_id.as_deref(), sender) {
            (Some(partner), Some(sender)) => partner == sender,
            // relays that omit `from` only forward the room's peer
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }
}

/// Read-only view of the engine for hosts and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub lifecycle: Lifecycle,
    pub role: Option<Role>,
    pub kind: Option<SessionKind>,
    pub partner_id: Option<String>,
    pub partner_user_id: Option<String>,
    pub room_id: Option<String>,
    pub call_id: Option<String>,
    pub generation: u64,
    pub signaling_state: Option<SignalingState>,
    pub connection_state: Option<ConnectionState>,
    pub local_stream_id: Option<String>,
    pub remote_stream_id: Option<String>,
    pub presence: RemotePresenceState,
    pub pending_candidates: usize,
    pub ice_restarts: u32,
}
