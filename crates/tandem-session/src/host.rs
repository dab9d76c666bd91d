use crate::error::MediaError;
use crate::runtime::AudioLevels;
use crate::session::Role;

/// Hooks the surrounding application provides. Every method has a default,
/// so a host only overrides what it knows.
pub trait CallHost: Send + Sync {
    /// Relay-level id of this client. Used to pick the offerer when the relay
    /// does not say; `None` makes this side offer.
    fn local_peer_id(&self) -> Option<String> {
        None
    }

    fn local_user_id(&self) -> Option<String> {
        None
    }

    /// When this turns false mid-call the session is torn down.
    fn is_call_mode_active(&self) -> bool {
        true
    }

    /// Incoming friend calls from users this returns false for are declined.
    fn is_friend(&self, _user_id: &str) -> bool {
        true
    }
}

/// Host that accepts every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHost;

impl CallHost for DefaultHost {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSlot {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    Timeout,
    Busy,
    MediaUnavailable,
    CallInactive,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::LocalHangup => "hangup",
            EndReason::RemoteHangup => "remote-hangup",
            EndReason::Declined => "declined",
            EndReason::Timeout => "timeout",
            EndReason::Busy => "busy",
            EndReason::MediaUnavailable => "media-unavailable",
            EndReason::CallInactive => "call-inactive",
        }
    }
}

/// Lifecycle notifications delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Searching,
    Matched {
        partner_id: String,
        room_id: Option<String>,
        role: Role,
    },
    Connected,
    Disconnected,
    Reconnecting,
    RemoteCameraChanged(bool),
    RemoteMutedChanged(bool),
    RemotePipChanged(bool),
    StreamChanged {
        slot: StreamSlot,
        stream_id: Option<String>,
    },
    IncomingCall {
        call_id: String,
        from: String,
        room_id: Option<String>,
    },
    IncomingCancelled {
        call_id: String,
    },
    AudioLevel(AudioLevels),
    MediaFailed(MediaError),
    Ended {
        reason: EndReason,
    },
}
