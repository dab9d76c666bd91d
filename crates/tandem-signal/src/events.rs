use serde::{Deserialize, Serialize};

use crate::BusResult;

/// Every named event exchanged with the signaling relay.
///
/// Frames are adjacently tagged: `{"event": "<name>", "data": {...}}`. Unit
/// events omit `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Signal {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "next")]
    Next,
    #[serde(rename = "match_found")]
    MatchFound(MatchFound),
    #[serde(rename = "offer")]
    Offer(SdpSignal),
    #[serde(rename = "answer")]
    Answer(SdpSignal),
    #[serde(rename = "ice-candidate")]
    IceCandidate(CandidateSignal),
    #[serde(rename = "cam-toggle")]
    CamToggle(CamToggle),
    #[serde(rename = "call:incoming")]
    CallIncoming(CallSignal),
    #[serde(rename = "call:accept")]
    CallAccept(CallSignal),
    #[serde(rename = "call:accepted")]
    CallAccepted(CallSignal),
    #[serde(rename = "call:decline")]
    CallDecline(CallSignal),
    #[serde(rename = "call:declined")]
    CallDeclined(CallSignal),
    #[serde(rename = "call:end")]
    CallEnd(CallSignal),
    #[serde(rename = "call:ended")]
    CallEnded(CallSignal),
    #[serde(rename = "pip:state")]
    PipState(PipState),
    #[serde(rename = "peer:left")]
    PeerLeft,
    #[serde(rename = "peer:stopped")]
    PeerStopped,
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "hangup")]
    Hangup,
    #[serde(rename = "room:join:ack")]
    RoomJoinAck(RoomRef),
    #[serde(rename = "room:leave")]
    RoomLeave(RoomRef),
    #[serde(rename = "friend:call")]
    FriendCall(FriendCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFound {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Relay-assigned offerer flag. Older relays omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub candidate: CandidatePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CamToggle {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipState {
    #[serde(rename = "inPiP")]
    pub in_pip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendCall {
    pub to: String,
    pub call_id: String,
}

impl Signal {
    /// Relay event name, as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Start => "start",
            Signal::Stop => "stop",
            Signal::Next => "next",
            Signal::MatchFound(_) => "match_found",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
            Signal::CamToggle(_) => "cam-toggle",
            Signal::CallIncoming(_) => "call:incoming",
            Signal::CallAccept(_) => "call:accept",
            Signal::CallAccepted(_) => "call:accepted",
            Signal::CallDecline(_) => "call:decline",
            Signal::CallDeclined(_) => "call:declined",
            Signal::CallEnd(_) => "call:end",
            Signal::CallEnded(_) => "call:ended",
            Signal::PipState(_) => "pip:state",
            Signal::PeerLeft => "peer:left",
            Signal::PeerStopped => "peer:stopped",
            Signal::Disconnected => "disconnected",
            Signal::Hangup => "hangup",
            Signal::RoomJoinAck(_) => "room:join:ack",
            Signal::RoomLeave(_) => "room:leave",
            Signal::FriendCall(_) => "friend:call",
        }
    }

    /// Sender attribution, when the event carries one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Signal::Offer(sdp) | Signal::Answer(sdp) => sdp.from.as_deref(),
            Signal::IceCandidate(candidate) => candidate.from.as_deref(),
            Signal::CamToggle(toggle) => toggle.from.as_deref(),
            Signal::PipState(pip) => pip.from.as_deref(),
            Signal::CallIncoming(call)
            | Signal::CallAccept(call)
            | Signal::CallAccepted(call)
            | Signal::CallDecline(call)
            | Signal::CallDeclined(call)
            | Signal::CallEnd(call)
            | Signal::CallEnded(call) => call.from.as_deref(),
            Signal::MatchFound(found) => Some(found.peer_id.as_str()),
            _ => None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Signal::MatchFound(found) => found.room_id.as_deref(),
            Signal::Offer(sdp) | Signal::Answer(sdp) => sdp.room_id.as_deref(),
            Signal::IceCandidate(candidate) => candidate.room_id.as_deref(),
            Signal::CamToggle(toggle) => toggle.room_id.as_deref(),
            Signal::PipState(pip) => pip.room_id.as_deref(),
            Signal::CallIncoming(call)
            | Signal::CallAccept(call)
            | Signal::CallAccepted(call)
            | Signal::CallDecline(call)
            | Signal::CallDeclined(call)
            | Signal::CallEnd(call)
            | Signal::CallEnded(call) => call.room_id.as_deref(),
            Signal::RoomJoinAck(room) | Signal::RoomLeave(room) => Some(room.room_id.as_str()),
            _ => None,
        }
    }

    /// Fills in `from` the way the relay does when forwarding a peer's event.
    /// Existing attribution is left untouched.
    pub fn stamp_sender(&mut self, sender: &str) {
        let slot = match self {
            Signal::Offer(sdp) | Signal::Answer(sdp) => &mut sdp.from,
            Signal::IceCandidate(candidate) => &mut candidate.from,
            Signal::CamToggle(toggle) => &mut toggle.from,
            Signal::PipState(pip) => &mut pip.from,
            Signal::CallIncoming(call)
            | Signal::CallAccept(call)
            | Signal::CallAccepted(call)
            | Signal::CallDecline(call)
            | Signal::CallDeclined(call)
            | Signal::CallEnd(call)
            | Signal::CallEnded(call) => &mut call.from,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(sender.to_string());
        }
    }

    pub fn to_frame(&self) -> BusResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(text: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn candidate_frame_uses_relay_field_names() {
        let signal = Signal::IceCandidate(CandidateSignal {
            to: Some("peer-b".into()),
            from: None,
            candidate: CandidatePayload {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
            room_id: Some("room-7".into()),
        });
        let value: Value = serde_json::from_str(&signal.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "ice-candidate");
        assert_eq!(value["data"]["roomId"], "room-7");
        assert_eq!(value["data"]["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["data"]["candidate"]["sdpMid"], "0");
        assert!(value["data"].get("from").is_none());
    }

    #[test]
    fn unit_events_decode_without_data() {
        let decoded = Signal::from_frame(r#"{"event":"peer:left"}"#).unwrap();
        assert_eq!(decoded, Signal::PeerLeft);
        assert_eq!(Signal::Start.to_frame().unwrap(), r#"{"event":"start"}"#);
    }

    #[test]
    fn pip_state_keeps_mixed_case_flag() {
        let frame = json!({
            "event": "pip:state",
            "data": {"inPiP": true, "from": "peer-a", "roomId": "r1"}
        })
        .to_string();
        let decoded = Signal::from_frame(&frame).unwrap();
        assert_eq!(decoded.sender(), Some("peer-a"));
        assert_eq!(decoded.room_id(), Some("r1"));
        match decoded {
            Signal::PipState(pip) => assert!(pip.in_pip),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stamp_sender_preserves_existing_attribution() {
        let mut signal = Signal::CamToggle(CamToggle {
            enabled: false,
            from: Some("original".into()),
            to: None,
            room_id: None,
        });
        signal.stamp_sender("relay-guess");
        assert_eq!(signal.sender(), Some("original"));

        let mut call = Signal::CallAccepted(CallSignal {
            call_id: "c1".into(),
            room_id: None,
            from: None,
            to: Some("caller".into()),
            reason: None,
        });
        call.stamp_sender("callee");
        assert_eq!(call.sender(), Some("callee"));
    }

    #[test]
    fn unknown_events_are_rejected() {
        let err = Signal::from_frame(r#"{"event":"typing","data":{}}"#).unwrap_err();
        assert!(matches!(err, crate::BusError::Codec(_)));
    }
}
