#![allow(dead_code)]

use tandem_session::runtime::ConnectionState;
use tandem_session::testing::Harness;
use tandem_session::SessionEvent;
use tandem_signal::{
    CallSignal, CamToggle, CandidatePayload, CandidateSignal, MatchFound, SdpSignal, Signal,
};

pub const ROOM: &str = "room-1";

pub fn match_found(peer: &str, initiator: Option<bool>) -> Signal {
    Signal::MatchFound(MatchFound {
        peer_id: peer.into(),
        user_id: Some(format!("user-{peer}")),
        room_id: Some(ROOM.into()),
        initiator,
    })
}

pub fn offer_from(peer: &str, sdp: &str) -> Signal {
    Signal::Offer(SdpSignal {
        to: None,
        from: Some(peer.into()),
        sdp: sdp.into(),
        room_id: Some(ROOM.into()),
        from_user_id: Some(format!("user-{peer}")),
    })
}

pub fn answer_from(peer: &str, sdp: &str) -> Signal {
    Signal::Answer(SdpSignal {
        to: None,
        from: Some(peer.into()),
        sdp: sdp.into(),
        room_id: Some(ROOM.into()),
        from_user_id: None,
    })
}

pub fn candidate_line(n: u16) -> String {
    format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 6000 typ host")
}

pub fn candidate_from(peer: &str, n: u16) -> Signal {
    Signal::IceCandidate(CandidateSignal {
        to: None,
        from: Some(peer.into()),
        candidate: CandidatePayload {
            candidate: candidate_line(n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        },
        room_id: Some(ROOM.into()),
    })
}

pub fn cam_toggle_from(peer: &str, enabled: bool) -> Signal {
    Signal::CamToggle(CamToggle {
        enabled,
        from: Some(peer.into()),
        to: None,
        room_id: Some(ROOM.into()),
    })
}

pub fn call(call_id: &str, from: &str) -> CallSignal {
    CallSignal {
        call_id: call_id.into(),
        room_id: Some(format!("room-{call_id}")),
        from: Some(from.into()),
        to: None,
        reason: None,
    }
}

/// Ephemeral session on `h`, matched with `peer` as the offering side and
/// connected.
pub async fn connected_initiator(h: &mut Harness, peer: &str) {
    h.coordinator.start_ephemeral().await;
    h.pump().await;
    h.deliver(match_found(peer, Some(true))).await;
    h.deliver(answer_from(peer, "answer-remote")).await;
    h.connection().transition(ConnectionState::Connected);
    h.pump().await;
}

pub fn offers(sent: &[Signal]) -> Vec<&SdpSignal> {
    sent.iter()
        .filter_map(|signal| match signal {
            Signal::Offer(offer) => Some(offer),
            _ => None,
        })
        .collect()
}

pub fn answers(sent: &[Signal]) -> Vec<&SdpSignal> {
    sent.iter()
        .filter_map(|signal| match signal {
            Signal::Answer(answer) => Some(answer),
            _ => None,
        })
        .collect()
}

pub fn names(sent: &[Signal]) -> Vec<&'static str> {
    sent.iter().map(Signal::name).collect()
}

pub fn count(events: &[SessionEvent], wanted: &SessionEvent) -> usize {
    events.iter().filter(|event| *event == wanted).count()
}

/// Drops the periodic audio meter samples.
pub fn without_levels(events: Vec<SessionEvent>) -> Vec<SessionEvent> {
    events
        .into_iter()
        .filter(|event| !matches!(event, SessionEvent::AudioLevel(_)))
        .collect()
}
