mod common;

use common::*;
use tandem_session::runtime::{ConnectionState, MediaKind, SignalingState};
use tandem_session::testing::Harness;
use tandem_session::{EndReason, Lifecycle, Role, SessionEvent, StreamSlot};
use tandem_signal::Signal;

#[test_timeout::tokio_timeout_test(10, paused)]
async fn initiator_offers_after_match_and_goes_active() {
    let mut h = Harness::new("alice");
    h.coordinator.start_ephemeral().await;
    h.pump().await;
    assert_eq!(
        h.events(),
        vec![
            SessionEvent::StreamChanged {
                slot: StreamSlot::Local,
                stream_id: Some("local-1".into()),
            },
            SessionEvent::Searching,
        ]
    );
    assert_eq!(names(&h.sent()), vec!["start"]);
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);

    h.deliver(match_found("bob", Some(true))).await;
    assert_eq!(
        h.events(),
        vec![SessionEvent::Matched {
            partner_id: "bob".into(),
            room_id: Some(ROOM.into()),
            role: Role::Initiator,
        }]
    );
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["room:join:ack", "offer", "ice-candidate"]);
    let offer = offers(&sent)[0];
    assert_eq!(offer.to.as_deref(), Some("bob"));
    assert_eq!(offer.room_id.as_deref(), Some(ROOM));
    assert!(!offer.sdp.contains("restart"));

    h.deliver(answer_from("bob", "answer-remote")).await;
    assert_eq!(
        h.coordinator.snapshot().signaling_state,
        Some(SignalingState::Stable)
    );

    h.connection().transition(ConnectionState::Connected);
    h.pump().await;
    assert_eq!(h.events(), vec![SessionEvent::Connected]);
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Active);

    // the relay redelivers the answer
    h.deliver(answer_from("bob", "answer-remote")).await;
    assert!(h.sent().is_empty());
    assert!(h.events().is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn missing_initiator_flag_lets_smaller_id_offer() {
    let mut lower = Harness::new("alice");
    lower.coordinator.start_ephemeral().await;
    lower.sent();
    lower.deliver(match_found("bob", None)).await;
    assert_eq!(offers(&lower.sent()).len(), 1);
    assert_eq!(lower.coordinator.snapshot().role, Some(Role::Initiator));

    let mut higher = Harness::new("zed");
    higher.coordinator.start_ephemeral().await;
    higher.sent();
    higher.deliver(match_found("bob", None)).await;
    assert!(offers(&higher.sent()).is_empty());
    assert_eq!(higher.coordinator.snapshot().role, Some(Role::Receiver));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn offer_before_match_adopts_sender() {
    let mut h = Harness::new("alice");
    h.coordinator.start_ephemeral().await;
    h.pump().await;
    h.events();
    h.sent();

    h.deliver(offer_from("bob", "offer-bob-1")).await;
    assert_eq!(
        h.events(),
        vec![SessionEvent::Matched {
            partner_id: "bob".into(),
            room_id: Some(ROOM.into()),
            role: Role::Receiver,
        }]
    );
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["room:join:ack", "answer", "ice-candidate"]);
    assert_eq!(answers(&sent)[0].to.as_deref(), Some("bob"));

    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot.partner_id.as_deref(), Some("bob"));
    assert_eq!(snapshot.partner_user_id.as_deref(), Some("user-bob"));
    assert_eq!(snapshot.role, Some(Role::Receiver));

    // the match that raced the offer changes nothing
    h.deliver(match_found("bob", Some(false))).await;
    assert!(h.sent().is_empty());
    assert!(h.events().is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn redelivered_offer_is_answered_once() {
    let mut h = Harness::new("alice");
    h.coordinator.start_ephemeral().await;
    h.deliver(match_found("bob", Some(false))).await;
    h.sent();

    h.deliver(offer_from("bob", "offer-bob-1")).await;
    h.deliver(offer_from("bob", "offer-bob-1")).await;
    h.deliver(offer_from("bob", "offer-bob-1")).await;
    assert_eq!(answers(&h.sent()).len(), 1);
    assert_eq!(h.connection().answers(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn offer_from_stranger_is_ignored() {
    let mut h = Harness::new("alice");
    h.coordinator.start_ephemeral().await;
    h.deliver(match_found("bob", Some(false))).await;
    h.sent();

    h.deliver(offer_from("mallory", "offer-mallory")).await;
    assert!(h.sent().is_empty());
    assert_eq!(
        h.coordinator.snapshot().signaling_state,
        Some(SignalingState::Stable)
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn go_next_invalidates_old_connection() {
    let mut h = Harness::new("alice");
    connected_initiator(&mut h, "bob").await;
    let old = h.connection();
    let before = h.coordinator.snapshot().generation;
    h.events();
    h.sent();

    h.coordinator.go_next().await;
    h.pump().await;
    assert_eq!(h.events(), vec![SessionEvent::Searching]);
    assert_eq!(names(&h.sent()), vec!["room:leave", "next"]);
    assert!(old.is_closed());
    assert!(old.senders_stopped());

    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot.generation, before + 1);
    assert_eq!(snapshot.lifecycle, Lifecycle::Negotiating);
    assert_eq!(snapshot.partner_id, None);
    assert_eq!(snapshot.room_id, None);
    assert_eq!(snapshot.local_stream_id.as_deref(), Some("local-1"));
    assert_eq!(h.runtime.connections().len(), 2);

    // late callbacks from the torn-down connection are dropped
    old.transition(ConnectionState::Connected);
    old.add_remote_track("stale-stream", MediaKind::Video);
    h.pump().await;
    assert!(h.events().is_empty());
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);
    assert_eq!(h.coordinator.remote_stream().map(|s| s.id().to_string()), None);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn go_next_requires_ephemeral_session() {
    let mut h = Harness::new("alice");
    h.coordinator.go_next().await;
    h.pump().await;
    assert!(h.sent().is_empty());
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn end_is_idempotent_and_releases_everything() {
    let mut h = Harness::new("alice");
    connected_initiator(&mut h, "bob").await;
    let connection = h.connection();
    let local = h.coordinator.local_stream().expect("local stream");
    h.events();
    h.sent();

    h.coordinator.end().await;
    h.pump().await;
    assert_eq!(
        h.events(),
        vec![
            SessionEvent::StreamChanged {
                slot: StreamSlot::Local,
                stream_id: None,
            },
            SessionEvent::Ended {
                reason: EndReason::LocalHangup,
            },
        ]
    );
    assert_eq!(names(&h.sent()), vec!["stop", "room:leave"]);
    assert!(connection.is_closed());
    assert!(connection.senders_stopped());
    assert!(!local.is_valid());
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
    assert!(h.coordinator.local_stream().is_none());

    h.coordinator.end().await;
    h.pump().await;
    assert!(h.events().is_empty());
    assert!(h.sent().is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn peer_left_returns_to_search() {
    let mut h = Harness::new("alice");
    connected_initiator(&mut h, "bob").await;
    h.events();
    h.sent();

    h.deliver(Signal::PeerLeft).await;
    assert_eq!(
        h.events(),
        vec![SessionEvent::Disconnected, SessionEvent::Searching]
    );
    assert_eq!(names(&h.sent()), vec!["room:leave", "next"]);
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn call_mode_going_inactive_ends_session() {
    let mut h = Harness::new("alice");
    connected_initiator(&mut h, "bob").await;
    h.events();
    h.sent();

    h.host.set_call_mode_active(false);
    assert!(!h.coordinator.refresh_host().await);
    let events = h.events();
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Ended {
            reason: EndReason::CallInactive,
        })
    );
    assert_eq!(names(&h.sent()), vec!["stop", "room:leave"]);

    h.coordinator.start_ephemeral().await;
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
    assert!(h.sent().is_empty());
}
