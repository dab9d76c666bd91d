mod common;

use std::time::Duration;

use common::*;
use tandem_session::testing::Harness;
use tandem_session::{EndReason, Lifecycle, Role, SessionEvent, SessionKind};
use tandem_signal::{CallSignal, Signal};

fn ring(h: &Harness) -> String {
    let sent = h.sent();
    let call_id = sent.iter().find_map(|signal| match signal {
        Signal::FriendCall(call) => {
            assert_eq!(call.to, "bob");
            Some(call.call_id.clone())
        }
        _ => None,
    });
    call_id.expect("friend:call sent")
}

fn reply(call_id: &str, reason: Option<&str>) -> CallSignal {
    CallSignal {
        call_id: call_id.into(),
        room_id: Some("room-call".into()),
        from: Some("bob".into()),
        to: None,
        reason: reason.map(str::to_string),
    }
}

fn ended(events: &[SessionEvent]) -> Option<EndReason> {
    events.iter().find_map(|event| match event {
        SessionEvent::Ended { reason } => Some(*reason),
        _ => None,
    })
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn unanswered_ring_times_out() {
    let mut h = Harness::new("alice");
    h.coordinator.start_persistent_call("bob").await;
    h.pump().await;
    let call_id = ring(&h);
    assert_eq!(h.coordinator.snapshot().kind, Some(SessionKind::Persistent));
    h.events();

    h.advance(Duration::from_millis(29_900)).await;
    assert!(h.sent().is_empty());
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);

    h.advance(Duration::from_millis(200)).await;
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["call:end"]);
    match &sent[0] {
        Signal::CallEnd(end) => {
            assert_eq!(end.call_id, call_id);
            assert_eq!(end.to.as_deref(), Some("bob"));
            assert_eq!(end.reason.as_deref(), Some("timeout"));
        }
        other => panic!("unexpected signal {other:?}"),
    }
    assert_eq!(ended(&h.events()), Some(EndReason::Timeout));
    assert!(h.runtime.connections().iter().all(|c| c.is_closed()));
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn accepted_call_offers_and_stops_ringing() {
    let mut h = Harness::new("alice");
    h.coordinator.start_persistent_call("bob").await;
    h.pump().await;
    let call_id = ring(&h);
    h.events();

    h.deliver(Signal::CallAccepted(reply(&call_id, None))).await;
    assert_eq!(
        h.events(),
        vec![SessionEvent::Matched {
            partner_id: "bob".into(),
            room_id: Some("room-call".into()),
            role: Role::Initiator,
        }]
    );
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["room:join:ack", "offer", "ice-candidate"]);
    assert_eq!(offers(&sent)[0].room_id.as_deref(), Some("room-call"));

    // a duplicate accept is ignored
    h.deliver(Signal::CallAccept(reply(&call_id, None))).await;
    assert!(h.sent().is_empty());

    h.advance(Duration::from_secs(31)).await;
    assert_eq!(ended(&h.events()), None);
    assert!(!names(&h.sent()).contains(&"call:end"));
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn declined_call_ends() {
    let mut h = Harness::new("alice");
    h.coordinator.start_persistent_call("bob").await;
    h.pump().await;
    let call_id = ring(&h);

    h.deliver(Signal::CallDeclined(reply(&call_id, Some("declined"))))
        .await;
    assert_eq!(ended(&h.events()), Some(EndReason::Declined));
    assert!(h.sent().is_empty());
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn busy_callee_ends_with_busy() {
    let mut h = Harness::new("alice");
    h.coordinator.start_persistent_call("bob").await;
    h.pump().await;
    let call_id = ring(&h);

    h.deliver(Signal::CallDecline(reply(&call_id, Some("busy"))))
        .await;
    assert_eq!(ended(&h.events()), Some(EndReason::Busy));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn decline_for_other_call_is_ignored() {
    let mut h = Harness::new("alice");
    h.coordinator.start_persistent_call("bob").await;
    h.pump().await;
    ring(&h);

    h.deliver(Signal::CallDeclined(reply("some-other-call", None)))
        .await;
    assert_eq!(ended(&h.events()), None);
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);
}

async fn accepted_incoming(h: &mut Harness) {
    h.deliver(Signal::CallIncoming(call("c1", "alice"))).await;
    h.coordinator.accept_incoming("c1").await;
    h.pump().await;
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn incoming_call_accept_and_answer() {
    let mut h = Harness::new("bob");
    h.deliver(Signal::CallIncoming(call("c1", "alice"))).await;
    assert_eq!(
        h.events(),
        vec![SessionEvent::IncomingCall {
            call_id: "c1".into(),
            from: "alice".into(),
            room_id: Some("room-c1".into()),
        }]
    );
    assert_eq!(h.host.friend_checks(), vec!["alice"]);

    // the relay repeats the ring
    h.deliver(Signal::CallIncoming(call("c1", "alice"))).await;
    assert!(h.events().is_empty());

    h.coordinator.accept_incoming("c1").await;
    h.pump().await;
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["call:accept", "room:join:ack"]);
    match &sent[0] {
        Signal::CallAccept(accept) => {
            assert_eq!(accept.to.as_deref(), Some("alice"));
            assert_eq!(accept.room_id.as_deref(), Some("room-c1"));
        }
        other => panic!("unexpected signal {other:?}"),
    }
    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot.role, Some(Role::Receiver));
    assert_eq!(snapshot.call_id.as_deref(), Some("c1"));
    assert!(h.events().contains(&SessionEvent::Matched {
        partner_id: "alice".into(),
        room_id: Some("room-c1".into()),
        role: Role::Receiver,
    }));

    h.deliver(offer_from("alice", "offer-alice-1")).await;
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["answer", "ice-candidate"]);
    assert_eq!(answers(&sent)[0].to.as_deref(), Some("alice"));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn incoming_call_while_busy_is_declined() {
    let mut h = Harness::new("bob");
    accepted_incoming(&mut h).await;
    h.sent();
    h.events();

    h.deliver(Signal::CallIncoming(call("c2", "carol"))).await;
    assert!(h.events().is_empty());
    let sent = h.sent();
    match sent.as_slice() {
        [Signal::CallDecline(decline)] => {
            assert_eq!(decline.call_id, "c2");
            assert_eq!(decline.to.as_deref(), Some("carol"));
            assert_eq!(decline.reason.as_deref(), Some("busy"));
        }
        other => panic!("unexpected signals {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn call_from_non_friend_is_declined() {
    let mut h = Harness::new("bob");
    h.host.not_a_friend("mallory");
    h.deliver(Signal::CallIncoming(call("c9", "mallory"))).await;
    assert!(h.events().is_empty());
    match h.sent().as_slice() {
        [Signal::CallDecline(decline)] => {
            assert_eq!(decline.reason.as_deref(), Some("not-friend"));
        }
        other => panic!("unexpected signals {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn accepting_one_ring_declines_the_rest() {
    let mut h = Harness::new("bob");
    h.deliver(Signal::CallIncoming(call("c1", "alice"))).await;
    h.deliver(Signal::CallIncoming(call("c2", "carol"))).await;
    h.coordinator.accept_incoming("c1").await;
    h.pump().await;

    let sent = h.sent();
    assert_eq!(names(&sent), vec!["call:decline", "call:accept", "room:join:ack"]);
    match &sent[0] {
        Signal::CallDecline(decline) => {
            assert_eq!(decline.call_id, "c2");
            assert_eq!(decline.reason.as_deref(), Some("busy"));
        }
        other => panic!("unexpected signal {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn caller_hanging_up_cancels_the_ring() {
    let mut h = Harness::new("bob");
    h.deliver(Signal::CallIncoming(call("c1", "alice"))).await;
    h.events();

    h.deliver(Signal::CallEnded(call("c1", "alice"))).await;
    assert_eq!(
        h.events(),
        vec![SessionEvent::IncomingCancelled {
            call_id: "c1".into()
        }]
    );
    h.coordinator.accept_incoming("c1").await;
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
    assert!(h.sent().is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn declining_a_ring_notifies_caller() {
    let mut h = Harness::new("bob");
    h.deliver(Signal::CallIncoming(call("c1", "alice"))).await;
    h.coordinator.decline("c1").await;
    match h.sent().as_slice() {
        [Signal::CallDecline(decline)] => {
            assert_eq!(decline.to.as_deref(), Some("alice"));
            assert_eq!(decline.reason.as_deref(), Some("declined"));
        }
        other => panic!("unexpected signals {other:?}"),
    }
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Idle);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn remote_hangup_ends_call() {
    let mut h = Harness::new("bob");
    accepted_incoming(&mut h).await;
    h.sent();
    h.events();

    h.deliver(Signal::CallEnd(call("c1", "alice"))).await;
    assert_eq!(ended(&h.events()), Some(EndReason::RemoteHangup));
    assert_eq!(names(&h.sent()), vec!["room:leave"]);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn transport_drop_keeps_persistent_call() {
    let mut h = Harness::new("bob");
    accepted_incoming(&mut h).await;
    h.events();

    h.deliver(Signal::Disconnected).await;
    assert_eq!(h.events(), vec![SessionEvent::Disconnected]);
    assert_eq!(h.coordinator.lifecycle(), Lifecycle::Negotiating);

    h.deliver(Signal::PeerLeft).await;
    assert_eq!(ended(&h.events()), Some(EndReason::RemoteHangup));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn local_hangup_sends_call_end() {
    let mut h = Harness::new("bob");
    accepted_incoming(&mut h).await;
    h.sent();

    h.coordinator.end().await;
    let sent = h.sent();
    assert_eq!(names(&sent), vec!["call:end", "room:leave"]);
    match &sent[0] {
        Signal::CallEnd(end) => {
            assert_eq!(end.call_id, "c1");
            assert_eq!(end.to.as_deref(), Some("alice"));
            assert_eq!(end.reason.as_deref(), Some("hangup"));
        }
        other => panic!("unexpected signal {other:?}"),
    }
    assert_eq!(ended(&h.events()), Some(EndReason::LocalHangup));
}
