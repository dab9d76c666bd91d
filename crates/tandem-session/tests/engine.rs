mod common;

use std::sync::Arc;
use std::time::Duration;

use common::match_found;
use tandem_session::runtime::{ConnectionState, SignalingState};
use tandem_session::testing::{FakeRuntime, RecordingHost};
use tandem_session::{
    CallEngine, CallEngineHandle, EndReason, EngineConfig, EngineError, Lifecycle, SessionEvent,
};
use tandem_signal::LocalBus;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    handle: CallEngineHandle,
    events: UnboundedReceiver<SessionEvent>,
    runtime: Arc<FakeRuntime>,
    bus: Arc<LocalBus>,
    task: tokio::task::JoinHandle<()>,
}

fn peer(id: &str, bus: LocalBus) -> Peer {
    let bus = Arc::new(bus);
    let runtime = Arc::new(FakeRuntime::new());
    let host = Arc::new(RecordingHost::new().with_peer_id(id));
    let (engine, handle, events) =
        CallEngine::new(EngineConfig::default(), runtime.clone(), bus.clone(), host)
            .expect("engine");
    Peer {
        handle,
        events,
        runtime,
        bus,
        task: engine.spawn(),
    }
}

async fn wait_for(events: &mut UnboundedReceiver<SessionEvent>, wanted: impl Fn(&SessionEvent) -> bool) {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return;
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("timed out waiting for session event");
}

#[test_timeout::tokio_timeout_test(20)]
async fn two_engines_negotiate_over_a_loopback_relay() {
    let (left, right) = LocalBus::pair("alice", "bob");
    let mut alice = peer("alice", left);
    let mut bob = peer("bob", right);

    alice.handle.start_ephemeral().expect("alice running");
    bob.handle.start_ephemeral().expect("bob running");
    wait_for(&mut alice.events, |e| *e == SessionEvent::Searching).await;
    wait_for(&mut bob.events, |e| *e == SessionEvent::Searching).await;

    alice.bus.deliver(match_found("bob", None)).expect("deliver");
    bob.bus.deliver(match_found("alice", None)).expect("deliver");
    wait_for(&mut alice.events, |e| matches!(e, SessionEvent::Matched { .. })).await;
    wait_for(&mut bob.events, |e| matches!(e, SessionEvent::Matched { .. })).await;

    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = alice.handle.snapshot().await.expect("snapshot");
            let offered = alice
                .runtime
                .last_connection()
                .map(|c| c.offers().len() == 1)
                .unwrap_or(false);
            if offered && snapshot.signaling_state == Some(SignalingState::Stable) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("negotiation settles");

    let alice_connection = alice.runtime.last_connection().expect("connection");
    alice_connection.transition(ConnectionState::Connected);
    wait_for(&mut alice.events, |e| *e == SessionEvent::Connected).await;
    let snapshot = alice.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.lifecycle, Lifecycle::Active);
    assert_eq!(snapshot.partner_id.as_deref(), Some("bob"));

    let bob_snapshot = bob.handle.snapshot().await.expect("snapshot");
    assert_eq!(bob_snapshot.partner_id.as_deref(), Some("alice"));
    assert_eq!(bob.runtime.last_connection().expect("connection").answers(), 1);

    alice.handle.shutdown().await.expect("shutdown");
    wait_for(&mut alice.events, |e| {
        *e == SessionEvent::Ended {
            reason: EndReason::LocalHangup,
        }
    })
    .await;
    alice.task.await.expect("alice task");
    assert!(alice_connection.is_closed());
    assert!(matches!(
        alice.handle.start_ephemeral(),
        Err(EngineError::Stopped)
    ));

    bob.handle.end().expect("bob running");
    wait_for(&mut bob.events, |e| matches!(e, SessionEvent::Ended { .. })).await;
    bob.handle.shutdown().await.expect("shutdown");
    bob.task.await.expect("bob task");
}

#[test_timeout::tokio_timeout_test(10)]
async fn invalid_config_is_rejected() {
    let config = EngineConfig {
        capture_ladder: Vec::new(),
        ..EngineConfig::default()
    };
    let result = CallEngine::new(
        config,
        Arc::new(FakeRuntime::new()),
        Arc::new(LocalBus::new("solo")),
        Arc::new(RecordingHost::new()),
    );
    assert!(matches!(result, Err(EngineError::Config(_))));
}
