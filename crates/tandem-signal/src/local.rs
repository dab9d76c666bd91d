use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{BusError, BusResult, Signal, SignalBus};

const LOCAL_BUS_CAPACITY: usize = 256;

/// In-memory bus for tests and loopback setups.
///
/// A standalone bus only records what the engine emits; `deliver` injects
/// inbound traffic. A linked pair forwards every emitted signal to the other
/// side, stamping `from` the way a relay would.
#[derive(Debug)]
pub struct LocalBus {
    id: String,
    inbound: broadcast::Sender<Signal>,
    peer: Option<broadcast::Sender<Signal>>,
    sent: Mutex<Vec<Signal>>,
}

impl LocalBus {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inbound: broadcast::channel(LOCAL_BUS_CAPACITY).0,
            peer: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Two buses wired back to back, as if both ends shared one relay.
    pub fn pair(left: impl Into<String>, right: impl Into<String>) -> (Self, Self) {
        let mut a = Self::new(left);
        let mut b = Self::new(right);
        a.peer = Some(b.inbound.clone());
        b.peer = Some(a.inbound.clone());
        (a, b)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Injects a signal as if the relay had delivered it.
    pub fn deliver(&self, signal: Signal) -> BusResult<()> {
        self.inbound
            .send(signal)
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }

    pub fn sent(&self) -> Vec<Signal> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<Signal> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SignalBus for LocalBus {
    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.inbound.subscribe()
    }

    fn emit(&self, signal: Signal) -> BusResult<()> {
        tracing::trace!(
            target = "tandem::signal",
            bus = %self.id,
            event = signal.name(),
            "local bus emit"
        );
        self.sent.lock().push(signal.clone());
        let Some(peer) = &self.peer else {
            return Ok(());
        };
        let mut forwarded = signal;
        forwarded.stamp_sender(&self.id);
        peer.send(forwarded)
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}
