//! Signaling vocabulary shared by the call engine and its relay transports.
//!
//! The relay is a named-event bus with at-least-once, unordered delivery:
//! every [`Signal`] may arrive zero, one or many times. Consumers are expected
//! to deduplicate; this crate only defines the wire shapes and the bus seam.

mod events;
mod local;

pub use events::{
    CallSignal, CamToggle, CandidatePayload, CandidateSignal, FriendCall, MatchFound, PipState,
    RoomRef, SdpSignal, Signal,
};
pub use local::LocalBus;

use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("signal bus closed")]
    Closed,
    #[error("signal bus transport error: {0}")]
    Transport(String),
    #[error("malformed signal frame: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

/// Bidirectional event bus between the engine and the signaling relay.
///
/// Connection management (socket reconnects, auth) belongs to the
/// implementation; the engine only subscribes and emits.
pub trait SignalBus: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Signal>;
    fn emit(&self, signal: Signal) -> BusResult<()>;
}
