//! Session and connection engine for one-to-one WebRTC calls.
//!
//! A [`CallEngine`] runs one call at a time over an unreliable relay
//! ([`tandem_signal::SignalBus`]) and a pluggable media stack
//! ([`runtime::MediaRuntime`]). Work is serialised on a single task; results
//! of anything asynchronous are checked against a [`GenerationToken`] before
//! they are allowed to touch the session.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event;
pub mod host;
pub mod ice;
pub mod media;
pub mod presence;
pub mod reconnect;
pub mod runtime;
pub mod session;
pub mod signal;
pub mod timers;
pub mod token;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{ConfigError, EngineConfig, IceServer};
pub use coordinator::SessionCoordinator;
pub use engine::{CallEngine, CallEngineHandle, Command};
pub use error::{EngineError, ErrorClass, MediaError, NegotiationError, RuntimeError};
pub use host::{CallHost, DefaultHost, EndReason, SessionEvent, StreamSlot};
pub use media::StreamHandle;
pub use presence::RemotePresenceState;
pub use runtime::rtc::WebRtcRuntime;
pub use session::{Lifecycle, Role, Session, SessionKind, SessionSnapshot};
pub use token::GenerationToken;
