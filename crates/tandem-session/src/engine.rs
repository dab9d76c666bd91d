use std::sync::Arc;

use tandem_signal::{Signal, SignalBus};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::coordinator::SessionCoordinator;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::host::{CallHost, SessionEvent};
use crate::media::StreamHandle;
use crate::presence::RemotePresenceState;
use crate::runtime::MediaRuntime;
use crate::session::SessionSnapshot;

/// Requests accepted by the engine task.
#[derive(Debug)]
pub enum Command {
    StartEphemeral,
    StartPersistentCall { peer: String },
    AcceptIncoming { call_id: String },
    Decline { call_id: String },
    GoNext,
    End,
    SetCameraEnabled(bool),
    SetMuted(bool),
    SetPip(bool),
    SetBackgrounded(bool),
    RefreshHost,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    LocalStream(oneshot::Sender<Option<StreamHandle>>),
    RemoteStream(oneshot::Sender<Option<StreamHandle>>),
    Presence(oneshot::Sender<RemotePresenceState>),
    Shutdown(oneshot::Sender<()>),
}

/// Owns the coordinator and serialises everything that touches it.
pub struct CallEngine {
    coordinator: SessionCoordinator,
    commands: mpsc::UnboundedReceiver<Command>,
    internal: mpsc::UnboundedReceiver<EngineEvent>,
    inbound: broadcast::Receiver<Signal>,
}

impl CallEngine {
    /// Builds an engine and its handles. Nothing runs until [`spawn`](Self::spawn).
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn MediaRuntime>,
        bus: Arc<dyn SignalBus>,
        host: Arc<dyn CallHost>,
    ) -> Result<(Self, CallEngineHandle, mpsc::UnboundedReceiver<SessionEvent>), EngineError> {
        config.validate()?;
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let inbound = bus.subscribe();
        let coordinator =
            SessionCoordinator::new(config, runtime, bus, host, internal_tx, events_tx);
        let engine = Self {
            coordinator,
            commands,
            internal,
            inbound,
        };
        Ok((engine, CallEngineHandle { commands: command_tx }, events))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::debug!(target = "tandem::engine", "engine loop started");
        let mut inbound_open = true;
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.coordinator.end().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.dispatch(command).await,
                    None => {
                        self.coordinator.end().await;
                        break;
                    }
                },
                Some(event) = self.internal.recv() => {
                    self.coordinator.handle_engine_event(event).await;
                }
                signal = self.inbound.recv(), if inbound_open => match signal {
                    Ok(signal) => self.coordinator.handle_signal(signal).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(target = "tandem::engine", skipped, "inbound signals lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!(target = "tandem::engine", "signal bus closed");
                        inbound_open = false;
                    }
                },
            }
        }
        tracing::debug!(target = "tandem::engine", "engine loop stopped");
    }

    async fn dispatch(&mut self, command: Command) {
        let coordinator = &mut self.coordinator;
        match command {
            Command::StartEphemeral => coordinator.start_ephemeral().await,
            Command::StartPersistentCall { peer } => coordinator.start_persistent_call(&peer).await,
            Command::AcceptIncoming { call_id } => coordinator.accept_incoming(&call_id).await,
            Command::Decline { call_id } => coordinator.decline(&call_id).await,
            Command::GoNext => coordinator.go_next().await,
            Command::End => coordinator.end().await,
            Command::SetCameraEnabled(enabled) => coordinator.set_camera_enabled(enabled),
            Command::SetMuted(muted) => coordinator.set_muted(muted),
            Command::SetPip(in_pip) => coordinator.set_pip(in_pip),
            Command::SetBackgrounded(backgrounded) => {
                coordinator.set_backgrounded(backgrounded).await
            }
            Command::RefreshHost => {
                coordinator.refresh_host().await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(coordinator.snapshot());
            }
            Command::LocalStream(reply) => {
                let _ = reply.send(coordinator.local_stream());
            }
            Command::RemoteStream(reply) => {
                let _ = reply.send(coordinator.remote_stream());
            }
            Command::Presence(reply) => {
                let _ = reply.send(coordinator.presence());
            }
            Command::Shutdown(_) => {}
        }
    }
}

/// Cheap, cloneable front door to a running [`CallEngine`].
#[derive(Debug, Clone)]
pub struct CallEngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CallEngineHandle {
    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Stopped)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn start_ephemeral(&self) -> Result<(), EngineError> {
        self.send(Command::StartEphemeral)
    }

    pub fn start_persistent_call(&self, peer: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::StartPersistentCall { peer: peer.into() })
    }

    pub fn accept_incoming(&self, call_id: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::AcceptIncoming {
            call_id: call_id.into(),
        })
    }

    pub fn decline(&self, call_id: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::Decline {
            call_id: call_id.into(),
        })
    }

    pub fn go_next(&self) -> Result<(), EngineError> {
        self.send(Command::GoNext)
    }

    pub fn end(&self) -> Result<(), EngineError> {
        self.send(Command::End)
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.send(Command::SetCameraEnabled(enabled))
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), EngineError> {
        self.send(Command::SetMuted(muted))
    }

    pub fn set_pip(&self, in_pip: bool) -> Result<(), EngineError> {
        self.send(Command::SetPip(in_pip))
    }

    pub fn set_backgrounded(&self, backgrounded: bool) -> Result<(), EngineError> {
        self.send(Command::SetBackgrounded(backgrounded))
    }

    /// Asks the engine to re-read host state, ending the call when call mode
    /// went away.
    pub fn refresh_host(&self) -> Result<(), EngineError> {
        self.send(Command::RefreshHost)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, EngineError> {
        self.ask(Command::Snapshot).await
    }

    pub async fn local_stream(&self) -> Result<Option<StreamHandle>, EngineError> {
        self.ask(Command::LocalStream).await
    }

    pub async fn remote_stream(&self) -> Result<Option<StreamHandle>, EngineError> {
        self.ask(Command::RemoteStream).await
    }

    pub async fn presence(&self) -> Result<RemotePresenceState, EngineError> {
        self.ask(Command::Presence).await
    }

    /// Ends any session and stops the engine task.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.ask(Command::Shutdown).await
    }
}
