use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::event::TimerKind;
use crate::runtime::ConnectionState;
use crate::timers::{TaskSet, TimerScheduler};
use crate::token::GenerationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub poll: Duration,
    pub disconnect_grace: Duration,
    pub cooldown: Duration,
    pub max_attempts: u32,
}

impl RestartPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            poll: config.health_poll(),
            disconnect_grace: config.disconnect_grace(),
            cooldown: config.restart_cooldown(),
            max_attempts: config.max_ice_restarts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthNotice {
    /// First degraded observation of an episode.
    Reconnecting,
    Recovered,
    Closed,
}

/// What the owner should do after an observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub notice: Option<HealthNotice>,
    pub restart: bool,
}

/// Watches connection health and decides when an ICE restart is due.
///
/// The supervisor never touches the connection itself. It hands back an
/// [`Observation`]; the caller re-validates the token and signaling state
/// right before sending and reports a sent restart through
/// [`record_restart`](Self::record_restart).
pub struct ReconnectionSupervisor {
    policy: RestartPolicy,
    scheduler: TimerScheduler,
    timers: TaskSet,
    token: Option<GenerationToken>,
    last_state: Option<ConnectionState>,
    degraded_since: Option<Instant>,
    episode_reported: bool,
    last_restart: Option<Instant>,
    attempts: u32,
    backgrounded: bool,
}

impl ReconnectionSupervisor {
    pub fn new(policy: RestartPolicy, scheduler: TimerScheduler) -> Self {
        Self {
            policy,
            scheduler,
            timers: TaskSet::new(),
            token: None,
            last_state: None,
            degraded_since: None,
            episode_reported: false,
            last_restart: None,
            attempts: 0,
            backgrounded: false,
        }
    }

    /// Begins supervising the connection built under `token`.
    pub fn start(&mut self, token: GenerationToken) {
        if self.token == Some(token) && self.timers.contains(TimerKind::HealthPoll) {
            return;
        }
        self.reset_episode();
        self.attempts = 0;
        self.last_restart = None;
        self.token = Some(token);
        let poll = self
            .scheduler
            .every(TimerKind::HealthPoll, token, self.policy.poll);
        self.timers.insert(TimerKind::HealthPoll, poll);
        tracing::debug!(target = "tandem::reconnect", token = %token, "health supervision started");
    }

    pub fn stop(&mut self) {
        self.timers.abort_all();
        self.token = None;
        self.last_state = None;
        self.reset_episode();
        self.attempts = 0;
        self.last_restart = None;
    }

    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }

    pub fn set_backgrounded(&mut self, backgrounded: bool) {
        self.backgrounded = backgrounded;
    }

    pub fn backgrounded(&self) -> bool {
        self.backgrounded
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn observe(&mut self, state: ConnectionState, now: Instant) -> Observation {
        let Some(token) = self.token else {
            return Observation::default();
        };
        let changed = self.last_state != Some(state);
        self.last_state = Some(state);
        if changed {
            tracing::debug!(target = "tandem::reconnect", token = %token, state = ?state, "connection state");
        }

        match state {
            ConnectionState::Connected | ConnectionState::Completed => {
                let recovered = self.degraded_since.is_some();
                self.reset_episode();
                self.attempts = 0;
                Observation {
                    notice: recovered.then_some(HealthNotice::Recovered),
                    restart: false,
                }
            }
            ConnectionState::Failed => {
                let notice = self.open_episode(now);
                Observation {
                    notice,
                    restart: self.may_restart(now),
                }
            }
            ConnectionState::Disconnected => {
                let notice = self.open_episode(now);
                let since = self.degraded_since.unwrap_or(now);
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= self.policy.disconnect_grace {
                    return Observation {
                        notice,
                        restart: self.may_restart(now),
                    };
                }
                if !self.timers.contains(TimerKind::HealthCheck) {
                    let check = self.scheduler.once(
                        TimerKind::HealthCheck,
                        token,
                        self.policy.disconnect_grace - elapsed,
                    );
                    self.timers.insert(TimerKind::HealthCheck, check);
                }
                Observation {
                    notice,
                    restart: false,
                }
            }
            ConnectionState::Closed => {
                self.timers.abort_all();
                self.token = None;
                self.reset_episode();
                Observation {
                    notice: Some(HealthNotice::Closed),
                    restart: false,
                }
            }
            ConnectionState::New | ConnectionState::Connecting => Observation::default(),
        }
    }

    pub fn record_restart(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_restart = Some(now);
        tracing::info!(
            target = "tandem::reconnect",
            attempt = self.attempts,
            max = self.policy.max_attempts,
            "ice restart sent"
        );
    }

    fn may_restart(&self, now: Instant) -> bool {
        if self.backgrounded {
            tracing::debug!(target = "tandem::reconnect", "restart suppressed while backgrounded");
            return false;
        }
        if self.attempts >= self.policy.max_attempts {
            tracing::debug!(
                target = "tandem::reconnect",
                attempts = self.attempts,
                "restart attempts exhausted"
            );
            return false;
        }
        match self.last_restart {
            Some(at) if now.saturating_duration_since(at) < self.policy.cooldown => {
                tracing::trace!(target = "tandem::reconnect", "restart inside cooldown");
                false
            }
            _ => true,
        }
    }

    fn open_episode(&mut self, now: Instant) -> Option<HealthNotice> {
        self.degraded_since.get_or_insert(now);
        if self.episode_reported {
            return None;
        }
        self.episode_reported = true;
        Some(HealthNotice::Reconnecting)
    }

    fn reset_episode(&mut self) {
        self.degraded_since = None;
        self.episode_reported = false;
        self.timers.cancel(TimerKind::HealthCheck);
    }
}
