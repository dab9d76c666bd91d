use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::event::{EngineEvent, TimerFired, TimerKind};
use crate::token::GenerationToken;

/// Spawns timer tasks that report back through the engine queue.
///
/// A tick carries the token it was scheduled under; the engine drops ticks
/// whose token is no longer current.
#[derive(Debug, Clone)]
pub struct TimerScheduler {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TimerScheduler {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub fn once(&self, kind: TimerKind, token: GenerationToken, after: Duration) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(after).await;
            let _ = tx.send(EngineEvent::Timer(TimerFired { kind, token }));
        })
    }

    /// First tick fires one `period` from now.
    pub fn every(
        &self,
        kind: TimerKind,
        token: GenerationToken,
        period: Duration,
    ) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx
                    .send(EngineEvent::Timer(TimerFired { kind, token }))
                    .is_err()
                {
                    break;
                }
            }
        })
    }
}

/// Timer tasks owned by one component, at most one per kind.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: HashMap<TimerKind, JoinHandle<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handle`, aborting any task already registered for `kind`.
    pub fn insert(&mut self, kind: TimerKind, handle: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(kind, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.tasks.remove(&kind) {
            handle.abort();
        }
    }

    pub fn contains(&self, kind: TimerKind) -> bool {
        self.tasks
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn abort_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.values().all(JoinHandle::is_finished)
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_carry_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TimerScheduler::new(tx);
        let token = GenerationToken::default();
        let mut set = TaskSet::new();
        set.insert(
            TimerKind::HealthPoll,
            scheduler.every(TimerKind::HealthPoll, token, Duration::from_millis(100)),
        );
        for _ in 0..3 {
            match rx.recv().await {
                Some(EngineEvent::Timer(fired)) => {
                    assert_eq!(fired.kind, TimerKind::HealthPoll);
                    assert_eq!(fired.token, token);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        set.abort_all();
        assert!(!set.contains(TimerKind::HealthPoll));
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_timer_aborts_the_old_one() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TimerScheduler::new(tx);
        let mut set = TaskSet::new();
        let old = GenerationToken::default();
        set.insert(
            TimerKind::RingTimeout,
            scheduler.once(TimerKind::RingTimeout, old, Duration::from_millis(50)),
        );
        set.insert(
            TimerKind::RingTimeout,
            scheduler.once(TimerKind::RingTimeout, old, Duration::from_millis(80)),
        );
        time::sleep(Duration::from_millis(200)).await;
        let mut fired = 0;
        while let Ok(EngineEvent::Timer(_)) = rx.try_recv() {
            fired += 1;
        }
        assert_eq!(fired, 1);
    }
}
