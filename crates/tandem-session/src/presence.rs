//! Partner camera, mute and PiP state.
//!
//! Two sources feed the state: periodic sampling of the remote tracks and
//! explicit `cam-toggle` / `pip:state` signals. Explicit signals win. A single
//! grace window, opened when the connection is established and whenever a new
//! remote stream arrives, suppresses all inference so that tracks which are
//! live but not yet producing frames do not flicker the UI.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::event::TimerKind;
use crate::runtime::MediaTrack;
use crate::timers::{TaskSet, TimerScheduler};
use crate::token::GenerationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemotePresenceState {
    pub camera_on: bool,
    pub muted: bool,
    pub in_pip: bool,
    /// Camera was turned off by an explicit signal; inference may not turn
    /// it back on.
    pub forced_off: bool,
    pub last_observed_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Camera(bool),
    Muted(bool),
    Pip(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSample {
    pub live: bool,
    pub enabled: bool,
}

impl TrackSample {
    pub fn of(track: &dyn MediaTrack) -> Self {
        Self {
            live: track.is_live(),
            enabled: track.is_enabled(),
        }
    }

    fn active(self) -> bool {
        self.live && self.enabled
    }
}

#[derive(Debug, Clone)]
struct PendingPresence {
    partner: String,
    camera: Option<bool>,
    pip: Option<bool>,
    received_at: Instant,
}

pub struct RemotePresenceTracker {
    grace: Duration,
    max_pending_age: Duration,
    poll: Duration,
    scheduler: TimerScheduler,
    timers: TaskSet,
    state: RemotePresenceState,
    partner: Option<String>,
    stream_present: bool,
    grace_until: Option<Instant>,
    deferred_off: bool,
    pending: Option<PendingPresence>,
}

impl RemotePresenceTracker {
    pub fn new(config: &EngineConfig, scheduler: TimerScheduler) -> Self {
        Self {
            grace: config.presence_grace(),
            max_pending_age: config.pending_presence_max_age(),
            poll: config.remote_track_poll(),
            scheduler,
            timers: TaskSet::new(),
            state: RemotePresenceState::default(),
            partner: None,
            stream_present: false,
            grace_until: None,
            deferred_off: false,
            pending: None,
        }
    }

    pub fn state(&self) -> RemotePresenceState {
        self.state
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        self.grace_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// A different partner supersedes any held update.
    pub fn set_partner(&mut self, partner: Option<&str>) {
        if self.partner.as_deref() == partner {
            return;
        }
        self.partner = partner.map(str::to_string);
        let superseded = match (&self.pending, partner) {
            (Some(pending), Some(partner)) => pending.partner != partner,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if superseded {
            tracing::debug!(target = "tandem::presence", "pending presence superseded by partner change");
            self.pending = None;
        }
    }

    pub fn start_polling(&mut self, token: GenerationToken) {
        let handle = self
            .scheduler
            .every(TimerKind::RemoteTrackPoll, token, self.poll);
        self.timers.insert(TimerKind::RemoteTrackPoll, handle);
    }

    pub fn polling(&self) -> bool {
        self.timers.contains(TimerKind::RemoteTrackPoll)
    }

    /// Connection reached `connected`: open the grace window.
    pub fn on_established(&mut self, now: Instant) {
        self.grace_until = Some(now + self.grace);
        tracing::debug!(
            target = "tandem::presence",
            grace_ms = self.grace.as_millis() as u64,
            "grace window opened"
        );
    }

    /// A new remote stream arrived. The camera is shown on while the window
    /// is open, then any held explicit update is applied.
    pub fn on_stream_arrived(&mut self, has_video: bool, now: Instant) -> Vec<PresenceChange> {
        self.stream_present = true;
        self.grace_until = Some(now + self.grace);
        let mut changes = Vec::new();
        if has_video && !self.state.forced_off {
            self.set_camera(true, &mut changes);
        }

        if let Some(pending) = self.pending.take() {
            let fresh = now.saturating_duration_since(pending.received_at) <= self.max_pending_age;
            let ours = self.partner.as_deref() == Some(pending.partner.as_str());
            if fresh && ours {
                tracing::debug!(target = "tandem::presence", "applying held presence update");
                if let Some(enabled) = pending.camera {
                    changes.extend(self.apply_camera(enabled, now));
                }
                if let Some(in_pip) = pending.pip {
                    self.set_pip(in_pip, &mut changes);
                }
            } else {
                tracing::debug!(target = "tandem::presence", fresh, ours, "discarding held presence update");
            }
        }
        changes
    }

    pub fn on_explicit_camera(
        &mut self,
        partner: &str,
        enabled: bool,
        now: Instant,
    ) -> Vec<PresenceChange> {
        if !self.stream_present {
            self.hold(partner, now).camera = Some(enabled);
            return Vec::new();
        }
        self.apply_camera(enabled, now)
    }

    pub fn on_explicit_pip(&mut self, partner: &str, in_pip: bool, now: Instant) -> Vec<PresenceChange> {
        if !self.stream_present {
            self.hold(partner, now).pip = Some(in_pip);
            return Vec::new();
        }
        let mut changes = Vec::new();
        self.set_pip(in_pip, &mut changes);
        changes
    }

    /// Inference pass over the current remote tracks.
    pub fn sample(
        &mut self,
        video: Option<TrackSample>,
        audio: Option<TrackSample>,
        now: Instant,
    ) -> Vec<PresenceChange> {
        self.state.last_observed_at = Some(now);
        if let Some(pending) = &self.pending {
            if now.saturating_duration_since(pending.received_at) > self.max_pending_age {
                tracing::debug!(target = "tandem::presence", "held presence update expired");
                self.pending = None;
            }
        }
        let mut changes = Vec::new();
        if self.in_grace(now) {
            return changes;
        }
        if self.deferred_off {
            self.deferred_off = false;
            self.set_camera(false, &mut changes);
        }
        if let Some(audio) = audio {
            let muted = !audio.active();
            if muted != self.state.muted {
                self.state.muted = muted;
                changes.push(PresenceChange::Muted(muted));
            }
        }
        if !self.state.forced_off {
            let camera = video.map(TrackSample::active).unwrap_or(false);
            self.set_camera(camera, &mut changes);
        }
        changes
    }

    /// Forgets the stream and all derived state. A held update survives
    /// until the partner changes or it ages out.
    pub fn reset(&mut self) {
        self.timers.abort_all();
        self.state = RemotePresenceState::default();
        self.stream_present = false;
        self.grace_until = None;
        self.deferred_off = false;
    }

    pub fn clear(&mut self) {
        self.reset();
        self.pending = None;
        self.partner = None;
    }

    fn apply_camera(&mut self, enabled: bool, now: Instant) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        if enabled {
            self.state.forced_off = false;
            self.deferred_off = false;
            self.set_camera(true, &mut changes);
        } else {
            self.state.forced_off = true;
            if self.in_grace(now) {
                tracing::debug!(target = "tandem::presence", "camera off deferred until grace ends");
                self.deferred_off = true;
            } else {
                self.set_camera(false, &mut changes);
            }
        }
        changes
    }

    fn hold(&mut self, partner: &str, now: Instant) -> &mut PendingPresence {
        if !matches!(&self.pending, Some(pending) if pending.partner == partner) {
            self.pending = None;
        }
        let pending = self.pending.get_or_insert_with(|| PendingPresence {
            partner: partner.to_string(),
            camera: None,
            pip: None,
            received_at: now,
        });
        pending.received_at = now;
        pending
    }

    fn set_camera(&mut self, on: bool, changes: &mut Vec<PresenceChange>) {
        if self.state.camera_on != on {
            self.state.camera_on = on;
            changes.push(PresenceChange::Camera(on));
        }
    }

    fn set_pip(&mut self, in_pip: bool, changes: &mut Vec<PresenceChange>) {
        if self.state.in_pip != in_pip {
            self.state.in_pip = in_pip;
            changes.push(PresenceChange::Pip(in_pip));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const LIVE: TrackSample = TrackSample {
        live: true,
        enabled: true,
    };
    const DARK: TrackSample = TrackSample {
        live: true,
        enabled: false,
    };

    fn tracker() -> RemotePresenceTracker {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = RemotePresenceTracker::new(&EngineConfig::default(), TimerScheduler::new(tx));
        tracker.set_partner(Some("bob"));
        tracker
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn explicit_off_inside_grace_is_deferred() {
        let mut presence = tracker();
        let t0 = Instant::now();
        presence.on_stream_arrived(true, t0);
        presence.on_established(t0);
        assert!(presence.state().camera_on);

        assert!(presence.on_explicit_camera("bob", false, t0 + ms(100)).is_empty());
        assert!(presence.state().camera_on);
        assert!(presence.sample(Some(LIVE), Some(LIVE), t0 + ms(300)).is_empty());
        assert!(presence.state().camera_on);

        let changes = presence.sample(Some(LIVE), Some(LIVE), t0 + ms(550));
        assert_eq!(changes, vec![PresenceChange::Camera(false)]);
        assert!(presence.state().forced_off);
    }

    #[test]
    fn forced_off_blocks_inference_until_explicit_on() {
        let mut presence = tracker();
        let t0 = Instant::now();
        presence.on_stream_arrived(true, t0);
        let after = t0 + ms(600);
        presence.on_explicit_camera("bob", false, after);
        assert!(presence.sample(Some(LIVE), None, after + ms(150)).is_empty());
        assert!(!presence.state().camera_on);

        let changes = presence.on_explicit_camera("bob", true, after + ms(300));
        assert_eq!(changes, vec![PresenceChange::Camera(true)]);
        let changes = presence.sample(Some(DARK), None, after + ms(450));
        assert_eq!(changes, vec![PresenceChange::Camera(false)]);
    }

    #[test]
    fn inference_off_in_grace_never_beats_held_explicit_on() {
        let mut presence = tracker();
        let t0 = Instant::now();
        presence.on_explicit_camera("bob", true, t0);
        assert!(presence.has_pending());
        presence.on_stream_arrived(true, t0 + ms(50));
        assert!(presence.state().camera_on);
        assert!(presence.sample(Some(DARK), None, t0 + ms(200)).is_empty());
        assert!(presence.state().camera_on);
    }

    #[test]
    fn held_update_expires_or_is_superseded() {
        let mut presence = tracker();
        let t0 = Instant::now();
        presence.on_explicit_pip("bob", true, t0);
        presence.on_stream_arrived(true, t0 + ms(10_500));
        assert!(!presence.state().in_pip);

        let mut presence = tracker();
        presence.on_explicit_pip("bob", true, t0);
        presence.set_partner(Some("carol"));
        assert!(!presence.has_pending());

        let mut presence = tracker();
        presence.on_explicit_pip("bob", true, t0);
        let changes = presence.on_stream_arrived(false, t0 + ms(20));
        assert_eq!(changes, vec![PresenceChange::Pip(true)]);
    }

    #[test]
    fn mute_is_inferred_from_audio_after_grace() {
        let mut presence = tracker();
        let t0 = Instant::now();
        presence.on_stream_arrived(true, t0);
        assert!(presence.sample(Some(LIVE), Some(DARK), t0 + ms(100)).is_empty());
        let changes = presence.sample(Some(LIVE), Some(DARK), t0 + ms(600));
        assert_eq!(changes, vec![PresenceChange::Muted(true)]);
    }
}
