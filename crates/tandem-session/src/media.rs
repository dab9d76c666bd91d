use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MediaError;
use crate::event::TimerKind;
use crate::runtime::{
    AudioLevels, CaptureConstraints, MediaKind, MediaRuntime, MediaTrack, PeerConnection,
};
use crate::timers::{TaskSet, TimerScheduler};
use crate::token::GenerationToken;

/// An immutable set of tracks. Changing the set means building a new handle.
#[derive(Clone)]
pub struct StreamHandle {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl StreamHandle {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// A stream whose tracks have all ended is never usable.
    pub fn is_valid(&self) -> bool {
        self.tracks.iter().any(|track| track.is_live())
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks.iter().filter(|track| track.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// New handle with `track` added, or swapped in for a track with the
    /// same id.
    pub fn with_track(&self, track: Arc<dyn MediaTrack>) -> Self {
        let mut tracks: Vec<_> = self
            .tracks
            .iter()
            .filter(|existing| existing.id() != track.id())
            .cloned()
            .collect();
        tracks.push(track);
        Self {
            id: self.id.clone(),
            tracks,
        }
    }

    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    fn release_except(&self, keep: &StreamHandle) {
        let kept: HashSet<&str> = keep.tracks.iter().map(|track| track.id()).collect();
        for track in self.tracks.iter().filter(|track| !kept.contains(track.id())) {
            track.stop();
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracks: Vec<_> = self
            .tracks
            .iter()
            .map(|track| (track.id().to_string(), track.kind(), track.is_live()))
            .collect();
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("tracks", &tracks)
            .finish()
    }
}

/// Owner of the local and remote stream handles.
pub struct MediaStreamRegistry {
    runtime: Arc<dyn MediaRuntime>,
    ladder: Vec<CaptureConstraints>,
    local: Option<StreamHandle>,
    remote: Option<StreamHandle>,
    scheduler: TimerScheduler,
    meter_period: Duration,
    timers: TaskSet,
}

impl MediaStreamRegistry {
    pub fn new(
        runtime: Arc<dyn MediaRuntime>,
        ladder: Vec<CaptureConstraints>,
        scheduler: TimerScheduler,
        meter_period: Duration,
    ) -> Self {
        Self {
            runtime,
            ladder,
            local: None,
            remote: None,
            scheduler,
            meter_period,
            timers: TaskSet::new(),
        }
    }

    pub fn local(&self) -> Option<&StreamHandle> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&StreamHandle> {
        self.remote.as_ref()
    }

    /// Returns the current local stream when it still has a live track,
    /// otherwise walks the capture ladder.
    pub async fn acquire_local(&mut self) -> Result<StreamHandle, MediaError> {
        if let Some(stream) = self.local.as_ref().filter(|stream| stream.is_valid()) {
            return Ok(stream.clone());
        }
        self.capture().await
    }

    /// Releases the current local stream and captures a fresh one.
    pub async fn recreate_local(&mut self) -> Result<StreamHandle, MediaError> {
        self.replace_local(None);
        self.capture().await
    }

    async fn capture(&mut self) -> Result<StreamHandle, MediaError> {
        let ladder = self.ladder.clone();
        for rung in &ladder {
            match self.runtime.acquire_local_stream(rung).await {
                Ok(stream) if stream.is_valid() => {
                    tracing::debug!(
                        target = "tandem::media",
                        rung = %rung.label,
                        stream = %stream.id(),
                        tracks = stream.tracks().len(),
                        "local stream acquired"
                    );
                    self.replace_local(Some(stream.clone()));
                    return Ok(stream);
                }
                Ok(stream) => {
                    tracing::warn!(
                        target = "tandem::media",
                        rung = %rung.label,
                        stream = %stream.id(),
                        "capture returned only ended tracks"
                    );
                    stream.release();
                }
                Err(err) => {
                    tracing::warn!(
                        target = "tandem::media",
                        rung = %rung.label,
                        error = %err,
                        "capture attempt failed"
                    );
                }
            }
        }
        Err(MediaError::Exhausted)
    }

    /// Swaps the local handle, stopping tracks the new handle does not carry.
    pub fn replace_local(&mut self, next: Option<StreamHandle>) {
        let previous = std::mem::replace(&mut self.local, next);
        release_previous(previous, self.local.as_ref());
    }

    pub fn replace_remote(&mut self, next: Option<StreamHandle>) {
        let previous = std::mem::replace(&mut self.remote, next);
        release_previous(previous, self.remote.as_ref());
    }

    /// Folds an arriving remote track into the remote stream. Returns true
    /// when the track belongs to a stream not seen before.
    pub fn add_remote_track(&mut self, stream_id: &str, track: Arc<dyn MediaTrack>) -> bool {
        let (next, is_new) = match self.remote.as_ref() {
            Some(current) if current.id() == stream_id => (current.with_track(track), false),
            _ => (StreamHandle::new(stream_id, vec![track]), true),
        };
        self.replace_remote(Some(next));
        is_new
    }

    pub fn set_local_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        match self.local.as_ref() {
            Some(stream) if stream.track(kind).is_some() => {
                stream.set_enabled(kind, enabled);
                true
            }
            _ => false,
        }
    }

    pub fn start_meter(&mut self, token: GenerationToken) {
        let handle = self
            .scheduler
            .every(TimerKind::MicLevel, token, self.meter_period);
        self.timers.insert(TimerKind::MicLevel, handle);
    }

    pub fn stop_meter(&mut self) {
        self.timers.cancel(TimerKind::MicLevel);
    }

    pub fn meter_running(&self) -> bool {
        self.timers.contains(TimerKind::MicLevel)
    }

    pub async fn sample_levels(&self, connection: &dyn PeerConnection) -> Option<AudioLevels> {
        match connection.audio_levels().await {
            Ok(levels) => Some(levels),
            Err(err) => {
                tracing::trace!(target = "tandem::media", error = %err, "audio level sample failed");
                None
            }
        }
    }

    /// Drops the remote stream and stops the meter. Local media survives.
    pub fn reset_remote(&mut self) {
        self.stop_meter();
        self.replace_remote(None);
    }

    pub fn release_all(&mut self) {
        self.stop_meter();
        self.replace_remote(None);
        self.replace_local(None);
    }
}

fn release_previous(previous: Option<StreamHandle>, next: Option<&StreamHandle>) {
    let Some(previous) = previous else {
        return;
    };
    match next {
        Some(next) => previous.release_except(next),
        None => previous.release(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{FakeRuntime, FakeTrack};
    use tokio::sync::mpsc;

    fn registry(runtime: Arc<FakeRuntime>) -> MediaStreamRegistry {
        let (tx, _rx) = mpsc::unbounded_channel();
        MediaStreamRegistry::new(
            runtime,
            EngineConfig::default().capture_ladder,
            TimerScheduler::new(tx),
            Duration::from_millis(180),
        )
    }

    #[tokio::test]
    async fn ladder_falls_through_to_audio_only() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_capture_rungs(["hd-front", "sd", "default-video"]);
        let mut media = registry(runtime.clone());
        let stream = media.acquire_local().await.expect("audio only");
        assert!(stream.track(MediaKind::Video).is_none());
        assert!(stream.track(MediaKind::Audio).is_some());
        assert_eq!(runtime.capture_attempts().len(), 4);
    }

    #[tokio::test]
    async fn exhausted_ladder_is_surfaced() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_capture_rungs(["hd-front", "sd", "default-video", "audio-only"]);
        let mut media = registry(runtime);
        assert_eq!(media.acquire_local().await.unwrap_err(), MediaError::Exhausted);
    }

    #[tokio::test]
    async fn replacement_releases_old_tracks() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut media = registry(runtime);
        let first = media.acquire_local().await.expect("stream");
        let again = media.acquire_local().await.expect("stream");
        assert_eq!(first.id(), again.id());

        let second = media.recreate_local().await.expect("stream");
        assert_ne!(first.id(), second.id());
        assert!(first.tracks().iter().all(|track| !track.is_live()));
        assert!(second.is_valid());
    }

    #[test]
    fn remote_tracks_accumulate_into_one_stream() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut media = registry(runtime);
        let audio = FakeTrack::new("ra", MediaKind::Audio);
        let video = FakeTrack::new("rv", MediaKind::Video);
        assert!(media.add_remote_track("remote", audio.clone()));
        assert!(!media.add_remote_track("remote", video.clone()));
        let remote = media.remote().expect("remote");
        assert_eq!(remote.tracks().len(), 2);
        assert!(audio.is_live());

        assert!(media.add_remote_track("other", FakeTrack::new("x", MediaKind::Video)));
        assert!(!audio.is_live());
        assert!(!video.is_live());
    }

    #[test]
    fn ended_stream_is_invalid() {
        let track = FakeTrack::new("a", MediaKind::Audio);
        let stream = StreamHandle::new("s", vec![track.clone() as Arc<dyn MediaTrack>]);
        assert!(stream.is_valid());
        track.end();
        assert!(!stream.is_valid());
        assert!(!StreamHandle::new("empty", Vec::new()).is_valid());
    }
}
