use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::{CaptureConstraints, Facing, VideoConstraints};

const ENV_PREFIX: &str = "TANDEM_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Engine tunables. Every field has a default, so an empty TOML document is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServer>,
    pub health_poll_ms: u64,
    /// How long `disconnected` must persist before an ICE restart.
    pub disconnect_grace_ms: u64,
    pub restart_cooldown_ms: u64,
    pub max_ice_restarts: u32,
    pub remote_track_poll_ms: u64,
    /// Inference suppression window after establishment or stream arrival.
    pub presence_grace_ms: u64,
    pub pending_presence_max_age_ms: u64,
    pub mic_level_poll_ms: u64,
    pub ring_timeout_ms: u64,
    pub max_stream_recreations: u32,
    pub capture_ladder: Vec<CaptureConstraints>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            health_poll_ms: 2_000,
            disconnect_grace_ms: 1_500,
            restart_cooldown_ms: 5_000,
            max_ice_restarts: 5,
            remote_track_poll_ms: 150,
            presence_grace_ms: 500,
            pending_presence_max_age_ms: 10_000,
            mic_level_poll_ms: 180,
            ring_timeout_ms: 30_000,
            max_stream_recreations: 1,
            capture_ladder: default_capture_ladder(),
        }
    }
}

fn default_capture_ladder() -> Vec<CaptureConstraints> {
    vec![
        CaptureConstraints {
            label: "hd-front".into(),
            audio: true,
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
                facing: Facing::Front,
            }),
        },
        CaptureConstraints {
            label: "sd".into(),
            audio: true,
            video: Some(VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 24,
                facing: Facing::Any,
            }),
        },
        CaptureConstraints {
            label: "default-video".into(),
            audio: true,
            video: Some(VideoConstraints {
                width: 0,
                height: 0,
                frame_rate: 0,
                facing: Facing::Any,
            }),
        },
        CaptureConstraints {
            label: "audio-only".into(),
            audio: true,
            video: None,
        },
    ]
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Applies `TANDEM_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides resolved through `lookup`, which receives the full
    /// variable name (for example `TANDEM_HEALTH_POLL_MS`).
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_u64 = |name: &str, slot: &mut u64| -> Result<(), ConfigError> {
            let key = format!("{ENV_PREFIX}{name}");
            if let Some(value) = lookup(&key) {
                *slot = value.trim().parse().map_err(|_| ConfigError::Env {
                    key: key.clone(),
                    value,
                })?;
            }
            Ok(())
        };
        read_u64("HEALTH_POLL_MS", &mut self.health_poll_ms)?;
        read_u64("DISCONNECT_GRACE_MS", &mut self.disconnect_grace_ms)?;
        read_u64("RESTART_COOLDOWN_MS", &mut self.restart_cooldown_ms)?;
        read_u64("REMOTE_TRACK_POLL_MS", &mut self.remote_track_poll_ms)?;
        read_u64("PRESENCE_GRACE_MS", &mut self.presence_grace_ms)?;
        read_u64(
            "PENDING_PRESENCE_MAX_AGE_MS",
            &mut self.pending_presence_max_age_ms,
        )?;
        read_u64("MIC_LEVEL_POLL_MS", &mut self.mic_level_poll_ms)?;
        read_u64("RING_TIMEOUT_MS", &mut self.ring_timeout_ms)?;

        let mut restarts = u64::from(self.max_ice_restarts);
        read_u64("MAX_ICE_RESTARTS", &mut restarts)?;
        self.max_ice_restarts = u32::try_from(restarts).unwrap_or(u32::MAX);

        let mut recreations = u64::from(self.max_stream_recreations);
        read_u64("MAX_STREAM_RECREATIONS", &mut recreations)?;
        self.max_stream_recreations = u32::try_from(recreations).unwrap_or(u32::MAX);

        let ice_key = format!("{ENV_PREFIX}ICE_URLS");
        if let Some(urls) = lookup(&ice_key) {
            // An empty value means host candidates only.
            self.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_ladder.is_empty() {
            return Err(ConfigError::Invalid("capture_ladder is empty".into()));
        }
        let periods = [
            ("health_poll_ms", self.health_poll_ms),
            ("remote_track_poll_ms", self.remote_track_poll_ms),
            ("mic_level_poll_ms", self.mic_level_poll_ms),
            ("ring_timeout_ms", self.ring_timeout_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn remote_track_poll(&self) -> Duration {
        Duration::from_millis(self.remote_track_poll_ms)
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn pending_presence_max_age(&self) -> Duration {
        Duration::from_millis(self.pending_presence_max_age_ms)
    }

    pub fn mic_level_poll(&self) -> Duration {
        Duration::from_millis(self.mic_level_poll_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }
}
