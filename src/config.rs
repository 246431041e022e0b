use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::frame::DEFAULT_FRAME_CAPACITY;
use crate::ingest::{
    NetworkSources, TelemetrySettings, VideoConfig, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_POLL_INTERVAL, DEFAULT_TELEMETRY_ADDR,
};
use crate::session::{SessionSettings, DEFAULT_PULL_TIMEOUT};
use crate::supervisor::{RestartPolicy, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF};

#[derive(Debug, Deserialize, Default)]
struct FusionConfigFile {
    video: Option<VideoConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
    session: Option<SessionConfigFile>,
    restart: Option<RestartConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    addr: Option<String>,
    max_message_bytes: Option<usize>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    frame_capacity: Option<usize>,
    first_pull_timeout_ms: Option<u64>,
    pull_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RestartConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_restarts: Option<u32>,
    jitter: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub video: VideoConfig,
    pub telemetry_addr: String,
    pub session: SessionSettings,
    pub restart: RestartPolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            telemetry_addr: DEFAULT_TELEMETRY_ADDR.to_string(),
            session: SessionSettings::default(),
            restart: RestartPolicy::default(),
        }
    }
}

impl FusionConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FUSION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FusionConfigFile) -> Self {
        let video = file.video.unwrap_or_default();
        let telemetry = file.telemetry.unwrap_or_default();
        let session = file.session.unwrap_or_default();
        let restart = file.restart.unwrap_or_default();
        let defaults = Self::default();

        Self {
            video: VideoConfig {
                url: video.url.unwrap_or(defaults.video.url),
                width: video.width.unwrap_or(defaults.video.width),
                height: video.height.unwrap_or(defaults.video.height),
                target_fps: video.target_fps.unwrap_or(defaults.video.target_fps),
            },
            telemetry_addr: telemetry.addr.unwrap_or(defaults.telemetry_addr),
            session: SessionSettings {
                frame_capacity: session.frame_capacity.unwrap_or(DEFAULT_FRAME_CAPACITY),
                first_pull_timeout: session.first_pull_timeout_ms.map(Duration::from_millis),
                pull_timeout: session
                    .pull_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_PULL_TIMEOUT),
                telemetry: TelemetrySettings {
                    max_message_bytes: telemetry
                        .max_message_bytes
                        .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
                    poll_interval: telemetry
                        .poll_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_POLL_INTERVAL),
                },
            },
            restart: RestartPolicy {
                initial_backoff: restart
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_INITIAL_BACKOFF),
                max_backoff: restart
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_MAX_BACKOFF),
                max_restarts: restart.max_restarts,
                jitter: restart.jitter.unwrap_or(defaults.restart.jitter),
                healthy_after: defaults.restart.healthy_after,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FUSION_VIDEO_URL") {
            if !url.trim().is_empty() {
                self.video.url = url;
            }
        }
        if let Ok(addr) = std::env::var("FUSION_TELEMETRY_ADDR") {
            if !addr.trim().is_empty() {
                self.telemetry_addr = addr;
            }
        }
        if let Some(bytes) = env_number::<usize>("FUSION_TELEMETRY_MAX_BYTES")? {
            self.session.telemetry.max_message_bytes = bytes;
        }
        if let Some(capacity) = env_number::<usize>("FUSION_FRAME_CAPACITY")? {
            self.session.frame_capacity = capacity;
        }
        if let Some(millis) = env_number::<u64>("FUSION_PULL_TIMEOUT_MS")? {
            self.session.pull_timeout = Duration::from_millis(millis);
        }
        if let Some(max) = env_number::<u32>("FUSION_MAX_RESTARTS")? {
            self.restart.max_restarts = Some(max);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.url.trim().is_empty() {
            return Err(anyhow!("video url must not be empty"));
        }
        if self.telemetry_addr.trim().is_empty() {
            return Err(anyhow!("telemetry address must not be empty"));
        }
        if self.session.frame_capacity == 0 {
            return Err(anyhow!("frame capacity must be at least 1"));
        }
        if self.session.telemetry.max_message_bytes == 0 {
            return Err(anyhow!("telemetry max message size must be at least 1 byte"));
        }
        if self.session.pull_timeout.is_zero() {
            return Err(anyhow!("pull timeout must be greater than zero"));
        }
        if self.session.first_pull_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("first pull timeout must be greater than zero"));
        }
        if self.session.telemetry.poll_interval.is_zero() {
            return Err(anyhow!("telemetry poll interval must be greater than zero"));
        }
        if self.restart.initial_backoff > self.restart.max_backoff {
            return Err(anyhow!(
                "restart initial backoff {:?} exceeds max backoff {:?}",
                self.restart.initial_backoff,
                self.restart.max_backoff
            ));
        }
        Ok(())
    }

    pub fn network_sources(&self) -> NetworkSources {
        NetworkSources {
            video: self.video.clone(),
            telemetry_addr: self.telemetry_addr.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<FusionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}
