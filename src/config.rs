use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{
    EngineConfig, DEFAULT_CLIP_TIMEOUT, DEFAULT_FRAME_RATE, DEFAULT_FRAME_TIMEOUT,
    DEFAULT_IDLE_THRESHOLD,
};
use crate::ingest::WireFormat;
use crate::render::RenderPolicy;
use crate::worker::{Topics, DEFAULT_TICK_PERIOD};

const DEFAULT_OUTPUT_DIR: &str = "out";
const DEFAULT_DATA_TOPIC: &str = "cam/vid";
const DEFAULT_CONTROL_TOPIC: &str = "cam/ctl";
const DEFAULT_ENCODER: &str = "ffmpeg";
const DEFAULT_ENCODER_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RENDER_POLICY: &str = "terminal";
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub const CONFIG_PATH_ENV: &str = "CLIP_RECEIVER_CONFIG";

#[derive(Debug, Deserialize, Default)]
struct ReceiverConfigFile {
    output_dir: Option<PathBuf>,
    format: Option<String>,
    clean_on_start: Option<bool>,
    topics: Option<TopicsConfigFile>,
    timing: Option<TimingConfigFile>,
    render: Option<RenderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TopicsConfigFile {
    data: Option<String>,
    /// Empty string disables the control plane.
    control: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    frame_rate: Option<u32>,
    idle_secs: Option<f64>,
    frame_keep_secs: Option<f64>,
    clip_keep_secs: Option<f64>,
    tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    encoder: Option<PathBuf>,
    timeout_secs: Option<u64>,
    policy: Option<String>,
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub output_dir: PathBuf,
    pub format: WireFormat,
    pub topics: Topics,
    pub frame_rate: u32,
    pub idle_threshold: Duration,
    pub frame_timeout: Duration,
    pub clip_timeout: Duration,
    pub tick_period: Duration,
    pub clean_on_start: bool,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub encoder: PathBuf,
    pub timeout: Duration,
    pub policy: String,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RenderSettings {
    pub fn policy(&self) -> Result<RenderPolicy> {
        RenderPolicy::from_parts(&self.policy, self.max_attempts, self.backoff)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            format: WireFormat::Binary,
            topics: Topics {
                data: DEFAULT_DATA_TOPIC.to_string(),
                control: Some(DEFAULT_CONTROL_TOPIC.to_string()),
            },
            frame_rate: DEFAULT_FRAME_RATE,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            clip_timeout: DEFAULT_CLIP_TIMEOUT,
            tick_period: DEFAULT_TICK_PERIOD,
            clean_on_start: false,
            render: RenderSettings {
                encoder: PathBuf::from(DEFAULT_ENCODER),
                timeout: DEFAULT_ENCODER_TIMEOUT,
                policy: DEFAULT_RENDER_POLICY.to_string(),
                max_attempts: DEFAULT_RETRY_ATTEMPTS,
                backoff: DEFAULT_RETRY_BACKOFF,
            },
        }
    }
}

impl ReceiverConfig {
    /// Load from the file named by `CLIP_RECEIVER_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// File values over defaults, then `CLIP_*` environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ReceiverConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ReceiverConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(dir) = file.output_dir {
            cfg.output_dir = dir;
        }
        if let Some(format) = file.format {
            cfg.format = format.parse()?;
        }
        if let Some(clean) = file.clean_on_start {
            cfg.clean_on_start = clean;
        }
        if let Some(topics) = file.topics {
            if let Some(data) = topics.data {
                cfg.topics.data = data;
            }
            if let Some(control) = topics.control {
                cfg.topics.control = control_topic(&control);
            }
        }
        if let Some(timing) = file.timing {
            if let Some(fps) = timing.frame_rate {
                cfg.frame_rate = fps;
            }
            if let Some(secs) = timing.idle_secs {
                cfg.idle_threshold = secs_f64("timing.idle_secs", secs)?;
            }
            if let Some(secs) = timing.frame_keep_secs {
                cfg.frame_timeout = secs_f64("timing.frame_keep_secs", secs)?;
            }
            if let Some(secs) = timing.clip_keep_secs {
                cfg.clip_timeout = secs_f64("timing.clip_keep_secs", secs)?;
            }
            if let Some(ms) = timing.tick_ms {
                cfg.tick_period = Duration::from_millis(ms);
            }
        }
        if let Some(render) = file.render {
            if let Some(encoder) = render.encoder {
                cfg.render.encoder = encoder;
            }
            if let Some(secs) = render.timeout_secs {
                cfg.render.timeout = Duration::from_secs(secs);
            }
            if let Some(policy) = render.policy {
                cfg.render.policy = policy;
            }
            if let Some(attempts) = render.max_attempts {
                cfg.render.max_attempts = attempts;
            }
            if let Some(ms) = render.backoff_ms {
                cfg.render.backoff = Duration::from_millis(ms);
            }
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_value("CLIP_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(format) = env_value("CLIP_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(topic) = env_value("CLIP_DATA_TOPIC") {
            self.topics.data = topic;
        }
        // Set but empty disables the control plane.
        if let Ok(topic) = std::env::var("CLIP_CONTROL_TOPIC") {
            self.topics.control = control_topic(&topic);
        }
        if let Some(fps) = env_value("CLIP_FRAME_RATE") {
            self.frame_rate = fps
                .parse()
                .map_err(|_| anyhow!("CLIP_FRAME_RATE must be a positive integer"))?;
        }
        if let Some(secs) = env_value("CLIP_IDLE_SECS") {
            self.idle_threshold = env_secs("CLIP_IDLE_SECS", &secs)?;
        }
        if let Some(secs) = env_value("CLIP_FRAME_KEEP_SECS") {
            self.frame_timeout = env_secs("CLIP_FRAME_KEEP_SECS", &secs)?;
        }
        if let Some(secs) = env_value("CLIP_KEEP_SECS") {
            self.clip_timeout = env_secs("CLIP_KEEP_SECS", &secs)?;
        }
        if let Some(ms) = env_value("CLIP_TICK_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| anyhow!("CLIP_TICK_MS must be an integer number of milliseconds"))?;
            self.tick_period = Duration::from_millis(ms);
        }
        if let Some(clean) = env_value("CLIP_CLEAN_ON_START") {
            self.clean_on_start = parse_bool("CLIP_CLEAN_ON_START", &clean)?;
        }
        if let Some(encoder) = env_value("CLIP_ENCODER") {
            self.render.encoder = PathBuf::from(encoder);
        }
        if let Some(secs) = env_value("CLIP_ENCODER_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("CLIP_ENCODER_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.render.timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = env_value("CLIP_RENDER_POLICY") {
            self.render.policy = policy;
        }
        if let Some(attempts) = env_value("CLIP_RENDER_MAX_ATTEMPTS") {
            self.render.max_attempts = attempts
                .parse()
                .map_err(|_| anyhow!("CLIP_RENDER_MAX_ATTEMPTS must be an integer"))?;
        }
        if let Some(ms) = env_value("CLIP_RENDER_BACKOFF_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                anyhow!("CLIP_RENDER_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            self.render.backoff = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.topics.data.trim().is_empty() {
            return Err(anyhow!("data topic must not be empty"));
        }
        if self.frame_rate == 0 {
            return Err(anyhow!("frame rate must be greater than zero"));
        }
        for (name, value) in [
            ("idle threshold", self.idle_threshold),
            ("frame keep timeout", self.frame_timeout),
            ("clip keep timeout", self.clip_timeout),
            ("tick period", self.tick_period),
            ("encoder timeout", self.render.timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.clip_timeout < self.idle_threshold {
            return Err(anyhow!(
                "clip keep timeout ({:?}) must not be shorter than the idle threshold ({:?})",
                self.clip_timeout,
                self.idle_threshold
            ));
        }
        self.render.policy()?;
        Ok(())
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            output_dir: self.output_dir.clone(),
            frame_rate: self.frame_rate,
            idle_threshold: self.idle_threshold,
            frame_timeout: self.frame_timeout,
            clip_timeout: self.clip_timeout,
            control_plane: self.topics.control.is_some(),
            clean_on_start: self.clean_on_start,
            render_policy: self.render.policy()?,
        })
    }
}

fn read_config_file(path: &Path) -> Result<ReceiverConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn control_topic(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

fn secs_f64(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", name))
}

fn env_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = value
        .parse()
        .map_err(|_| anyhow!("{} must be a number of seconds", key))?;
    secs_f64(key, secs)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ReceiverConfig::default();
        cfg.validate().unwrap();
        let engine = cfg.engine_config().unwrap();
        assert!(engine.control_plane);
        assert_eq!(engine.frame_rate, 30);
        assert_eq!(engine.render_policy, RenderPolicy::Terminal);
    }

    #[test]
    fn control_topic_can_be_disabled() {
        assert_eq!(control_topic(""), None);
        assert_eq!(control_topic(" none "), None);
        assert_eq!(control_topic("cam/ctl"), Some("cam/ctl".to_string()));
    }

    #[test]
    fn rejects_clip_keep_shorter_than_idle() {
        let cfg = ReceiverConfig {
            idle_threshold: Duration::from_secs(5),
            clip_timeout: Duration::from_secs(4),
            ..ReceiverConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_negative_seconds() {
        assert!(secs_f64("timing.idle_secs", -1.0).is_err());
        assert_eq!(
            secs_f64("timing.idle_secs", 2.5).unwrap(),
            Duration::from_millis(2500)
        );
    }
}
