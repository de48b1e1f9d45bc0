use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Display names for numeric class labels, e.g. `"0" = "Non-recyclable"`.
    #[serde(default = "default_labels")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Remote,
    Fake,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    /// Remote stream endpoint (MJPEG or single JPEG).
    #[serde(default = "default_stream_url")]
    pub url: String,
    /// Capture device handed to ffmpeg, e.g. `/dev/video0`.
    #[serde(default = "default_device")]
    pub device: String,
    /// ffmpeg input format for the device (`v4l2`, `avfoundation`, `dshow`).
    #[serde(default = "default_input_format")]
    pub input_format: String,
    /// Still size produced by `snapshot()`. Unset keeps the image's own size.
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Re-poll cadence when the endpoint serves single images instead of MJPEG.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_frames")]
    pub frames: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub endpoint: String,
    #[serde(default = "default_frame_field")]
    pub frame_field: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Model tags the category form may submit.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            url: default_stream_url(),
            device: default_device(),
            input_format: default_input_format(),
            width: None,
            height: None,
            jpeg_quality: default_jpeg_quality(),
            keepalive_secs: default_keepalive_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            models: default_models(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SourceConfig {
    /// Fixed still size, if one is configured. The camera defaults to a
    /// 1080x1080 square when nothing is set.
    pub fn still_size(&self) -> Option<(u32, u32)> {
        match (self.width, self.height, self.kind) {
            (Some(w), Some(h), _) => Some((w, h)),
            (Some(s), None, _) | (None, Some(s), _) => Some((s, s)),
            (None, None, SourceKind::Camera) => Some((DEFAULT_CAMERA_SIDE, DEFAULT_CAMERA_SIDE)),
            (None, None, _) => None,
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.interval_ms == 0 {
            return Err(ConfigError::Invalid("capture.interval_ms must be > 0".into()));
        }
        if self.source.jpeg_quality == 0 || self.source.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(
                "source.jpeg_quality must be within 1..=100".into(),
            ));
        }
        for (key, value) in [("width", self.source.width), ("height", self.source.height)] {
            if value.is_some_and(|v| v == 0 || v > MAX_STILL_EDGE) {
                return Err(ConfigError::Invalid(format!(
                    "source.{key} must be within 1..={MAX_STILL_EDGE}"
                )));
            }
        }
        if self.source.keepalive_secs == 0 {
            return Err(ConfigError::Invalid("source.keepalive_secs must be > 0".into()));
        }
        if self.source.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("source.poll_interval_ms must be > 0".into()));
        }
        if self.capture.frames == 0 {
            tracing::warn!("capture.frames is 0; every trigger will end without frames");
        }
        if self.api.models.is_empty() {
            return Err(ConfigError::Invalid("api.models must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

const DEFAULT_CAMERA_SIDE: u32 = 1080;
/// Largest still edge a JPEG can carry.
const MAX_STILL_EDGE: u32 = 65535;

// Default value functions
fn default_source_kind() -> SourceKind {
    SourceKind::Remote
}
fn default_stream_url() -> String {
    "http://192.168.50.120:8000/".into()
}
fn default_device() -> String {
    "/dev/video0".into()
}
fn default_input_format() -> String {
    "v4l2".into()
}
fn default_jpeg_quality() -> u8 {
    95
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_open_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_frames() -> usize {
    5
}
fn default_interval_ms() -> u64 {
    200
}
fn default_frame_field() -> String {
    "images".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_bind() -> String {
    "127.0.0.1:8080".into()
}
fn default_models() -> Vec<String> {
    vec!["general".into()]
}
fn default_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("0".to_string(), "Non-recyclable".to_string()),
        ("1".to_string(), "Recyclable".to_string()),
    ])
}
fn default_log_level() -> String {
    "info".into()
}
