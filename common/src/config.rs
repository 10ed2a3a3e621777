use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub detection: DetectionConfig,
    pub stream: StreamConfig,
    pub snapshots: SnapshotConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// HTTP multipart MJPEG stream.
    Mjpeg,
    /// Directory of still images replayed in file-name order.
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default = "default_source_url")]
    pub url: String,
    #[serde(default = "default_source_path")]
    pub path: String,
    #[serde(default)]
    pub loop_playback: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_min_area_ratio")]
    pub min_area_ratio: f64,
    #[serde(default = "default_persistence_frames")]
    pub persistence_frames: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,
    #[serde(default = "default_bg_learning_rate")]
    pub bg_learning_rate: f32,
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: u8,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: u32,
    #[serde(default = "default_crop_margin")]
    pub crop_margin: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_fps_limit")]
    pub fps_limit: u32,
    #[serde(default = "default_stream_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,
    #[serde(default = "default_snapshot_quality")]
    pub jpeg_quality: u8,
    /// Keep at most this many snapshots on disk. 0 disables retention.
    #[serde(default)]
    pub max_files: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
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
            url: default_source_url(),
            path: default_source_path(),
            loop_playback: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_area_ratio: default_min_area_ratio(),
            persistence_frames: default_persistence_frames(),
            cooldown_secs: default_cooldown_secs(),
            bg_learning_rate: default_bg_learning_rate(),
            diff_threshold: default_diff_threshold(),
            kernel_size: default_kernel_size(),
            crop_margin: default_crop_margin(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps_limit: default_fps_limit(),
            jpeg_quality: default_stream_quality(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            jpeg_quality: default_snapshot_quality(),
            max_files: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
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
        let d = &self.detection;
        if !(d.bg_learning_rate > 0.0 && d.bg_learning_rate < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "detection.bg_learning_rate must be in (0, 1), got {}",
                d.bg_learning_rate
            )));
        }
        if d.persistence_frames == 0 {
            return Err(ConfigError::Invalid(
                "detection.persistence_frames must be at least 1".into(),
            ));
        }
        if d.kernel_size == 0 || d.kernel_size % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "detection.kernel_size must be odd and positive, got {}",
                d.kernel_size
            )));
        }
        if !d.cooldown_secs.is_finite() || d.cooldown_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "detection.cooldown_secs must be a non-negative number, got {}",
                d.cooldown_secs
            )));
        }
        if !(0.0..1.0).contains(&d.min_area_ratio) {
            return Err(ConfigError::Invalid(format!(
                "detection.min_area_ratio must be in [0, 1), got {}",
                d.min_area_ratio
            )));
        }
        if self.stream.fps_limit == 0 {
            return Err(ConfigError::Invalid(
                "stream.fps_limit must be at least 1".into(),
            ));
        }
        for (key, q) in [
            ("stream.jpeg_quality", self.stream.jpeg_quality),
            ("snapshots.jpeg_quality", self.snapshots.jpeg_quality),
        ] {
            if !(1..=100).contains(&q) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be in 1..=100, got {q}"
                )));
            }
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

// Default value functions
fn default_source_kind() -> SourceKind {
    SourceKind::Mjpeg
}
fn default_source_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_source_path() -> String {
    "frames".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_min_area_ratio() -> f64 {
    0.004
}
fn default_persistence_frames() -> u32 {
    3
}
fn default_cooldown_secs() -> f64 {
    6.0
}
fn default_bg_learning_rate() -> f32 {
    0.01
}
fn default_diff_threshold() -> u8 {
    30
}
fn default_kernel_size() -> u32 {
    5
}
fn default_crop_margin() -> u32 {
    10
}
fn default_fps_limit() -> u32 {
    15
}
fn default_stream_quality() -> u8 {
    70
}
fn default_snapshot_dir() -> String {
    "snapshots".into()
}
fn default_snapshot_quality() -> u8 {
    95
}
fn default_bind() -> String {
    "0.0.0.0:8000".into()
}
fn default_log_level() -> String {
    "info".into()
}
