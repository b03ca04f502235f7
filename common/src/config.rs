use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_quality")]
    pub quality: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default = "default_reference_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_reference_count")]
    pub count: usize,
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_tiles")]
    pub tiles_x: u32,
    #[serde(default = "default_tiles")]
    pub tiles_y: u32,
    #[serde(default = "default_clip_limit")]
    pub clip_limit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,
    #[serde(default = "default_ratio_threshold")]
    pub ratio_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            dir: default_reference_dir(),
            count: default_reference_count(),
            capture_interval_ms: default_capture_interval_ms(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            tiles_x: default_tiles(),
            tiles_y: default_tiles(),
            clip_limit: default_clip_limit(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: default_pixel_threshold(),
            ratio_threshold: default_ratio_threshold(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
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
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reference.count == 0 {
            return Err(ConfigError::Invalid("reference.count must be at least 1".into()));
        }
        if self.normalizer.tiles_x == 0 || self.normalizer.tiles_y == 0 {
            return Err(ConfigError::Invalid("normalizer tile grid must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.detector.ratio_threshold) {
            return Err(ConfigError::Invalid(
                "detector.ratio_threshold must lie in [0, 1]".into(),
            ));
        }
        let fps = self.camera.fps;
        if !(fps.is_finite() && fps > 0.0 && fps <= MAX_FPS) {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be a finite rate in (0, {MAX_FPS}], got {fps}"
            )));
        }
        Ok(())
    }
}

/// Upper bound on the capture rate; keeps the polling period at 1 ms or more.
const MAX_FPS: f64 = 1000.0;

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
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_quality() -> u32 {
    80
}
fn default_reference_dir() -> PathBuf {
    PathBuf::from("./reference/")
}
fn default_reference_count() -> usize {
    10
}
fn default_capture_interval_ms() -> u64 {
    200
}
fn default_tiles() -> u32 {
    8
}
fn default_clip_limit() -> f64 {
    2.0
}
fn default_pixel_threshold() -> u8 {
    25
}
fn default_ratio_threshold() -> f64 {
    0.02
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
