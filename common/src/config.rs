use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Settings for the capture subprocess.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Executable that writes an MJPEG byte stream to stdout.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Appended verbatim after the built-in arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Settings for frame extraction and the consumer side.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Multipart boundary token used by the continuous stream.
    #[serde(default = "default_boundary")]
    pub boundary: String,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Accumulator bound; past this the extractor discards what it holds.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    /// How long the capture process gets to exit after SIGTERM.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            frame_timeout_ms: default_frame_timeout_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            max_pending_bytes: default_max_pending_bytes(),
            read_chunk_bytes: default_read_chunk_bytes(),
            stop_grace_ms: default_stop_grace_ms(),
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

impl StreamConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::ReadFile(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Apply `CAM_*` / `FRAME_CAST_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unset keys leave the
    /// current value alone.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CAM_WIDTH") {
            self.camera.width = parse_env("CAM_WIDTH", &v)?;
        }
        if let Some(v) = lookup("CAM_HEIGHT") {
            self.camera.height = parse_env("CAM_HEIGHT", &v)?;
        }
        if let Some(v) = lookup("CAM_FPS") {
            self.camera.fps = parse_env("CAM_FPS", &v)?;
        }
        if let Some(v) = lookup("CAM_COMMAND") {
            self.camera.command = v;
        }
        if let Some(v) = lookup("FRAME_CAST_PORT") {
            self.server.port = parse_env("FRAME_CAST_PORT", &v)?;
        }
        if let Some(v) = lookup("FRAME_CAST_LOG") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid("camera width and height must be non-zero".into()));
        }
        if self.camera.fps == 0 {
            return Err(ConfigError::Invalid("camera fps must be non-zero".into()));
        }
        if self.camera.command.trim().is_empty() {
            return Err(ConfigError::Invalid("camera command must not be empty".into()));
        }
        if self.stream.boundary.is_empty() {
            return Err(ConfigError::Invalid("stream boundary must not be empty".into()));
        }
        if self.stream.max_pending_bytes == 0 || self.stream.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid("stream buffer sizes must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env(key.to_string(), value.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value for {0}: {1:?}")]
    Env(String, String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5001
}
fn default_command() -> String {
    "rpicam-vid".into()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_fps() -> u32 {
    30
}
fn default_boundary() -> String {
    "frame".into()
}
fn default_frame_timeout_ms() -> u64 {
    2000
}
fn default_snapshot_timeout_ms() -> u64 {
    3000
}
fn default_max_pending_bytes() -> usize {
    2_000_000
}
fn default_read_chunk_bytes() -> usize {
    64 * 1024
}
fn default_stop_grace_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".into()
}
