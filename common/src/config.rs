use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub main_loop: MainLoopConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// `synthetic` renders a test pattern, `directory` replays JPEG files.
    #[serde(default = "default_camera_driver")]
    pub driver: String,
    #[serde(default)]
    pub frames_dir: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Size of the single reusable capture buffer.
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    /// Longest the inference path waits for the camera.
    #[serde(default = "default_inference_wait_ms")]
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Capacity of the destination buffer handed to the stream producer.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Longest the stream path waits for the camera before yielding nothing.
    #[serde(default = "default_stream_wait_ms")]
    pub wait_ms: u64,
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_max_viewers")]
    pub max_viewers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_backend_path")]
    pub path: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainLoopConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Number of recent predictions kept in memory.
    #[serde(default = "default_history")]
    pub history: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            driver: default_camera_driver(),
            frames_dir: None,
            width: default_width(),
            height: default_height(),
            jpeg_quality: default_jpeg_quality(),
            buffer_bytes: default_buffer_bytes(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            confidence_threshold: default_confidence_threshold(),
            input_width: default_input_size(),
            input_height: default_input_size(),
            labels: default_labels(),
            wait_ms: default_inference_wait_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: default_chunk_bytes(),
            wait_ms: default_stream_wait_ms(),
            retry_ms: default_retry_ms(),
            max_viewers: default_max_viewers(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

impl Default for MainLoopConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            port: default_backend_port(),
            db_path: default_db_path(),
            history: default_history(),
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

impl InferenceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

impl StreamConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

impl BackendConfig {
    /// Full URL of the prediction endpoint, e.g. `http://192.168.1.100:5000/api/prediction`.
    pub fn report_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            self.port,
            self.path.trim_start_matches('/')
        )
    }

    /// Root URL of the collector dashboard.
    pub fn dashboard_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_device_id() -> String {
    "ESP32-CAM-001".into()
}
fn default_camera_driver() -> String {
    "synthetic".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_buffer_bytes() -> usize {
    256 * 1024
}
fn default_interval_ms() -> u64 {
    2000
}
fn default_confidence_threshold() -> f32 {
    0.6
}
fn default_input_size() -> u32 {
    96
}
fn default_labels() -> Vec<String> {
    [
        "battery",
        "biological",
        "cardboard",
        "clothes",
        "glass",
        "metal",
        "paper",
        "plastic",
        "shoe",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_inference_wait_ms() -> u64 {
    500
}
fn default_chunk_bytes() -> usize {
    128 * 1024
}
fn default_stream_wait_ms() -> u64 {
    20
}
fn default_retry_ms() -> u64 {
    30
}
fn default_max_viewers() -> usize {
    2
}
fn default_backend_port() -> u16 {
    5000
}
fn default_backend_path() -> String {
    "/api/prediction".into()
}
fn default_backend_timeout_ms() -> u64 {
    1500
}
fn default_server_port() -> u16 {
    8080
}
fn default_tick_ms() -> u64 {
    10
}
fn default_heartbeat_ms() -> u64 {
    2000
}
fn default_db_path() -> String {
    "data/predictions.db".into()
}
fn default_history() -> usize {
    50
}
fn default_log_level() -> String {
    "info".into()
}
