use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = "rigcam_data";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8650";
const DEFAULT_CAMERA_URI: &str = "stub://bench_camera";
const DEFAULT_CAMERA_FPS: u32 = 15;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_RETENTION_MAX_AGE_SECS: u64 = 600;
const DEFAULT_RETENTION_SWEEP_SECS: u64 = 60;
const DEFAULT_SENSOR_CADENCE_MS: u64 = 2_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2_000;

/// Default channel columns of the bench sensor rig.
pub const DEFAULT_SENSOR_CHANNELS: [&str; 9] = [
    "Thermistor1",
    "Thermistor2",
    "Thermistor3",
    "Thermistor4",
    "Thermistor5",
    "Thermistor6",
    "Thermistor7",
    "Thermistor8",
    "Thermocouple",
];

#[derive(Debug, Deserialize, Default)]
struct RigcamConfigFile {
    data_dir: Option<String>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    retention: Option<RetentionConfigFile>,
    sensor: Option<SensorConfigFile>,
    annotations: Option<AnnotationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    uri: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    max_age_seconds: Option<u64>,
    sweep_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SensorConfigFile {
    channels: Option<Vec<String>>,
    cadence_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationConfigFile {
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RigcamConfig {
    /// Directory holding session artifacts (video + sensor logs).
    pub data_dir: PathBuf,
    pub api_addr: String,
    pub camera: CameraSettings,
    pub retention: RetentionSettings,
    pub sensor: SensorSettings,
    /// Cadence of the annotation batcher's merge pass.
    pub annotation_flush_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Device URI: `stub://...` for the synthetic source, otherwise a V4L2
    /// device path (requires the `ingest-v4l2` feature).
    pub uri: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SensorSettings {
    /// Channel column names between `Timestamp` and `Comment`.
    pub channels: Vec<String>,
    /// Interval between appended sensor rows.
    pub cadence: Duration,
}

impl RigcamConfig {
    /// Load from the file named by `RIGCAM_CONFIG` (if set), apply `RIGCAM_*`
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RIGCAM_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as [`load`](Self::load) but with an explicit config path taking
    /// precedence over `RIGCAM_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RigcamConfigFile) -> Self {
        let data_dir = PathBuf::from(
            file.data_dir
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
        );
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let camera = CameraSettings {
            uri: file
                .camera
                .as_ref()
                .and_then(|camera| camera.uri.clone())
                .unwrap_or_else(|| DEFAULT_CAMERA_URI.to_string()),
            target_fps: file
                .camera
                .as_ref()
                .and_then(|camera| camera.target_fps)
                .unwrap_or(DEFAULT_CAMERA_FPS),
            width: file
                .camera
                .as_ref()
                .and_then(|camera| camera.width)
                .unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: file
                .camera
                .as_ref()
                .and_then(|camera| camera.height)
                .unwrap_or(DEFAULT_CAMERA_HEIGHT),
        };
        let retention = RetentionSettings {
            max_age: Duration::from_secs(
                file.retention
                    .as_ref()
                    .and_then(|retention| retention.max_age_seconds)
                    .unwrap_or(DEFAULT_RETENTION_MAX_AGE_SECS),
            ),
            sweep_interval: Duration::from_secs(
                file.retention
                    .and_then(|retention| retention.sweep_seconds)
                    .unwrap_or(DEFAULT_RETENTION_SWEEP_SECS),
            ),
        };
        let sensor = SensorSettings {
            channels: file
                .sensor
                .as_ref()
                .and_then(|sensor| sensor.channels.clone())
                .unwrap_or_else(default_channels),
            cadence: Duration::from_millis(
                file.sensor
                    .and_then(|sensor| sensor.cadence_ms)
                    .unwrap_or(DEFAULT_SENSOR_CADENCE_MS),
            ),
        };
        let annotation_flush_interval = Duration::from_millis(
            file.annotations
                .and_then(|annotations| annotations.flush_interval_ms)
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
        );
        Self {
            data_dir,
            api_addr,
            camera,
            retention,
            sensor,
            annotation_flush_interval,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("RIGCAM_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(addr) = std::env::var("RIGCAM_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(uri) = std::env::var("RIGCAM_CAMERA_URI") {
            if !uri.trim().is_empty() {
                self.camera.uri = uri;
            }
        }
        if let Ok(channels) = std::env::var("RIGCAM_SENSOR_CHANNELS") {
            let parsed = split_csv(&channels);
            if !parsed.is_empty() {
                self.sensor.channels = parsed;
            }
        }
        if let Ok(max_age) = std::env::var("RIGCAM_RETENTION_MAX_AGE_SECS") {
            let seconds: u64 = max_age.parse().map_err(|_| {
                anyhow!("RIGCAM_RETENTION_MAX_AGE_SECS must be an integer number of seconds")
            })?;
            self.retention.max_age = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.target_fps == 0 {
            return Err(anyhow!("camera target_fps must be at least 1"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        if self.retention.max_age.as_secs() == 0 {
            return Err(anyhow!("retention max_age must be greater than zero"));
        }
        if self.retention.sweep_interval.as_secs() == 0 {
            return Err(anyhow!("retention sweep interval must be greater than zero"));
        }
        if self.annotation_flush_interval.is_zero() {
            return Err(anyhow!("annotation flush interval must be greater than zero"));
        }
        if self.sensor.cadence.is_zero() {
            return Err(anyhow!("sensor cadence must be greater than zero"));
        }
        if self.sensor.channels.is_empty() {
            return Err(anyhow!("at least one sensor channel must be configured"));
        }
        for channel in &self.sensor.channels {
            if channel.trim().is_empty() || channel.contains(',') {
                return Err(anyhow!("invalid sensor channel name '{}'", channel));
            }
        }
        Ok(())
    }
}

impl Default for RigcamConfig {
    fn default() -> Self {
        Self::from_file(RigcamConfigFile::default())
    }
}

fn default_channels() -> Vec<String> {
    DEFAULT_SENSOR_CHANNELS
        .iter()
        .map(|channel| channel.to_string())
        .collect()
}

fn read_config_file(path: &Path) -> Result<RigcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
