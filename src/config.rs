use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::{AggregatorConfig, DEFAULT_HISTORY_LEN, DEFAULT_HYSTERESIS};
use crate::api::ApiConfig;
use crate::detect::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_TARGET_CLASS};
use crate::ingest::V4l2Config;
use crate::stream::{DEFAULT_BOUNDARY, DEFAULT_JPEG_QUALITY};

const DEFAULT_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct PotholeConfigFile {
    server: Option<ServerConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    aggregator: Option<AggregatorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    boundary: Option<String>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    target_class: Option<String>,
    class_names: Option<Vec<String>>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregatorConfigFile {
    hysteresis_secs: Option<f64>,
    history_len: Option<usize>,
}

/// Which detector backend the daemon registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Stub,
    Tract,
}

impl DetectorKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "tract" => Ok(Self::Tract),
            other => Err(anyhow!(
                "unknown detector backend '{}' (expected 'stub' or 'tract')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PotholeConfig {
    pub addr: String,
    pub boundary: String,
    pub jpeg_quality: u8,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub hysteresis: Duration,
    pub history_len: usize,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    pub target_class: String,
    /// Model class ids in order; id `i` maps to `class_names[i]`.
    /// Defaults to `[target_class]` once all overrides are applied.
    pub class_names: Vec<String>,
    pub input_size: u32,
}

impl PotholeConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("POTHOLE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with the config file path given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        if cfg.detector.class_names.is_empty() {
            cfg.detector.class_names = vec![cfg.detector.target_class.clone()];
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PotholeConfigFile) -> Result<Self> {
        let server = file.server.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let aggregator = file.aggregator.unwrap_or_default();

        let target_class = detector
            .target_class
            .unwrap_or_else(|| DEFAULT_TARGET_CLASS.to_string());
        let hysteresis = match aggregator.hysteresis_secs {
            Some(secs) => hysteresis_from_secs(secs)?,
            None => DEFAULT_HYSTERESIS,
        };
        let backend = match detector.backend.as_deref() {
            Some(name) => DetectorKind::parse(name)?,
            None => DetectorKind::Stub,
        };
        Ok(Self {
            addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            boundary: server
                .boundary
                .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string()),
            jpeg_quality: server.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            camera: CameraSettings {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_CAMERA_FPS),
            },
            detector: DetectorSettings {
                backend,
                model_path: detector.model_path,
                confidence: detector.confidence.unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                class_names: detector.class_names.unwrap_or_default(),
                target_class,
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            },
            hysteresis,
            history_len: aggregator.history_len.unwrap_or(DEFAULT_HISTORY_LEN),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("POTHOLE_ADDR") {
            self.addr = addr;
        }
        if let Some(device) = non_empty_env("POTHOLE_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(width) = non_empty_env("POTHOLE_CAMERA_WIDTH") {
            self.camera.width = parse_env("POTHOLE_CAMERA_WIDTH", &width)?;
        }
        if let Some(height) = non_empty_env("POTHOLE_CAMERA_HEIGHT") {
            self.camera.height = parse_env("POTHOLE_CAMERA_HEIGHT", &height)?;
        }
        if let Some(fps) = non_empty_env("POTHOLE_CAMERA_FPS") {
            self.camera.fps = parse_env("POTHOLE_CAMERA_FPS", &fps)?;
        }
        if let Some(backend) = non_empty_env("POTHOLE_DETECTOR_BACKEND") {
            self.detector.backend = DetectorKind::parse(&backend)?;
        }
        if let Some(path) = non_empty_env("POTHOLE_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(confidence) = non_empty_env("POTHOLE_CONFIDENCE") {
            self.detector.confidence = parse_env("POTHOLE_CONFIDENCE", &confidence)?;
        }
        if let Some(class) = non_empty_env("POTHOLE_TARGET_CLASS") {
            self.detector.target_class = class;
        }
        if let Some(names) = non_empty_env("POTHOLE_CLASS_NAMES") {
            let parsed = split_csv(&names);
            if !parsed.is_empty() {
                self.detector.class_names = parsed;
            }
        }
        if let Some(secs) = non_empty_env("POTHOLE_HYSTERESIS_SECS") {
            let secs: f64 = parse_env("POTHOLE_HYSTERESIS_SECS", &secs)?;
            self.hysteresis = hysteresis_from_secs(secs)?;
        }
        if let Some(len) = non_empty_env("POTHOLE_HISTORY_LEN") {
            self.history_len = parse_env("POTHOLE_HISTORY_LEN", &len)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!(
                "camera resolution must be non-zero (got {}x{})",
                self.camera.width,
                self.camera.height
            ));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1] (got {})",
                self.detector.confidence
            ));
        }
        if self.detector.target_class.trim().is_empty() {
            return Err(anyhow!("target class must not be empty"));
        }
        if self.detector.backend == DetectorKind::Tract && self.detector.model_path.is_none() {
            return Err(anyhow!("tract backend requires a model path"));
        }
        if self.history_len == 0 {
            return Err(anyhow!("history length must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be within 1..=100 (got {})",
                self.jpeg_quality
            ));
        }
        if self.boundary.trim().is_empty() {
            return Err(anyhow!("multipart boundary must not be empty"));
        }
        Ok(())
    }

    pub fn camera_config(&self) -> V4l2Config {
        V4l2Config {
            device: self.camera.device.clone(),
            target_fps: self.camera.fps,
            width: self.camera.width,
            height: self.camera.height,
            frame_limit: None,
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            hysteresis: self.hysteresis,
            history_len: self.history_len,
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.addr.clone(),
            boundary: self.boundary.clone(),
            jpeg_quality: self.jpeg_quality,
        }
    }
}

fn read_config_file(path: &Path) -> Result<PotholeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Rejects negative, non-finite and out-of-range windows.
fn hysteresis_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        anyhow!(
            "hysteresis window must be a non-negative number of seconds (got {})",
            secs
        )
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
