use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{BiometricError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
    /// Mirror frames horizontally before detection.
    #[serde(default = "default_true")]
    pub mirror: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
            mirror: true,
        }
    }
}

fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 3 }
fn default_warmup_delay() -> u64 { 50 }
fn default_true() -> bool { true }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
    #[serde(default = "default_liveness_path")]
    pub liveness_path: PathBuf,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
            liveness_path: default_liveness_path(),
            optimization_level: default_optimization_level(),
        }
    }
}

fn default_detector_path() -> PathBuf { PathBuf::from("face_detector.onnx") }
fn default_recognizer_path() -> PathBuf { PathBuf::from("face_recognizer.onnx") }
fn default_liveness_path() -> PathBuf { PathBuf::from("anti_spoof_80x80.onnx") }
fn default_optimization_level() -> u32 { 3 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    /// Boxes below this score are dropped before NMS.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            min_score: default_min_score(),
            nms_iou: default_nms_iou(),
            max_faces: default_max_faces(),
        }
    }
}

fn default_detector_input() -> u32 { 640 }
fn default_min_score() -> f32 { 0.3 }
fn default_nms_iou() -> f32 { 0.45 }
fn default_max_faces() -> usize { 5 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_recognizer_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization_value")]
    pub normalization_value: f32,
    /// 1 for single-channel (IR) models, 3 for RGB models.
    #[serde(default = "default_channels")]
    pub channels: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_recognizer_input(),
            normalization_value: default_normalization_value(),
            channels: default_channels(),
        }
    }
}

fn default_recognizer_input() -> u32 { 112 }
fn default_normalization_value() -> f32 { 127.5 }
fn default_channels() -> usize { 3 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_scale")]
    pub crop_scale: f32,
    #[serde(default = "default_liveness_input")]
    pub input_width: u32,
    #[serde(default = "default_liveness_input")]
    pub input_height: u32,
    /// Index of the "real face" class in the classifier output.
    #[serde(default = "default_real_label")]
    pub real_label: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            crop_scale: default_liveness_scale(),
            input_width: default_liveness_input(),
            input_height: default_liveness_input(),
            real_label: default_real_label(),
        }
    }
}

fn default_liveness_scale() -> f32 { 2.7 }
fn default_liveness_input() -> u32 { 80 }
fn default_real_label() -> usize { 1 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_required_frames")]
    pub required_frames: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_time_limit")]
    pub detection_time_limit_secs: u64,
    #[serde(default = "default_similarity_threshold")]
    pub duplicate_threshold: f32,
    #[serde(default)]
    pub reject_multiple_faces: bool,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            required_frames: default_required_frames(),
            confidence_threshold: default_confidence_threshold(),
            frame_interval_ms: default_frame_interval(),
            detection_time_limit_secs: default_time_limit(),
            duplicate_threshold: default_similarity_threshold(),
            reject_multiple_faces: false,
        }
    }
}

impl EnrollmentConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn detection_time_limit(&self) -> Duration {
        Duration::from_secs(self.detection_time_limit_secs)
    }
}

fn default_required_frames() -> usize { 5 }
fn default_confidence_threshold() -> f32 { 0.6 }
fn default_frame_interval() -> u64 { 500 }
fn default_time_limit() -> u64 { 10 }
fn default_similarity_threshold() -> f32 { 0.5 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerificationConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_frame_interval")]
    pub debounce_interval_ms: u64,
    /// Acceptance needs strictly more hits than this.
    #[serde(default = "default_required_hits")]
    pub required_hits: u32,
    #[serde(default = "default_time_limit")]
    pub detection_time_limit_secs: u64,
    #[serde(default)]
    pub reject_multiple_faces: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            confidence_threshold: default_confidence_threshold(),
            debounce_interval_ms: default_frame_interval(),
            required_hits: default_required_hits(),
            detection_time_limit_secs: default_time_limit(),
            reject_multiple_faces: false,
        }
    }
}

impl VerificationConfig {
    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn detection_time_limit(&self) -> Duration {
        Duration::from_secs(self.detection_time_limit_secs)
    }
}

fn default_required_hits() -> u32 { 2 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FingerprintConfig {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_try_interval")]
    pub try_interval_ms: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: usize,
    #[serde(default = "default_ratio")]
    pub ratio: f32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            try_interval_ms: default_try_interval(),
            settle_delay_ms: default_settle_delay(),
            match_threshold: default_match_threshold(),
            ratio: default_ratio(),
        }
    }
}

fn default_max_tries() -> u32 { 30 }
fn default_try_interval() -> u64 { 600 }
fn default_settle_delay() -> u64 { 1200 }
fn default_match_threshold() -> usize { 15 }
fn default_ratio() -> f32 { 0.8 }

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Overrides the mode-dependent data directory when set.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BiometricError::Other(anyhow::anyhow!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| BiometricError::Other(anyhow::anyhow!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(invalid(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(invalid(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        check_unit("enrollment.confidence_threshold", self.enrollment.confidence_threshold)?;
        check_unit("verification.confidence_threshold", self.verification.confidence_threshold)?;
        check_similarity("enrollment.duplicate_threshold", self.enrollment.duplicate_threshold)?;
        check_similarity("verification.similarity_threshold", self.verification.similarity_threshold)?;

        if self.enrollment.required_frames == 0 {
            return Err(invalid("enrollment.required_frames must be at least 1".to_string()));
        }
        if self.enrollment.detection_time_limit_secs == 0
            || self.verification.detection_time_limit_secs == 0
        {
            return Err(invalid("detection_time_limit_secs must be at least 1".to_string()));
        }

        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(invalid("Detector input dimensions must be non-zero".to_string()));
        }
        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(invalid(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }
        if !matches!(self.recognizer.channels, 1 | 3) {
            return Err(invalid(format!(
                "Recognizer channels must be 1 or 3, got {}", self.recognizer.channels
            )));
        }
        if self.liveness.crop_scale <= 0.0
            || self.liveness.input_width == 0
            || self.liveness.input_height == 0
        {
            return Err(invalid("Liveness crop scale and input size must be positive".to_string()));
        }

        if self.fingerprint.max_tries == 0 {
            return Err(invalid("fingerprint.max_tries must be at least 1".to_string()));
        }
        if self.fingerprint.ratio <= 0.0 || self.fingerprint.ratio > 1.0 {
            return Err(invalid(format!(
                "fingerprint.ratio must be in (0, 1], got {}", self.fingerprint.ratio
            )));
        }

        Ok(())
    }
}

fn invalid(message: String) -> BiometricError {
    BiometricError::InvalidInput(message)
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(format!("{} must be between 0.0 and 1.0, got {}", name, value)));
    }
    Ok(())
}

fn check_similarity(name: &str, value: f32) -> Result<()> {
    if !(-1.0..=1.0).contains(&value) {
        return Err(invalid(format!("{} must be between -1.0 and 1.0, got {}", name, value)));
    }
    Ok(())
}
