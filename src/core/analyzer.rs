use crate::common::{BiometricError, Config, Paths, Result};
use crate::core::detector::FaceDetector;
use crate::core::observation::{FaceObservation, FrameObservationSource};
use crate::core::recognizer::FaceRecognizer;
use image::DynamicImage;

/// Detector and recognizer run back to back on each camera frame.
pub struct FaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceAnalyzer {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    pub fn from_config(config: &Config, paths: &Paths) -> Result<Self> {
        let level = config.models.optimization_level;
        let detector = FaceDetector::new(&paths.model_path(&config.models.detector_path), level, &config.detector)?;
        let recognizer =
            FaceRecognizer::new(&paths.model_path(&config.models.recognizer_path), level, &config.recognizer)?;
        Ok(Self::new(detector, recognizer))
    }
}

impl FrameObservationSource for FaceAnalyzer {
    type Frame = DynamicImage;

    fn detect(&mut self, frame: &DynamicImage) -> Result<Vec<FaceObservation>> {
        let detections = self
            .detector
            .detect(frame)
            .map_err(|e| BiometricError::Detector(e.to_string()))?;

        detections
            .iter()
            .map(|detection| {
                let bbox = detection.to_rect();
                let embedding = self
                    .recognizer
                    .embed(frame, &bbox)
                    .map_err(|e| BiometricError::Detector(e.to_string()))?;
                Ok(FaceObservation {
                    bbox,
                    detection_confidence: detection.confidence,
                    embedding,
                    liveness: None,
                })
            })
            .collect()
    }
}
