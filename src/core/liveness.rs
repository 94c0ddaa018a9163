use crate::common::config::LivenessConfig;
use crate::common::{BiometricError, Result};
use crate::core::observation::{FaceRect, LivenessGate, LivenessVerdict};
use crate::core::onnx::ModelSession;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::Value;
use std::path::Path;

/// Anti-spoofing classifier over a widened face crop.
pub struct SpoofClassifier {
    model: ModelSession,
    config: LivenessConfig,
}

impl SpoofClassifier {
    pub fn new(model_path: &Path, optimization_level: u32, config: &LivenessConfig) -> Result<Self> {
        let model = ModelSession::load("liveness", model_path, optimization_level)?;
        Ok(Self {
            model,
            config: config.clone(),
        })
    }

    fn scores(&self, frame: &DynamicImage, bbox: &FaceRect) -> Result<Vec<f32>> {
        let region = expand_box(frame.width(), frame.height(), bbox, self.config.crop_scale);
        let crop = frame.crop_imm(
            region.x1 as u32,
            region.y1 as u32,
            region.width().max(1) as u32 + 1,
            region.height().max(1) as u32 + 1,
        );
        let resized = crop.resize_exact(self.config.input_width, self.config.input_height, FilterType::Triangle);

        let input = bgr_array(&resized);
        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.model.session.allocator(), &cow_array)?;
        let outputs = self.model.session.run(vec![input_tensor])?;

        let logits: Vec<f32> = outputs
            .first()
            .ok_or_else(|| BiometricError::Model("liveness model produced no outputs".into()))?
            .try_extract::<f32>()?
            .view()
            .iter()
            .copied()
            .collect();
        Ok(softmax(&logits))
    }
}

impl LivenessGate<DynamicImage> for SpoofClassifier {
    fn classify(&mut self, frame: &DynamicImage, bbox: &FaceRect) -> Result<LivenessVerdict> {
        let scores = self
            .scores(frame, bbox)
            .map_err(|e| BiometricError::Detector(format!("liveness check failed: {}", e)))?;
        let label = argmax(&scores)
            .ok_or_else(|| BiometricError::Detector("liveness model returned no scores".into()))?;

        tracing::debug!("Liveness scores {:?} -> label {}", scores, label);
        Ok(if label == self.config.real_label {
            LivenessVerdict::Real
        } else {
            LivenessVerdict::Fake
        })
    }
}

/// Scale `bbox` around its centre, shrinking the scale so it fits the frame,
/// then shift the result back inside `[0, w-1] x [0, h-1]`.
/// The returned corners are both inclusive.
pub fn expand_box(frame_width: u32, frame_height: u32, bbox: &FaceRect, scale: f32) -> FaceRect {
    let max_x = frame_width.saturating_sub(1) as f32;
    let max_y = frame_height.saturating_sub(1) as f32;
    let box_w = bbox.width().max(1) as f32;
    let box_h = bbox.height().max(1) as f32;

    let scale = scale.min(max_y / box_h).min(max_x / box_w);
    let new_w = box_w * scale;
    let new_h = box_h * scale;
    let cx = bbox.x1 as f32 + box_w / 2.0;
    let cy = bbox.y1 as f32 + box_h / 2.0;

    let mut x1 = cx - new_w / 2.0;
    let mut y1 = cy - new_h / 2.0;
    let mut x2 = cx + new_w / 2.0;
    let mut y2 = cy + new_h / 2.0;

    if x1 < 0.0 {
        x2 -= x1;
        x1 = 0.0;
    }
    if y1 < 0.0 {
        y2 -= y1;
        y1 = 0.0;
    }
    if x2 > max_x {
        x1 -= x2 - max_x;
        x2 = max_x;
    }
    if y2 > max_y {
        y1 -= y2 - max_y;
        y2 = max_y;
    }

    FaceRect::new(
        x1.max(0.0) as i32,
        y1.max(0.0) as i32,
        x2 as i32,
        y2 as i32,
    )
}

/// Raw 0..255 values in BGR channel order.
fn bgr_array(img: &DynamicImage) -> Array4<f32> {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let mut array = Array4::<f32>::zeros((1, 3, height, width));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = pixel[2] as f32;
        array[[0, 1, y, x]] = pixel[1] as f32;
        array[[0, 2, y, x]] = pixel[0] as f32;
    }
    array
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}
