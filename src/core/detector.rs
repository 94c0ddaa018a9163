use crate::common::config::DetectorConfig;
use crate::common::{BiometricError, Result};
use crate::core::observation::FaceRect;
use crate::core::onnx::ModelSession;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::Value;
use std::path::Path;

/// Raw detector box in model-input or frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl Detection {
    pub fn to_rect(&self) -> FaceRect {
        FaceRect::new(
            self.x1.floor() as i32,
            self.y1.floor() as i32,
            self.x2.ceil() as i32,
            self.y2.ceil() as i32,
        )
    }
}

pub struct FaceDetector {
    model: ModelSession,
    config: DetectorConfig,
}

impl FaceDetector {
    pub fn new(model_path: &Path, optimization_level: u32, config: &DetectorConfig) -> Result<Self> {
        let model = ModelSession::load("face_detector", model_path, optimization_level)?;
        Ok(Self {
            model,
            config: config.clone(),
        })
    }

    /// Detect faces, returning boxes in the coordinates of `image`, best first.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;
        let (input_width, input_height) = (self.config.input_width, self.config.input_height);

        let input = if image.width() == input_width && image.height() == input_height {
            image_to_array(image)
        } else {
            let resized = image.resize_exact(input_width, input_height, FilterType::Nearest);
            image_to_array(&resized)
        };

        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.model.session.allocator(), &cow_array)?;
        let outputs = self.model.session.run(vec![input_tensor])?;

        let output = outputs
            .first()
            .ok_or_else(|| BiometricError::Detector("detector produced no outputs".into()))?
            .try_extract::<f32>()?
            .view()
            .to_owned();
        let shape = output.shape().to_vec();
        let values = output
            .as_slice()
            .ok_or_else(|| BiometricError::Detector("detector output is not contiguous".into()))?;

        let candidates = decode_predictions(values, &shape, input_width as f32, input_height as f32);
        let mut faces = non_max_suppression(candidates, self.config.nms_iou);
        faces.retain(|face| face.confidence >= self.config.min_score);
        faces.truncate(self.config.max_faces);

        let scale_x = orig_width / input_width as f32;
        let scale_y = orig_height / input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        tracing::debug!("Detected {} face(s)", faces.len());
        Ok(faces)
    }
}

/// Grayscale replicated into three channels, scaled to 0..1.
fn image_to_array(img: &DynamicImage) -> Array4<f32> {
    let gray = img.to_luma8();
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    let mut array = Array4::<f32>::zeros((1, 3, height, width));

    for (x, y, pixel) in gray.enumerate_pixels() {
        let value = pixel[0] as f32 / 255.0;
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = value;
        array[[0, 1, y, x]] = value;
        array[[0, 2, y, x]] = value;
    }

    array
}

/// Decode YOLO-style predictions `[cx, cy, w, h, score]`, accepting both the
/// `[1, N, 5]` and the transposed `[1, 5, N]` layouts.
pub fn decode_predictions(values: &[f32], shape: &[usize], input_width: f32, input_height: f32) -> Vec<Detection> {
    let (count, length, transposed) = match shape {
        [_, a, b] if b > a && *a <= 10 => (*b, *a, true),
        [_, a, b] => (*a, *b, false),
        [a, b] => (*a, *b, false),
        _ => {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Vec::new();
        }
    };
    if length < 5 || values.len() < count * length {
        return Vec::new();
    }

    let at = |i: usize, field: usize| {
        if transposed {
            values[field * count + i]
        } else {
            values[i * length + field]
        }
    };

    let mut detections = Vec::new();
    for i in 0..count {
        let (cx, cy, w, h, confidence) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3), at(i, 4));
        if confidence <= 0.001 {
            continue;
        }

        // Some exports emit normalized coordinates.
        let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 { 1.0 } else { input_width };
        let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(input_width);
        let y2 = (cy + h / 2.0).min(input_height);

        if x2 - x1 > 10.0 && y2 - y1 > 10.0 {
            detections.push(Detection { x1, y1, x2, y2, confidence });
        }
    }
    detections
}

pub fn non_max_suppression(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
        Detection { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn nms_drops_overlapping_weaker_boxes() {
        let boxes = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.7),
            det(5.0, 5.0, 105.0, 105.0, 0.9),
            det(300.0, 300.0, 400.0, 400.0, 0.5),
        ];
        let kept = non_max_suppression(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.5);
    }

    #[test]
    fn decodes_both_layouts() {
        // Two predictions, the second below the score floor.
        let standard = [320.0, 240.0, 100.0, 120.0, 0.9, 10.0, 10.0, 50.0, 50.0, 0.0];
        let found = decode_predictions(&standard, &[1, 2, 5], 640.0, 640.0);
        assert_eq!(found, vec![det(270.0, 180.0, 370.0, 300.0, 0.9)]);

        // Transposed output needs more predictions than fields to be recognised.
        let mut rows = vec![[0.0f32; 5]; 8];
        rows[0] = [320.0, 240.0, 100.0, 120.0, 0.9];
        let transposed: Vec<f32> = (0..5).flat_map(|field| rows.iter().map(move |row| row[field])).collect();
        let found_t = decode_predictions(&transposed, &[1, 5, 8], 640.0, 640.0);
        assert_eq!(found_t, found);
    }

    #[test]
    fn normalized_coordinates_are_scaled() {
        let values = [0.5, 0.5, 0.25, 0.25, 0.8];
        let found = decode_predictions(&values, &[1, 1, 5], 640.0, 640.0);
        assert_eq!(found, vec![det(240.0, 240.0, 400.0, 400.0, 0.8)]);
    }

    #[test]
    fn rect_covers_fractional_box() {
        let rect = det(10.4, 20.6, 50.2, 60.9, 0.9).to_rect();
        assert_eq!(rect, FaceRect::new(10, 20, 51, 61));
    }
}
