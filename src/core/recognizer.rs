use crate::common::config::RecognizerConfig;
use crate::common::{BiometricError, Result};
use crate::core::matcher::{l2_normalize, Embedding};
use crate::core::observation::FaceRect;
use crate::core::onnx::ModelSession;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::Value;
use std::path::Path;

pub struct FaceRecognizer {
    model: ModelSession,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    pub fn new(model_path: &Path, optimization_level: u32, config: &RecognizerConfig) -> Result<Self> {
        let model = ModelSession::load("face_recognizer", model_path, optimization_level)?;
        Ok(Self {
            model,
            config: config.clone(),
        })
    }

    /// Unit-length embedding of the face inside `face`.
    pub fn embed(&self, image: &DynamicImage, face: &FaceRect) -> Result<Embedding> {
        let crop = crop_face(image, face);
        let size = self.config.input_size;
        let resized = crop.resize_exact(size, size, FilterType::Triangle);

        let input = preprocess(&resized, self.config.channels, self.config.normalization_value);
        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.model.session.allocator(), &cow_array)?;
        let outputs = self.model.session.run(vec![input_tensor])?;

        let mut embedding = outputs
            .first()
            .ok_or_else(|| BiometricError::Model("recognizer produced no outputs".into()))?
            .try_extract::<f32>()?
            .view()
            .iter()
            .copied()
            .collect::<Vec<f32>>();

        if embedding.is_empty() {
            return Err(BiometricError::Model("recognizer returned an empty embedding".into()));
        }
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

/// Crop clamped to the image; degenerate boxes become a 1x1 crop.
pub fn crop_face(image: &DynamicImage, face: &FaceRect) -> DynamicImage {
    let max_x = image.width().saturating_sub(1) as i32;
    let max_y = image.height().saturating_sub(1) as i32;
    let x = face.x1.clamp(0, max_x);
    let y = face.y1.clamp(0, max_y);
    let width = (face.x2.min(image.width() as i32) - x).max(1) as u32;
    let height = (face.y2.min(image.height() as i32) - y).max(1) as u32;

    image.crop_imm(x as u32, y as u32, width, height)
}

/// `(p - norm) / norm` per channel; RGB for three channels, luma for one.
fn preprocess(img: &DynamicImage, channels: usize, norm: f32) -> Array4<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let mut array = Array4::<f32>::zeros((1, channels, height, width));

    if channels == 1 {
        for (x, y, pixel) in img.to_luma8().enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm) / norm;
        }
    } else {
        for (x, y, pixel) in img.to_rgb8().enumerate_pixels() {
            for c in 0..3 {
                array[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - norm) / norm;
            }
        }
    }

    array
}
