//! ArcFace face embedder via ONNX Runtime.
//!
//! Resizes an RGB face crop to 112x112, runs the w600k_r50 model, and
//! L2-normalizes the 512-dimensional output.

use crate::pipeline::Embedder;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize an RGB crop to 112x112 and normalize into a NCHW tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let resized = imageops::resize(face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedderError::EmptyCrop);
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Widen to f64 and scale to unit length; a zero vector is returned as-is.
fn l2_normalize(raw: &[f32]) -> Vec<f64> {
    let values: Vec<f64> = raw.iter().map(|&v| v as f64).collect();
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        values.iter().map(|v| v / norm).collect()
    } else {
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(40, 60, image::Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_range() {
        let white = ArcFaceEmbedder::preprocess(&RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255])));
        assert_relative_eq!(white[[0, 0, 0, 0]], 1.0, epsilon = 1e-6);

        let black = ArcFaceEmbedder::preprocess(&RgbImage::from_pixel(10, 10, image::Rgb([0, 0, 0])));
        assert_relative_eq!(black[[0, 2, 111, 111]], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let face = RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 0]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert_relative_eq!(tensor[[0, 0, 50, 50]], 1.0, epsilon = 1e-6);
        assert_relative_eq!(tensor[[0, 1, 50, 50]], -1.0, epsilon = 1e-6);
        assert_relative_eq!(tensor[[0, 2, 50, 50]], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert_relative_eq!(v[0], 0.6, epsilon = 1e-9);
        assert_relative_eq!(v[1], 0.8, epsilon = 1e-9);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(&[0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
    }
}
