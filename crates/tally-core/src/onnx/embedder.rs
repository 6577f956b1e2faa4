//! ArcFace embedding extractor.

use crate::provider::ProviderError;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
const STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, ProviderError> {
        if !model_path.exists() {
            return Err(ProviderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace embedder");
        Ok(Self { session })
    }

    /// L2-normalized embedding of the face inside `bbox`.
    pub fn extract(&mut self, image: &RgbImage, bbox: &BoundingBox) -> Result<Vec<f32>, ProviderError> {
        let crop = crop_face(image, bbox)
            .ok_or_else(|| ProviderError::InferenceFailed("face box lies outside the image".into()))?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ProviderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ProviderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw))
    }
}

/// Square crop around the box, widened by the margin and resized to the
/// model input. `None` when the box does not intersect the image.
fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let side = bbox.width.max(bbox.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;

    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = (cx - side / 2.0).clamp(0.0, w);
    let y0 = (cy - side / 2.0).clamp(0.0, h);
    let x1 = (cx + side / 2.0).clamp(0.0, w);
    let y1 = (cy + side / 2.0).clamp(0.0, h);

    let cw = (x1 - x0) as u32;
    let ch = (y1 - y0) as u32;
    if cw == 0 || ch == 0 {
        return None;
    }

    let view = imageops::crop_imm(image, x0 as u32, y0 as u32, cw, ch).to_image();
    Some(imageops::resize(&view, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_face_is_model_sized() {
        let image = RgbImage::new(400, 300);
        let bbox = BoundingBox { x: 100.0, y: 50.0, width: 80.0, height: 120.0 };
        let crop = crop_face(&image, &bbox).unwrap();
        assert_eq!(crop.dimensions(), (INPUT_SIZE, INPUT_SIZE));
    }

    #[test]
    fn test_crop_face_outside_image() {
        let image = RgbImage::new(100, 100);
        let bbox = BoundingBox { x: 500.0, y: 500.0, width: 20.0, height: 20.0 };
        assert!(crop_face(&image, &bbox).is_none());
    }

    #[test]
    fn test_preprocess_normalization() {
        let face = RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, image::Rgb([255, 0, 128]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 0.5 / 127.5).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
