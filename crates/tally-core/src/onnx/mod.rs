//! ONNX Runtime provider: SCRFD detection plus ArcFace embeddings.
//!
//! Sessions need exclusive access while running, so each model sits behind
//! a mutex and inference is moved onto tokio's blocking pool.

mod detector;
mod embedder;

pub use detector::ScrfdDetector;
pub use embedder::ArcFaceEmbedder;

use crate::provider::{FaceProvider, ProviderError};
use crate::types::DetectedFace;
use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

pub struct OnnxFaceProvider {
    detector: Arc<Mutex<ScrfdDetector>>,
    embedder: Arc<Mutex<ArcFaceEmbedder>>,
}

impl OnnxFaceProvider {
    /// Load both models from `model_dir`. Fails fast when either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let detector = ScrfdDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let embedder = ArcFaceEmbedder::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector: Arc::new(Mutex::new(detector)),
            embedder: Arc::new(Mutex::new(embedder)),
        })
    }

    async fn detect_rgb(&self, image: RgbImage) -> Result<(RgbImage, Vec<DetectedFace>), ProviderError> {
        let detector = Arc::clone(&self.detector);
        tokio::task::spawn_blocking(move || {
            let mut detector = detector
                .lock()
                .map_err(|_| ProviderError::InferenceFailed("detector lock poisoned".into()))?;
            let faces = detector.detect(&image)?;
            Ok((image, faces))
        })
        .await
        .map_err(|e| ProviderError::InferenceFailed(format!("detector task: {e}")))?
    }
}

#[async_trait]
impl FaceProvider for OnnxFaceProvider {
    async fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let (_, faces) = self.detect_rgb(image.to_rgb8()).await?;
        Ok(faces)
    }

    async fn extract_embedding(&self, image: &DynamicImage) -> Result<Vec<f32>, ProviderError> {
        let (rgb, faces) = self.detect_rgb(image.to_rgb8()).await?;
        let face = faces.into_iter().next().ok_or(ProviderError::NoFaceDetected)?;

        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || {
            let mut embedder = embedder
                .lock()
                .map_err(|_| ProviderError::InferenceFailed("embedder lock poisoned".into()))?;
            embedder.extract(&rgb, &face.bbox)
        })
        .await
        .map_err(|e| ProviderError::InferenceFailed(format!("embedder task: {e}")))?
    }

    async fn quality(&self, image: &DynamicImage) -> Result<f32, ProviderError> {
        let faces = self.detect_faces(image).await?;
        Ok(faces.first().map(|f| f.quality).unwrap_or(0.0))
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}
