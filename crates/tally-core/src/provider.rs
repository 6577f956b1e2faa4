//! Detection/embedding capability consumed by the recognition engine.

use crate::types::{BoundingBox, DetectedFace};
use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face provider not loaded")]
    NotLoaded,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detection and embedding extraction for decoded images.
///
/// Implementations are selected once at startup and shared behind an `Arc`.
#[async_trait]
pub trait FaceProvider: Send + Sync {
    /// Faces in the image, best first.
    async fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, ProviderError>;

    /// Embedding of the primary face.
    async fn extract_embedding(&self, image: &DynamicImage) -> Result<Vec<f32>, ProviderError>;

    /// Quality of the primary face in [0, 1].
    async fn quality(&self, image: &DynamicImage) -> Result<f32, ProviderError>;

    fn is_loaded(&self) -> bool;

    fn name(&self) -> &'static str;
}

const MOCK_EMBEDDING_DIM: usize = 128;
const MOCK_EMBEDDING_VALUE: f32 = 0.1;
const MOCK_QUALITY: f32 = 0.85;

/// Model-free provider: every image holds one centered face with a fixed
/// embedding. Useful for wiring tests and deployments without models.
#[derive(Debug, Clone)]
pub struct MockFaceProvider {
    embedding: Vec<f32>,
}

impl Default for MockFaceProvider {
    fn default() -> Self {
        Self {
            embedding: vec![MOCK_EMBEDDING_VALUE; MOCK_EMBEDDING_DIM],
        }
    }
}

impl MockFaceProvider {
    pub fn with_embedding(embedding: Vec<f32>) -> Self {
        Self { embedding }
    }
}

#[async_trait]
impl FaceProvider for MockFaceProvider {
    async fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(vec![DetectedFace {
            bbox: BoundingBox {
                x: w * 0.25,
                y: h * 0.25,
                width: w * 0.5,
                height: h * 0.5,
            },
            quality: MOCK_QUALITY,
        }])
    }

    async fn extract_embedding(&self, _image: &DynamicImage) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embedding.clone())
    }

    async fn quality(&self, _image: &DynamicImage) -> Result<f32, ProviderError> {
        Ok(MOCK_QUALITY)
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
