//! Image bytes in, classified [`RecognitionOutcome`] out.

use crate::index::EmbeddingIndex;
use crate::matcher::{confidence_from_distance, Band, MatchThresholds, Metric};
use crate::provider::{FaceProvider, ProviderError};
use crate::types::{EmbeddingResult, RecognitionOutcome};
use std::sync::Arc;

/// Recognition pipeline over an injected [`FaceProvider`].
///
/// Never fails: decode errors and provider errors become
/// [`RecognitionOutcome::Error`].
#[derive(Clone)]
pub struct RecognitionEngine {
    provider: Arc<dyn FaceProvider>,
    thresholds: MatchThresholds,
    metric: Metric,
}

impl RecognitionEngine {
    pub fn new(provider: Arc<dyn FaceProvider>, thresholds: MatchThresholds, metric: Metric) -> Self {
        Self {
            provider,
            thresholds,
            metric,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.provider.is_loaded()
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn thresholds(&self) -> MatchThresholds {
        self.thresholds
    }

    pub async fn recognize(&self, image_bytes: &[u8], index: &EmbeddingIndex) -> RecognitionOutcome {
        if !self.provider.is_loaded() {
            return RecognitionOutcome::error(ProviderError::NotLoaded.to_string());
        }

        let image = match image::load_from_memory(image_bytes) {
            Ok(img) => img,
            Err(e) => return RecognitionOutcome::error(format!("image decode failed: {e}")),
        };

        let result = match self.embed(&image).await {
            Ok(r) => r,
            Err(e) => return RecognitionOutcome::error(e.to_string()),
        };

        if !result.face_detected {
            return RecognitionOutcome::NoFace;
        }

        tracing::debug!(
            quality = result.quality,
            bbox = ?result.bbox,
            dim = result.embedding.len(),
            "face embedded"
        );

        self.classify(&result.embedding, index)
    }

    /// Detect the primary face and embed it.
    pub async fn embed(&self, image: &image::DynamicImage) -> Result<EmbeddingResult, ProviderError> {
        let faces = self.provider.detect_faces(image).await?;
        let Some(face) = faces.first() else {
            return Ok(EmbeddingResult::no_face());
        };

        let embedding = self.provider.extract_embedding(image).await?;

        Ok(EmbeddingResult {
            embedding,
            face_detected: true,
            quality: face.quality,
            bbox: Some(face.bbox),
        })
    }

    /// Match an embedding against the index and band the nearest distance.
    pub fn classify(&self, embedding: &[f32], index: &EmbeddingIndex) -> RecognitionOutcome {
        match index.dim() {
            None => return RecognitionOutcome::Unknown { best_confidence: 0.0 },
            Some(dim) if dim != embedding.len() => {
                return RecognitionOutcome::error(format!(
                    "embedding dimension {} does not match index dimension {dim}",
                    embedding.len()
                ));
            }
            Some(_) => {}
        }

        let Some((person, distance)) = index.nearest(embedding, self.metric) else {
            return RecognitionOutcome::Unknown { best_confidence: 0.0 };
        };
        let confidence = confidence_from_distance(distance);

        match self.thresholds.classify(distance) {
            Band::Match => RecognitionOutcome::Match {
                person_id: person.person_id,
                person_name: person.person_name.clone(),
                confidence,
            },
            Band::LowConfidence => RecognitionOutcome::LowConfidence {
                person_id: person.person_id,
                person_name: person.person_name.clone(),
                confidence,
            },
            Band::Unknown => RecognitionOutcome::Unknown {
                best_confidence: confidence,
            },
        }
    }
}
