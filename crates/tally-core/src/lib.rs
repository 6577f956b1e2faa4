//! tally-core: Face matching and recognition for attendance tracking.
//!
//! Compares a snapshot's face embedding against a gallery of known people
//! and classifies the nearest match into confidence bands. Detection and
//! embedding extraction are consumed through the [`FaceProvider`] capability.

pub mod engine;
pub mod index;
pub mod matcher;
pub mod onnx;
pub mod provider;
pub mod types;

pub use engine::RecognitionEngine;
pub use index::EmbeddingIndex;
pub use matcher::{MatchThresholds, Metric};
pub use onnx::OnnxFaceProvider;
pub use provider::{FaceProvider, MockFaceProvider, ProviderError};
pub use types::{
    BoundingBox, DetectedFace, EmbeddingResult, PersonEmbedding, RecognitionOutcome,
    RecognitionStatus,
};
