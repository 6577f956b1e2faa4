use serde::{Deserialize, Serialize};

/// Face region reported by a detector, in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A face found by the detection capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub quality: f32,
}

/// Embedding of a single known person, as loaded from persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonEmbedding {
    pub person_id: i64,
    pub person_name: String,
    pub vector: Vec<f32>,
}

impl PersonEmbedding {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// What the provider pipeline produced for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
    pub face_detected: bool,
    pub quality: f32,
    pub bbox: Option<BoundingBox>,
}

impl EmbeddingResult {
    pub fn no_face() -> Self {
        Self {
            embedding: Vec::new(),
            face_detected: false,
            quality: 0.0,
            bbox: None,
        }
    }
}

/// Classified result of matching one snapshot against the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Match {
        person_id: i64,
        person_name: String,
        confidence: f32,
    },
    LowConfidence {
        person_id: i64,
        person_name: String,
        confidence: f32,
    },
    Unknown {
        best_confidence: f32,
    },
    NoFace,
    Error {
        message: String,
    },
}

impl RecognitionOutcome {
    pub fn status(&self) -> RecognitionStatus {
        match self {
            Self::Match { .. } => RecognitionStatus::Match,
            Self::LowConfidence { .. } => RecognitionStatus::LowConfidence,
            Self::Unknown { .. } => RecognitionStatus::Unknown,
            Self::NoFace => RecognitionStatus::NoFace,
            Self::Error { .. } => RecognitionStatus::Error,
        }
    }

    /// Confidence carried by the outcome, 0.0 where there is none.
    pub fn confidence(&self) -> f32 {
        match self {
            Self::Match { confidence, .. } | Self::LowConfidence { confidence, .. } => *confidence,
            Self::Unknown { best_confidence } => *best_confidence,
            Self::NoFace | Self::Error { .. } => 0.0,
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Flat status tag of a [`RecognitionOutcome`], as stored with attendance events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    Match,
    LowConfidence,
    Unknown,
    NoFace,
    Error,
}

impl RecognitionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::LowConfidence => "low_confidence",
            Self::Unknown => "unknown",
            Self::NoFace => "no_face",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "match" => Some(Self::Match),
            "low_confidence" => Some(Self::LowConfidence),
            "unknown" => Some(Self::Unknown),
            "no_face" => Some(Self::NoFace),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecognitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
