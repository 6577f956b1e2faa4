//! Distance metrics, distance-to-confidence mapping and outcome banding.

use serde::{Deserialize, Serialize};

/// Distance function used to compare embeddings.
///
/// One engine uses exactly one metric; distances from different metrics are
/// not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// L2 distance.
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
}

impl Metric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Euclidean => euclidean_distance(a, b),
            Self::Cosine => 1.0 - cosine_similarity(a, b),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Self::Euclidean),
            "cosine" => Ok(Self::Cosine),
            other => Err(format!("unknown metric: {other}")),
        }
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Cosine similarity in [-1, 1]; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// `1 - distance`, clamped to [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Distance bands separating match, low-confidence and unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    /// Largest distance still classified as a match.
    pub match_distance: f32,
    /// Largest distance classified as low-confidence.
    pub low_confidence_distance: f32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            match_distance: 0.40,
            low_confidence_distance: 0.60,
        }
    }
}

/// Band a distance falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Match,
    LowConfidence,
    Unknown,
}

impl MatchThresholds {
    /// Boundary distances resolve to the better band.
    pub fn classify(&self, distance: f32) -> Band {
        if distance <= self.match_distance {
            Band::Match
        } else if distance <= self.low_confidence_distance {
            Band::LowConfidence
        } else {
            Band::Unknown
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.match_distance.is_finite() || self.match_distance < 0.0 {
            return Err(format!("match_distance must be finite and >= 0, got {}", self.match_distance));
        }
        if !self.low_confidence_distance.is_finite() {
            return Err(format!(
                "low_confidence_distance must be finite, got {}",
                self.low_confidence_distance
            ));
        }
        if self.match_distance > self.low_confidence_distance {
            return Err(format!(
                "match_distance ({}) must not exceed low_confidence_distance ({})",
                self.match_distance, self.low_confidence_distance
            ));
        }
        Ok(())
    }
}

/// Nearest stored embedding to a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    /// Position in the gallery slice.
    pub index: usize,
    pub distance: f32,
}

/// Scan the whole gallery and keep the minimum distance.
///
/// Exact ties keep the first entry encountered.
pub fn nearest<'a, I>(query: &[f32], gallery: I, metric: Metric) -> Option<Nearest>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut best: Option<Nearest> = None;

    for (index, candidate) in gallery.into_iter().enumerate() {
        let distance = metric.distance(query, candidate);
        let better = match best {
            None => true,
            Some(prev) => distance < prev.distance,
        };
        if better {
            best = Some(Nearest { index, distance });
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert_eq!(euclidean_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_identical_orthogonal_zero() {
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_metric_distance() {
        let d = Metric::Cosine.distance(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(confidence_from_distance(0.0), 1.0);
        assert_eq!(confidence_from_distance(0.25), 0.75);
        assert_eq!(confidence_from_distance(1.0), 0.0);
        assert_eq!(confidence_from_distance(1.7), 0.0);
        assert_eq!(confidence_from_distance(-0.1), 1.0);
    }

    #[test]
    fn test_confidence_monotonically_decreasing() {
        let mut prev = f32::INFINITY;
        for step in 0..=150 {
            let c = confidence_from_distance(step as f32 * 0.01);
            assert!(c <= prev);
            prev = c;
        }
    }

    #[test]
    fn test_classify_bands() {
        let t = MatchThresholds::default();
        assert_eq!(t.classify(0.0), Band::Match);
        assert_eq!(t.classify(0.25), Band::Match);
        assert_eq!(t.classify(0.41), Band::LowConfidence);
        assert_eq!(t.classify(0.59), Band::LowConfidence);
        assert_eq!(t.classify(0.61), Band::Unknown);
        assert_eq!(t.classify(3.0), Band::Unknown);
    }

    #[test]
    fn test_classify_boundaries_resolve_to_better_band() {
        let t = MatchThresholds::default();
        assert_eq!(t.classify(0.40), Band::Match);
        assert_eq!(t.classify(0.60), Band::LowConfidence);
    }

    #[test]
    fn test_classify_uses_configured_thresholds() {
        let t = MatchThresholds {
            match_distance: 0.3,
            low_confidence_distance: 0.35,
        };
        assert_eq!(t.classify(0.32), Band::LowConfidence);
        assert_eq!(t.classify(0.40), Band::Unknown);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let t = MatchThresholds {
            match_distance: 0.7,
            low_confidence_distance: 0.6,
        };
        assert!(t.validate().is_err());
        assert!(MatchThresholds::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_finite_thresholds() {
        for (match_distance, low_confidence_distance) in [
            (0.6, f32::NAN),
            (0.6, f32::INFINITY),
            (f32::NAN, 0.7),
            (f32::INFINITY, f32::INFINITY),
        ] {
            let t = MatchThresholds {
                match_distance,
                low_confidence_distance,
            };
            assert!(t.validate().is_err(), "{t:?} should be rejected");
        }
    }

    #[test]
    fn test_nearest_scans_entire_gallery() {
        let gallery: Vec<Vec<f32>> = vec![vec![0.0, 1.0], vec![0.0, 0.5], vec![1.0, 0.0]];
        let best = nearest(&[1.0, 0.0], gallery.iter().map(Vec::as_slice), Metric::Euclidean)
            .unwrap();
        assert_eq!(best.index, 2);
        assert_eq!(best.distance, 0.0);
    }

    #[test]
    fn test_nearest_tie_keeps_first() {
        let gallery: Vec<Vec<f32>> = vec![vec![0.0, 1.0], vec![0.0, -1.0]];
        let best = nearest(&[0.0, 0.0], gallery.iter().map(Vec::as_slice), Metric::Euclidean)
            .unwrap();
        assert_eq!(best.index, 0);
    }

    #[test]
    fn test_nearest_empty_gallery() {
        let gallery: Vec<Vec<f32>> = Vec::new();
        assert!(nearest(&[1.0], gallery.iter().map(Vec::as_slice), Metric::Euclidean).is_none());
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Euclidean".parse::<Metric>(), Ok(Metric::Euclidean));
        assert_eq!("cosine".parse::<Metric>(), Ok(Metric::Cosine));
        assert!("manhattan".parse::<Metric>().is_err());
    }
}
