//! Point-in-time snapshot of known-person embeddings.

use crate::matcher::{nearest, Metric, Nearest};
use crate::types::PersonEmbedding;

/// Read-only gallery; every vector shares one dimension.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingIndex {
    entries: Vec<PersonEmbedding>,
    dim: Option<usize>,
}

impl EmbeddingIndex {
    /// Build an index, keeping the first entry's dimension and dropping
    /// entries that disagree with it.
    pub fn from_entries(entries: Vec<PersonEmbedding>) -> Self {
        let mut kept = Vec::with_capacity(entries.len());
        let mut dim = None;

        for entry in entries {
            if entry.vector.is_empty() {
                tracing::warn!(person_id = entry.person_id, "skipping empty embedding");
                continue;
            }
            match dim {
                None => dim = Some(entry.dim()),
                Some(d) if d != entry.dim() => {
                    tracing::warn!(
                        person_id = entry.person_id,
                        expected = d,
                        actual = entry.dim(),
                        "skipping embedding with mismatched dimension"
                    );
                    continue;
                }
                Some(_) => {}
            }
            kept.push(entry);
        }

        Self { entries: kept, dim }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Shared vector dimension, `None` for an empty index.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn entries(&self) -> &[PersonEmbedding] {
        &self.entries
    }

    /// Nearest entry to `query` under `metric`.
    pub fn nearest(&self, query: &[f32], metric: Metric) -> Option<(&PersonEmbedding, f32)> {
        let Nearest { index, distance } = nearest(
            query,
            self.entries.iter().map(|e| e.vector.as_slice()),
            metric,
        )?;
        Some((&self.entries[index], distance))
    }
}
