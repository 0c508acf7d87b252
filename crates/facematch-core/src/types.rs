use crate::metric::{self, Metric, MetricError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Face embedding vector (128-dimensional for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "FaceNet").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, model_version: impl Into<String>) -> Self {
        self.model_version = Some(model_version.into());
        self
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm of the vector.
    pub fn magnitude(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Every value is finite and the magnitude does not overflow.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite()) && self.magnitude().is_finite()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Unlike a plain dot-product helper this refuses zero-magnitude input
    /// instead of returning 0.0.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, MetricError> {
        metric::cosine_similarity(&self.values, &other.values)
    }

    /// Euclidean distance between two embeddings. Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, MetricError> {
        metric::l2_norm(&self.values, &other.values)
    }

    /// True when both embeddings name a producing model and the names differ.
    pub fn model_mismatch(&self, other: &Embedding) -> bool {
        matches!(
            (&self.model_version, &other.model_version),
            (Some(a), Some(b)) if a != b
        )
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One enrolled sample: a name and the embedding captured for it.
///
/// Several entries may share the same identity; that is how multi-sample
/// enrollment works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
}

impl GalleryEntry {
    pub fn new(identity: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            identity: identity.into(),
            embedding,
            enrolled_at: None,
        }
    }
}

/// Ordered collection of enrolled samples.
///
/// Order has no effect on which identity wins except for ties (first
/// identity encountered wins), but it is preserved across save/load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. No deduplication and no uniqueness check.
    pub fn enroll(&mut self, entry: GalleryEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }

    /// Distinct identities with their sample counts, in order of first appearance.
    pub fn identities(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = Vec::new();
        for entry in &self.entries {
            match out.iter_mut().find(|(name, _)| *name == entry.identity) {
                Some((_, count)) => *count += 1,
                None => out.push((entry.identity.clone(), 1)),
            }
        }
        out
    }

    pub fn samples_for(&self, identity: &str) -> usize {
        self.entries.iter().filter(|e| e.identity == identity).count()
    }

    /// Order-independent equality on `(identity, embedding values)` pairs.
    pub fn same_samples(&self, other: &Gallery) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let key = |e: &GalleryEntry| {
            (
                e.identity.clone(),
                e.embedding.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            )
        };
        let mut left: Vec<_> = self.entries.iter().map(key).collect();
        let mut right: Vec<_> = other.entries.iter().map(key).collect();
        left.sort();
        right.sort();
        left == right
    }
}

impl From<Vec<GalleryEntry>> for Gallery {
    fn from(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }
}

impl FromIterator<GalleryEntry> for Gallery {
    fn from_iter<I: IntoIterator<Item = GalleryEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Outcome identity of a match operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Identity::Unknown)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(name) => f.write_str(name),
            Identity::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Aggregate score of one identity within a single match operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityScore {
    pub identity: String,
    /// Mean of the per-sample scores.
    pub score: f32,
    pub samples: usize,
}

/// Result of matching one query embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchVerdict {
    pub identity: Identity,
    /// Aggregate score of the best identity, `None` when nothing could be scored.
    pub score: Option<f32>,
    pub metric: Metric,
    /// Every identity's aggregate, in order of first appearance in the gallery.
    pub candidates: Vec<IdentityScore>,
    /// Gallery entries that could not be scored and were skipped.
    pub skipped: usize,
}

impl MatchVerdict {
    /// Verdict for a match that had nothing to compare against.
    pub fn unknown(metric: Metric) -> Self {
        Self {
            identity: Identity::Unknown,
            score: None,
            metric,
            candidates: Vec::new(),
            skipped: 0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.identity.is_unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry::new(name, Embedding::new(values.to_vec()))
    }

    #[test]
    fn test_embedding_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_similarity_zero_vector_is_error() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), Err(MetricError::ZeroMagnitude));
    }

    #[test]
    fn test_embedding_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_model_mismatch_only_when_both_known() {
        let a = Embedding::new(vec![1.0]).with_model_version("FaceNet");
        let b = Embedding::new(vec![1.0]).with_model_version("ArcFace");
        let c = Embedding::new(vec![1.0]);
        assert!(a.model_mismatch(&b));
        assert!(!a.model_mismatch(&c));
        assert!(!c.model_mismatch(&a));
        assert!(!a.model_mismatch(&a.clone()));
    }

    #[test]
    fn test_gallery_enroll_does_not_deduplicate() {
        let mut gallery = Gallery::new();
        assert!(gallery.is_empty());
        gallery.enroll(entry("alice", &[1.0, 0.0]));
        gallery.enroll(entry("alice", &[1.0, 0.0]));
        gallery.enroll(entry("bob", &[0.0, 1.0]));
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.samples_for("alice"), 2);
        assert_eq!(
            gallery.identities(),
            vec![("alice".to_string(), 2), ("bob".to_string(), 1)]
        );
    }

    #[test]
    fn test_gallery_same_samples_ignores_order() {
        let a: Gallery = vec![entry("alice", &[1.0]), entry("bob", &[2.0])].into();
        let b: Gallery = vec![entry("bob", &[2.0]), entry("alice", &[1.0])].into();
        let c: Gallery = vec![entry("bob", &[2.0]), entry("alice", &[1.5])].into();
        assert!(a.same_samples(&b));
        assert!(!a.same_samples(&c));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Known("alice".into()).to_string(), "alice");
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn test_verdict_serializes_identity_tag() {
        let verdict = MatchVerdict {
            identity: Identity::Known("alice".into()),
            score: Some(0.5),
            metric: Metric::L2,
            candidates: Vec::new(),
            skipped: 0,
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["identity"]["kind"], "known");
        assert_eq!(json["identity"]["name"], "alice");
        assert_eq!(json["metric"], "l2");
    }
}
