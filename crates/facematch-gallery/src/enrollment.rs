//! Turning an unknown face into a new gallery entry.
//!
//! After each verdict the workflow remembers the query embedding if the
//! face was unknown. When the user later supplies a name, that embedding is
//! enrolled under it. Persistence is not done here: the outcome tells the
//! host whether the configured [`PersistPolicy`] wants a save now.

use crate::gallery::EmbeddingGallery;
use facematch_core::{Embedding, MatchVerdict};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("no unknown face is waiting to be named")]
    NoPendingFace,
    #[error("embedding has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity must not be blank")]
    BlankIdentity,
    #[error("embedding is all zeros or contains non-finite values")]
    DegenerateEmbedding,
    #[error("unknown persist policy {0:?} (expected \"enroll\" or \"shutdown\")")]
    UnknownPolicy(String),
}

/// When enrolled data is written to the store.
///
/// Either way, enrollments not yet saved are lost if the process dies
/// without reaching a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Save after every successful enrollment (and at shutdown).
    #[default]
    AfterEnroll,
    /// Save only at shutdown.
    OnShutdown,
}

impl FromStr for PersistPolicy {
    type Err = EnrollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enroll" | "after_enroll" | "after-enroll" => Ok(PersistPolicy::AfterEnroll),
            "shutdown" | "on_shutdown" | "on-shutdown" => Ok(PersistPolicy::OnShutdown),
            other => Err(EnrollError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EnrollOutcome {
    /// Name was empty or whitespace; nothing changed.
    RejectedBlankName,
    Enrolled {
        identity: String,
        /// Samples this identity now has in the gallery.
        samples: usize,
        /// Whether the host should persist now.
        persist_now: bool,
    },
}

pub struct EnrollmentWorkflow {
    policy: PersistPolicy,
    embedding_dim: usize,
    pending: Option<Embedding>,
}

impl EnrollmentWorkflow {
    pub fn new(policy: PersistPolicy, embedding_dim: usize) -> Self {
        Self {
            policy,
            embedding_dim,
            pending: None,
        }
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    /// Remember `query` if the verdict was unknown; forget it otherwise.
    pub fn observe(&mut self, verdict: &MatchVerdict, query: &Embedding) {
        self.pending = verdict.is_unknown().then(|| query.clone());
    }

    pub fn pending(&self) -> Option<&Embedding> {
        self.pending.as_ref()
    }

    /// Enroll `embedding` under `name`.
    pub fn enroll(
        &self,
        gallery: &mut EmbeddingGallery,
        name: &str,
        embedding: Embedding,
    ) -> Result<EnrollOutcome, EnrollError> {
        let name = name.trim();
        if name.is_empty() {
            tracing::warn!("enrollment rejected: blank name");
            return Ok(EnrollOutcome::RejectedBlankName);
        }

        if embedding.dim() != self.embedding_dim {
            return Err(EnrollError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: embedding.dim(),
            });
        }
        if !embedding.is_finite() || embedding.magnitude() == 0.0 {
            return Err(EnrollError::DegenerateEmbedding);
        }

        let samples = gallery.enroll(name, embedding)?;
        tracing::info!(identity = name, samples, "enrolled face");

        Ok(EnrollOutcome::Enrolled {
            identity: name.to_string(),
            samples,
            persist_now: self.policy == PersistPolicy::AfterEnroll,
        })
    }

    /// Enroll the remembered unknown face under `name`.
    ///
    /// A blank name leaves the face pending so the user can try again.
    pub fn name_pending(
        &mut self,
        gallery: &mut EmbeddingGallery,
        name: &str,
    ) -> Result<EnrollOutcome, EnrollError> {
        let embedding = self.pending.clone().ok_or(EnrollError::NoPendingFace)?;
        let outcome = self.enroll(gallery, name, embedding)?;
        if matches!(outcome, EnrollOutcome::Enrolled { .. }) {
            self.pending = None;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use facematch_core::{Identity, Metric};
    use std::sync::Arc;

    fn gallery() -> EmbeddingGallery {
        EmbeddingGallery::load(Arc::new(MemoryStore::new())).unwrap()
    }

    fn verdict(identity: Identity) -> MatchVerdict {
        MatchVerdict {
            identity,
            ..MatchVerdict::unknown(Metric::L2)
        }
    }

    #[test]
    fn test_blank_names_are_noops() {
        let workflow = EnrollmentWorkflow::new(PersistPolicy::AfterEnroll, 2);
        let mut g = gallery();
        for name in ["", "   ", "\t\n"] {
            let outcome = workflow.enroll(&mut g, name, Embedding::new(vec![1.0, 0.0])).unwrap();
            assert_eq!(outcome, EnrollOutcome::RejectedBlankName);
        }
        assert!(g.is_empty());
        assert!(!g.has_unsaved_changes());
    }

    #[test]
    fn test_enroll_trims_name_and_requests_persist() {
        let workflow = EnrollmentWorkflow::new(PersistPolicy::AfterEnroll, 2);
        let mut g = gallery();
        let outcome = workflow.enroll(&mut g, "  Alice ", Embedding::new(vec![1.0, 0.0])).unwrap();
        assert_eq!(
            outcome,
            EnrollOutcome::Enrolled {
                identity: "Alice".into(),
                samples: 1,
                persist_now: true
            }
        );
        assert_eq!(g.gallery().entries()[0].identity, "Alice");
    }

    #[test]
    fn test_on_shutdown_policy_defers_persist() {
        let workflow = EnrollmentWorkflow::new(PersistPolicy::OnShutdown, 2);
        let mut g = gallery();
        let outcome = workflow.enroll(&mut g, "Alice", Embedding::new(vec![1.0, 0.0])).unwrap();
        assert!(matches!(outcome, EnrollOutcome::Enrolled { persist_now: false, .. }));
        assert!(g.has_unsaved_changes());
    }

    #[test]
    fn test_enroll_rejects_bad_embeddings() {
        let workflow = EnrollmentWorkflow::new(PersistPolicy::AfterEnroll, 2);
        let mut g = gallery();
        assert_eq!(
            workflow.enroll(&mut g, "Alice", Embedding::new(vec![1.0])),
            Err(EnrollError::DimensionMismatch { expected: 2, actual: 1 })
        );
        assert_eq!(
            workflow.enroll(&mut g, "Alice", Embedding::new(vec![0.0, 0.0])),
            Err(EnrollError::DegenerateEmbedding)
        );
        assert_eq!(
            workflow.enroll(&mut g, "Alice", Embedding::new(vec![f32::NAN, 1.0])),
            Err(EnrollError::DegenerateEmbedding)
        );
        assert_eq!(
            workflow.enroll(&mut g, "Alice", Embedding::new(vec![3e38, 3e38])),
            Err(EnrollError::DegenerateEmbedding)
        );
        assert!(g.is_empty());
    }

    #[test]
    fn test_pending_follows_latest_verdict() {
        let mut workflow = EnrollmentWorkflow::new(PersistPolicy::AfterEnroll, 2);
        let face = Embedding::new(vec![0.5, 0.5]);

        workflow.observe(&verdict(Identity::Unknown), &face);
        assert_eq!(workflow.pending(), Some(&face));

        workflow.observe(&verdict(Identity::Known("Bob".into())), &face);
        assert_eq!(workflow.pending(), None);
    }

    #[test]
    fn test_name_pending_enrolls_remembered_face() {
        let mut workflow = EnrollmentWorkflow::new(PersistPolicy::AfterEnroll, 2);
        let mut g = gallery();
        let face = Embedding::new(vec![0.5, 0.5]);

        assert_eq!(
            workflow.name_pending(&mut g, "Carol"),
            Err(EnrollError::NoPendingFace)
        );

        workflow.observe(&verdict(Identity::Unknown), &face);
        assert_eq!(
            workflow.name_pending(&mut g, " ").unwrap(),
            EnrollOutcome::RejectedBlankName
        );
        assert!(workflow.pending().is_some());

        let outcome = workflow.name_pending(&mut g, "Carol").unwrap();
        assert!(matches!(outcome, EnrollOutcome::Enrolled { samples: 1, .. }));
        assert!(workflow.pending().is_none());
        assert_eq!(g.gallery().entries()[0].embedding, face);
    }

    #[test]
    fn test_persist_policy_from_str() {
        assert_eq!("enroll".parse::<PersistPolicy>().unwrap(), PersistPolicy::AfterEnroll);
        assert_eq!("Shutdown".parse::<PersistPolicy>().unwrap(), PersistPolicy::OnShutdown);
        assert!("never".parse::<PersistPolicy>().is_err());
    }
}
