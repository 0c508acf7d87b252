//! Identity matching: score a query against every gallery sample, average
//! the scores per identity, then accept or reject the best identity against
//! the configured threshold.
//!
//! All intermediate state lives in a [`ScoreAccumulator`] created for one
//! match and dropped at the end of it, so nothing leaks between queries.

use crate::config::{ConfigError, MatcherConfig};
use crate::gate::MatchPhase;
use crate::metric::{Metric, MetricError};
use crate::types::{Embedding, Gallery, GalleryEntry, Identity, IdentityScore, MatchVerdict};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("query has {actual} dimensions, matcher expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("degenerate query embedding: {0}")]
    DegenerateQuery(MetricError),
}

/// Per-identity buckets of raw scores for a single match operation.
///
/// Buckets keep the order in which identities were first seen; that order
/// decides ties.
#[derive(Debug, Default)]
pub struct ScoreAccumulator {
    buckets: Vec<(String, Vec<f32>)>,
    index: HashMap<String, usize>,
    skipped: usize,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, identity: &str, score: f32) {
        match self.index.get(identity) {
            Some(&i) => self.buckets[i].1.push(score),
            None => {
                self.index.insert(identity.to_string(), self.buckets.len());
                self.buckets.push((identity.to_string(), vec![score]));
            }
        }
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Arithmetic mean per identity, one entry per distinct identity.
    pub fn aggregate(self) -> Vec<IdentityScore> {
        self.buckets
            .into_iter()
            .filter(|(_, scores)| !scores.is_empty())
            .map(|(identity, scores)| {
                let sum: f64 = scores.iter().map(|&s| f64::from(s)).sum();
                IdentityScore {
                    identity,
                    score: (sum / scores.len() as f64) as f32,
                    samples: scores.len(),
                }
            })
            .collect()
    }
}

/// Reject queries that can never be scored: wrong length, non-finite
/// values or magnitude, or zero magnitude under cosine.
pub fn validate_query(
    query: &Embedding,
    config: &MatcherConfig,
) -> Result<(), MatchError> {
    if query.dim() != config.embedding_dim {
        return Err(MatchError::DimensionMismatch {
            expected: config.embedding_dim,
            actual: query.dim(),
        });
    }
    if !query.is_finite() {
        return Err(MatchError::DegenerateQuery(MetricError::NonFinite));
    }
    if config.metric == Metric::Cosine && query.magnitude() == 0.0 {
        return Err(MatchError::DegenerateQuery(MetricError::ZeroMagnitude));
    }
    Ok(())
}

/// Score the query against every entry. Entries that cannot be scored are
/// logged and skipped.
pub fn score(query: &Embedding, entries: &[GalleryEntry], metric: Metric) -> ScoreAccumulator {
    let mut acc = ScoreAccumulator::new();

    for (i, entry) in entries.iter().enumerate() {
        if query.model_mismatch(&entry.embedding) {
            tracing::warn!(
                index = i,
                identity = %entry.identity,
                query_model = ?query.model_version,
                entry_model = ?entry.embedding.model_version,
                "skipping gallery entry from a different model"
            );
            acc.skip();
            continue;
        }

        match metric.score(&query.values, &entry.embedding.values) {
            Ok(s) => acc.push(&entry.identity, s),
            Err(e) => {
                tracing::warn!(
                    index = i,
                    identity = %entry.identity,
                    error = %e,
                    "skipping malformed gallery entry"
                );
                acc.skip();
            }
        }
    }

    acc
}

/// Pick the best aggregate and apply the threshold.
///
/// Ties go to the identity that appears first in `aggregates`.
pub fn decide(aggregates: Vec<IdentityScore>, config: &MatcherConfig, skipped: usize) -> MatchVerdict {
    let metric = config.metric;

    let mut best: Option<&IdentityScore> = None;
    for candidate in &aggregates {
        best = match best {
            Some(current) if !metric.is_better(candidate.score, current.score) => Some(current),
            _ => Some(candidate),
        };
    }

    let (identity, score) = match best {
        Some(b) if metric.accepts(b.score, config.threshold()) => {
            (Identity::Known(b.identity.clone()), Some(b.score))
        }
        Some(b) => (Identity::Unknown, Some(b.score)),
        None => (Identity::Unknown, None),
    };

    MatchVerdict {
        identity,
        score,
        metric,
        candidates: aggregates,
        skipped,
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn identify(&self, query: &Embedding, gallery: &Gallery) -> Result<MatchVerdict, MatchError>;
}

/// Mean-per-identity ("cluster") matcher.
///
/// An identity enrolled several times contributes one aggregate score, the
/// mean of its per-sample scores, rather than its single best sample.
#[derive(Debug, Clone)]
pub struct ClusterMatcher {
    config: MatcherConfig,
}

impl ClusterMatcher {
    pub fn new(config: MatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Run one match, reporting each phase transition to `on_phase`.
    pub fn identify_observed(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        mut on_phase: impl FnMut(MatchPhase),
    ) -> Result<MatchVerdict, MatchError> {
        let metric = self.config.metric;

        // Nothing to compare against; also avoids an empty aggregate below.
        if gallery.is_empty() {
            tracing::debug!("gallery is empty; verdict unknown");
            return Ok(MatchVerdict::unknown(metric));
        }

        validate_query(query, &self.config)?;

        on_phase(MatchPhase::Scoring);
        let acc = score(query, gallery.entries(), metric);
        let skipped = acc.skipped();

        on_phase(MatchPhase::Aggregating);
        let aggregates = acc.aggregate();
        tracing::debug!(
            metric = %metric,
            aggregates = ?aggregates.iter().map(|a| (&a.identity, a.score)).collect::<Vec<_>>(),
            skipped,
            "aggregate score per identity"
        );

        on_phase(MatchPhase::Deciding);
        let verdict = decide(aggregates, &self.config, skipped);
        tracing::info!(
            identity = %verdict.identity,
            score = ?verdict.score,
            metric = %metric,
            "identified"
        );
        Ok(verdict)
    }
}

impl Matcher for ClusterMatcher {
    fn identify(&self, query: &Embedding, gallery: &Gallery) -> Result<MatchVerdict, MatchError> {
        self.identify_observed(query, gallery, |_| {})
    }
}
