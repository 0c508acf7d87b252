//! Distance and similarity functions over raw embedding vectors.
//!
//! Exactly one [`Metric`] is active per match operation. The metric also
//! owns the direction of "better": L2 distances improve downwards, cosine
//! similarities improve upwards.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("zero-magnitude embedding has no defined cosine similarity")]
    ZeroMagnitude,
    #[error("embedding contains non-finite values")]
    NonFinite,
}

/// Similarity metric used to score a query against gallery samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance. Lower is better.
    #[default]
    L2,
    /// Cosine similarity. Higher is better.
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cosine => "cosine",
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> Result<f32, MetricError> {
        match self {
            Metric::L2 => l2_norm(a, b),
            Metric::Cosine => cosine_similarity(a, b),
        }
    }

    /// Strict "better than" in this metric's direction. Equal scores are not better.
    pub fn is_better(&self, candidate: f32, current: f32) -> bool {
        match self {
            Metric::L2 => candidate < current,
            Metric::Cosine => candidate > current,
        }
    }

    /// Whether an aggregate score clears the acceptance threshold.
    ///
    /// Strict in both directions: a distance equal to the L2 threshold, or a
    /// similarity equal to the cosine threshold, is rejected.
    pub fn accepts(&self, aggregate: f32, threshold: f32) -> bool {
        self.is_better(aggregate, threshold)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            other => Err(ConfigError::UnknownMetric(other.to_string())),
        }
    }
}

fn check_pair(a: &[f32], b: &[f32]) -> Result<(), MetricError> {
    if a.len() != b.len() {
        return Err(MetricError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(MetricError::NonFinite);
    }
    Ok(())
}

/// Euclidean distance `sqrt(Σ (a[i] − b[i])²)`.
pub fn l2_norm(a: &[f32], b: &[f32]) -> Result<f32, MetricError> {
    check_pair(a, b)?;
    let distance = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt();
    // Finite inputs can still overflow the sum.
    if !distance.is_finite() {
        return Err(MetricError::NonFinite);
    }
    Ok(distance)
}

/// Cosine similarity `(a·b) / (‖a‖·‖b‖)`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, MetricError> {
    check_pair(a, b)?;

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !dot.is_finite() || !denom.is_finite() {
        return Err(MetricError::NonFinite);
    }
    if denom > 0.0 {
        // Rounding can push identical vectors a hair past 1.0.
        Ok((dot / denom).clamp(-1.0, 1.0))
    } else {
        Err(MetricError::ZeroMagnitude)
    }
}
