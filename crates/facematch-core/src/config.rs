use crate::metric::Metric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown metric {0:?} (expected \"l2\" or \"cosine\")")]
    UnknownMetric(String),
    #[error("unknown model {0:?} (expected \"facenet\" or \"facenet-quantized\")")]
    UnknownModel(String),
    #[error("embedding dimension must be non-zero")]
    InvalidDimension,
    #[error("{name} threshold must be finite, got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },
}

/// Embedding model description with its calibrated acceptance thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub file_name: &'static str,
    pub cosine_threshold: f32,
    pub l2_threshold: f32,
    /// Length of the embedding vector the model emits.
    pub embedding_dim: usize,
    /// Side length of the square face crop the model consumes.
    pub input_dim: usize,
}

pub const FACENET: ModelInfo = ModelInfo {
    name: "FaceNet",
    file_name: "face_net.tflite",
    cosine_threshold: 0.4,
    l2_threshold: 10.0,
    embedding_dim: 128,
    input_dim: 160,
};

pub const FACENET_QUANTIZED: ModelInfo = ModelInfo {
    name: "FaceNet Quantized",
    file_name: "face_net_int_quantized.tflite",
    cosine_threshold: 0.4,
    l2_threshold: 10.0,
    embedding_dim: 128,
    input_dim: 160,
};

impl ModelInfo {
    /// Look up a preset by its short key (`facenet`, `facenet-quantized`).
    pub fn by_key(key: &str) -> Result<&'static ModelInfo, ConfigError> {
        match key.trim().to_ascii_lowercase().as_str() {
            "facenet" => Ok(&FACENET),
            "facenet-quantized" | "facenet_quantized" => Ok(&FACENET_QUANTIZED),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

/// Everything the matcher needs to turn scores into a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub metric: Metric,
    /// Aggregate similarity must be strictly greater than this to accept.
    pub cosine_threshold: f32,
    /// Aggregate distance must be strictly less than this to accept.
    pub l2_threshold: f32,
    pub embedding_dim: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self::for_model(&FACENET, Metric::L2)
    }
}

impl MatcherConfig {
    pub fn for_model(model: &ModelInfo, metric: Metric) -> Self {
        Self {
            metric,
            cosine_threshold: model.cosine_threshold,
            l2_threshold: model.l2_threshold,
            embedding_dim: model.embedding_dim,
        }
    }

    /// Threshold that applies to the active metric.
    pub fn threshold(&self) -> f32 {
        match self.metric {
            Metric::L2 => self.l2_threshold,
            Metric::Cosine => self.cosine_threshold,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::InvalidDimension);
        }
        if !self.cosine_threshold.is_finite() {
            return Err(ConfigError::InvalidThreshold {
                name: "cosine",
                value: self.cosine_threshold,
            });
        }
        if !self.l2_threshold.is_finite() {
            return Err(ConfigError::InvalidThreshold {
                name: "l2",
                value: self.l2_threshold,
            });
        }
        Ok(())
    }
}
