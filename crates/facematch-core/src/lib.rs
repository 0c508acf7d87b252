//! facematch-core: Face identity matching engine.
//!
//! Scores a query embedding against a gallery of enrolled samples using L2
//! distance or cosine similarity, averages per identity, and decides between
//! the best identity and "unknown" with a calibrated threshold.

pub mod config;
pub mod gate;
pub mod matcher;
pub mod metric;
pub mod types;

pub use config::{ConfigError, MatcherConfig, ModelInfo, FACENET, FACENET_QUANTIZED};
pub use gate::{MatchGate, MatchPermit, MatchPhase};
pub use matcher::{ClusterMatcher, MatchError, Matcher, ScoreAccumulator};
pub use metric::{Metric, MetricError};
pub use types::{Embedding, Gallery, GalleryEntry, Identity, IdentityScore, MatchVerdict};
