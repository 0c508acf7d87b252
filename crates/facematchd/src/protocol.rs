//! JSON-lines request/response protocol spoken on stdin/stdout.

use crate::engine::{EngineError, EngineHandle, MatchOutcome};
use facematch_core::Embedding;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Match {
        embedding: Vec<f32>,
        #[serde(default)]
        model_version: Option<String>,
    },
    Enroll {
        name: String,
        /// Absent: name the last unknown face.
        #[serde(default)]
        embedding: Option<Vec<f32>>,
    },
    Persist,
    Status,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

pub fn error_response(op: &str, message: impl std::fmt::Display) -> Value {
    json!({ "op": op, "error": message.to_string() })
}

/// Handle one request and build its response line.
pub async fn respond(handle: &EngineHandle, request: Request) -> Value {
    match request {
        Request::Match {
            embedding,
            model_version,
        } => {
            let query = Embedding {
                values: embedding,
                model_version,
            };
            match handle.try_match(query).await {
                Ok(MatchOutcome::Verdict(verdict)) => json!({ "op": "match", "verdict": verdict }),
                Ok(MatchOutcome::Dropped) => json!({ "op": "match", "dropped": true }),
                Err(e) => error_response("match", e),
            }
        }
        Request::Enroll { name, embedding } => {
            match handle.enroll(name, embedding.map(Embedding::new)).await {
                Ok(report) => match report.persist_error {
                    None => json!({ "op": "enroll", "outcome": report.outcome }),
                    Some(e) => json!({
                        "op": "enroll",
                        "outcome": report.outcome,
                        "persist_error": e.to_string(),
                    }),
                },
                Err(e) => error_response("enroll", e),
            }
        }
        Request::Persist => match handle.persist().await {
            Ok(written) => json!({ "op": "persist", "written": written }),
            Err(e) => error_response("persist", e),
        },
        Request::Status => match handle.status().await {
            Ok(status) => json!({ "op": "status", "status": status }),
            Err(e) => error_response("status", e),
        },
    }
}

/// Final checkpoint before exit. In-flight matches answer first.
pub async fn shutdown(handle: &EngineHandle, in_flight: &mut JoinSet<()>) -> Result<(), EngineError> {
    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "match task failed");
        }
    }
    if handle.persist().await? {
        tracing::info!("gallery persisted at shutdown");
    }
    Ok(())
}
