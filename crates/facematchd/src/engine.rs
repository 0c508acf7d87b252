use facematch_core::{
    ClusterMatcher, Embedding, MatchError, MatchGate, MatchPermit, MatchVerdict, MatcherConfig,
};
use facematch_gallery::{
    EmbeddingGallery, EnrollError, EnrollOutcome, EnrollmentWorkflow, FileStore, GallerySnapshot,
    GalleryStore, PersistPolicy, StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid matcher configuration: {0}")]
    Config(#[from] facematch_core::ConfigError),
    #[error("match failed: {0}")]
    Match(#[from] MatchError),
    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),
    #[error("gallery store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("persist task panicked: {0}")]
    PersistTask(#[from] tokio::task::JoinError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of submitting a query.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Verdict(MatchVerdict),
    /// Another match was in flight; this query was discarded.
    Dropped,
}

/// Result of an enrollment request.
///
/// Once the engine has appended the entry it stays enrolled, so a failed
/// save is reported next to the outcome rather than replacing it.
#[derive(Debug)]
pub struct EnrollReport {
    pub outcome: EnrollOutcome,
    pub persist_error: Option<EngineError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub samples: usize,
}

/// Snapshot of engine state for status requests.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub matcher: MatcherConfig,
    pub persist_policy: PersistPolicy,
    pub store: String,
    pub entries: usize,
    pub identities: Vec<IdentitySummary>,
    pub unsaved_changes: bool,
    pub pending_unknown: bool,
    pub match_in_flight: bool,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Match {
        query: Embedding,
        permit: MatchPermit,
        reply: oneshot::Sender<Result<MatchVerdict, MatchError>>,
    },
    Enroll {
        name: String,
        /// `None` enrolls the face from the last unknown verdict.
        embedding: Option<Embedding>,
        reply: oneshot::Sender<Result<EnrollOutcome, EnrollError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<GallerySnapshot>>,
    },
    MarkPersisted {
        generation: u64,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gate: MatchGate,
    store: Arc<dyn GalleryStore>,
    text_dump: Option<FileStore>,
    persist_lock: Arc<Mutex<()>>,
}

impl EngineHandle {
    /// Submit a query. Dropped without queueing if a match is already running.
    pub async fn try_match(&self, query: Embedding) -> Result<MatchOutcome, EngineError> {
        let Some(permit) = self.gate.try_begin() else {
            tracing::debug!("match in flight; dropping query");
            return Ok(MatchOutcome::Dropped);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Match {
                query,
                permit,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let verdict = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(MatchOutcome::Verdict(verdict))
    }

    /// Enroll `embedding` (or the pending unknown face) under `name`, then
    /// persist if the policy asks for it.
    pub async fn enroll(
        &self,
        name: String,
        embedding: Option<Embedding>,
    ) -> Result<EnrollReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                name,
                embedding,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let outcome = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;

        let mut persist_error = None;
        if let EnrollOutcome::Enrolled {
            identity,
            persist_now: true,
            ..
        } = &outcome
        {
            if let Err(e) = self.persist().await {
                tracing::error!(identity = %identity, error = %e, "enrolled but failed to persist gallery");
                persist_error = Some(e);
            }
        }
        Ok(EnrollReport {
            outcome,
            persist_error,
        })
    }

    /// Checkpoint: write the current gallery to the store.
    ///
    /// The snapshot is taken on the engine thread; the write itself runs on
    /// the blocking pool so matching never waits on I/O. Returns `false` if
    /// there was nothing new to write.
    pub async fn persist(&self) -> Result<bool, EngineError> {
        let _guard = self.persist_lock.lock().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let Some(snapshot) = reply_rx.await.map_err(|_| EngineError::ChannelClosed)? else {
            return Ok(false);
        };

        let store = Arc::clone(&self.store);
        let text_dump = self.text_dump.clone();
        let generation = snapshot.generation;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            snapshot.persist(store.as_ref())?;
            if let Some(dump) = text_dump {
                dump.export_text_dump(&snapshot.gallery)?;
            }
            Ok(())
        })
        .await??;

        self.tx
            .send(EngineRequest::MarkPersisted { generation })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(true)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn gate(&self) -> &MatchGate {
        &self.gate
    }
}

/// Spawn the engine on a dedicated OS thread that owns the gallery.
///
/// The engine thread is the only writer: matches and enrollments are
/// handled one at a time, so an enrollment can never land mid-match.
/// `text_dump` enables the debug text export after each save.
pub fn spawn_engine(
    matcher_config: MatcherConfig,
    gallery: EmbeddingGallery,
    policy: PersistPolicy,
    text_dump: Option<FileStore>,
) -> Result<EngineHandle, EngineError> {
    let matcher = ClusterMatcher::new(matcher_config)?;
    let store = gallery.store();
    let gate = MatchGate::new();

    tracing::info!(
        metric = %matcher.config().metric,
        threshold = matcher.config().threshold(),
        embedding_dim = matcher.config().embedding_dim,
        entries = gallery.len(),
        "engine configured"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);
    let status_gate = gate.clone();
    let store_name = store.describe();

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut gallery = gallery;
            let mut workflow = EnrollmentWorkflow::new(policy, matcher.config().embedding_dim);

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Match {
                        query,
                        permit,
                        reply,
                    } => {
                        let result = matcher.identify_observed(&query, gallery.gallery(), |phase| {
                            permit.advance(phase)
                        });
                        if let Ok(verdict) = &result {
                            workflow.observe(verdict, &query);
                        }
                        // Reopen the gate before the caller sees the verdict.
                        drop(permit);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll {
                        name,
                        embedding,
                        reply,
                    } => {
                        let result = match embedding {
                            Some(e) => workflow.enroll(&mut gallery, &name, e),
                            None => workflow.name_pending(&mut gallery, &name),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Snapshot { reply } => {
                        let snapshot = gallery.has_unsaved_changes().then(|| gallery.snapshot());
                        let _ = reply.send(snapshot);
                    }
                    EngineRequest::MarkPersisted { generation } => {
                        gallery.mark_persisted(generation);
                    }
                    EngineRequest::Status { reply } => {
                        let status = EngineStatus {
                            version: env!("CARGO_PKG_VERSION"),
                            matcher: matcher.config().clone(),
                            persist_policy: workflow.policy(),
                            store: store_name.clone(),
                            entries: gallery.len(),
                            identities: gallery
                                .gallery()
                                .identities()
                                .into_iter()
                                .map(|(identity, samples)| IdentitySummary { identity, samples })
                                .collect(),
                            unsaved_changes: gallery.has_unsaved_changes(),
                            pending_unknown: workflow.pending().is_some(),
                            match_in_flight: status_gate.is_busy(),
                        };
                        let _ = reply.send(status);
                    }
                }
            }
            if gallery.has_unsaved_changes() {
                tracing::warn!("engine thread exiting with unsaved enrollments");
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        gate,
        store,
        text_dump,
        persist_lock: Arc::new(Mutex::new(())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facematch_core::{Gallery, Identity, Metric, MetricError};
    use facematch_gallery::{LoadSource, MemoryStore};

    fn config() -> MatcherConfig {
        MatcherConfig {
            metric: Metric::L2,
            cosine_threshold: 0.4,
            l2_threshold: 10.0,
            embedding_dim: 2,
        }
    }

    fn engine(store: Arc<MemoryStore>, policy: PersistPolicy) -> EngineHandle {
        let gallery = EmbeddingGallery::load(store).unwrap();
        spawn_engine(config(), gallery, policy, None).unwrap()
    }

    fn verdict(outcome: MatchOutcome) -> MatchVerdict {
        match outcome {
            MatchOutcome::Verdict(v) => v,
            MatchOutcome::Dropped => panic!("query was dropped"),
        }
    }

    #[tokio::test]
    async fn test_unknown_then_enroll_then_known() {
        let store = Arc::new(MemoryStore::new());
        let handle = engine(store.clone(), PersistPolicy::AfterEnroll);
        let face = Embedding::new(vec![1.0, 2.0]);

        let v = verdict(handle.try_match(face.clone()).await.unwrap());
        assert!(v.is_unknown());

        let report = handle.enroll("Alice".into(), None).await.unwrap();
        assert!(matches!(report.outcome, EnrollOutcome::Enrolled { samples: 1, .. }));
        assert!(report.persist_error.is_none());

        let v = verdict(handle.try_match(face).await.unwrap());
        assert_eq!(v.identity, Identity::Known("Alice".into()));

        // AfterEnroll persisted already.
        let reloaded = EmbeddingGallery::load(store).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_query_dropped_while_match_in_flight() {
        let handle = engine(Arc::new(MemoryStore::new()), PersistPolicy::AfterEnroll);
        let permit = handle.gate().try_begin().unwrap();
        let outcome = handle.try_match(Embedding::new(vec![1.0, 0.0])).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Dropped));
        drop(permit);

        let outcome = handle.try_match(Embedding::new(vec![1.0, 0.0])).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Verdict(_)));
        assert!(!handle.gate().is_busy());
    }

    #[tokio::test]
    async fn test_on_shutdown_policy_persists_only_on_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let handle = engine(store.clone(), PersistPolicy::OnShutdown);

        handle
            .enroll("Bob".into(), Some(Embedding::new(vec![0.0, 1.0])))
            .await
            .unwrap();
        assert!(store.blob().is_none());
        assert!(handle.status().await.unwrap().unsaved_changes);

        assert!(handle.persist().await.unwrap());
        assert!(store.blob().is_some());
        assert!(!handle.status().await.unwrap().unsaved_changes);

        // Nothing new: no write.
        assert!(!handle.persist().await.unwrap());
    }

    #[tokio::test]
    async fn test_enroll_without_pending_face_fails() {
        let handle = engine(Arc::new(MemoryStore::new()), PersistPolicy::AfterEnroll);
        let result = handle.enroll("Carol".into(), None).await;
        assert!(matches!(
            result,
            Err(EngineError::Enroll(EnrollError::NoPendingFace))
        ));
    }

    #[tokio::test]
    async fn test_blank_name_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let handle = engine(store.clone(), PersistPolicy::AfterEnroll);
        let report = handle
            .enroll("  ".into(), Some(Embedding::new(vec![0.0, 1.0])))
            .await
            .unwrap();
        assert_eq!(report.outcome, EnrollOutcome::RejectedBlankName);
        assert_eq!(handle.status().await.unwrap().entries, 0);
        assert!(store.blob().is_none());
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch_is_reported() {
        let handle = engine(Arc::new(MemoryStore::new()), PersistPolicy::AfterEnroll);
        handle
            .enroll("Bob".into(), Some(Embedding::new(vec![0.0, 1.0])))
            .await
            .unwrap();
        let result = handle.try_match(Embedding::new(vec![1.0, 2.0, 3.0])).await;
        assert!(matches!(
            result,
            Err(EngineError::Match(MatchError::DimensionMismatch { .. }))
        ));
        // The gate is released even when the match fails.
        assert!(!handle.gate().is_busy());
    }

    #[tokio::test]
    async fn test_zero_magnitude_query_under_cosine_is_reported() {
        let gallery = EmbeddingGallery::load(Arc::new(MemoryStore::new())).unwrap();
        let cosine = MatcherConfig {
            metric: Metric::Cosine,
            ..config()
        };
        let handle = spawn_engine(cosine, gallery, PersistPolicy::AfterEnroll, None).unwrap();
        handle
            .enroll("Bob".into(), Some(Embedding::new(vec![0.0, 1.0])))
            .await
            .unwrap();
        let result = handle.try_match(Embedding::new(vec![0.0, 0.0])).await;
        assert!(matches!(
            result,
            Err(EngineError::Match(MatchError::DegenerateQuery(MetricError::ZeroMagnitude)))
        ));
        assert!(!handle.gate().is_busy());
    }

    struct FailingStore;

    impl GalleryStore for FailingStore {
        fn load(&self) -> Result<(Gallery, LoadSource), StoreError> {
            Ok((Gallery::default(), LoadSource::Empty))
        }

        fn save(&self, _gallery: &Gallery) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: "/full-disk/gallery.json".into(),
                source: std::io::Error::other("no space left on device"),
            })
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[tokio::test]
    async fn test_failed_persist_still_reports_enrollment() {
        let gallery = EmbeddingGallery::load(Arc::new(FailingStore)).unwrap();
        let handle = spawn_engine(config(), gallery, PersistPolicy::AfterEnroll, None).unwrap();

        let report = handle
            .enroll("Bob".into(), Some(Embedding::new(vec![0.0, 1.0])))
            .await
            .unwrap();
        assert!(matches!(report.outcome, EnrollOutcome::Enrolled { samples: 1, .. }));
        assert!(matches!(report.persist_error, Some(EngineError::Store(_))));

        let status = handle.status().await.unwrap();
        assert_eq!(status.entries, 1);
        assert!(status.unsaved_changes);

        let v = verdict(handle.try_match(Embedding::new(vec![0.0, 1.0])).await.unwrap());
        assert_eq!(v.identity, Identity::Known("Bob".into()));
    }

    #[tokio::test]
    async fn test_status_lists_identities() {
        let handle = engine(Arc::new(MemoryStore::new()), PersistPolicy::OnShutdown);
        for (name, v) in [("Alice", [1.0, 0.0]), ("Bob", [0.0, 1.0]), ("Alice", [0.9, 0.1])] {
            handle
                .enroll(name.into(), Some(Embedding::new(v.to_vec())))
                .await
                .unwrap();
        }
        let status = handle.status().await.unwrap();
        assert_eq!(status.entries, 3);
        assert_eq!(status.identities.len(), 2);
        assert_eq!(status.identities[0].identity, "Alice");
        assert_eq!(status.identities[0].samples, 2);
        assert!(!status.match_in_flight);
    }
}
