//! Bounded-concurrency processing of snapshot files.

use crate::clock::Clock;
use crate::gate::AttendanceGate;
use crate::model::AttendanceEvent;
use crate::routing::{Disposition, SnapshotRouter};
use crate::store::{AttendanceStore, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_camera::SnapshotSink;
use tally_core::{EmbeddingIndex, RecognitionEngine, RecognitionOutcome};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to read snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dispatcher is shut down")]
    Closed,
}

/// Result of processing one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub trace_id: String,
    pub outcome: RecognitionOutcome,
    /// Entry recorded for this snapshot, if any.
    pub event: Option<AttendanceEvent>,
    pub disposition: Disposition,
}

/// Snapshot id used in logs and attendance records: the file stem.
pub fn trace_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

struct Inner {
    engine: RecognitionEngine,
    gate: Arc<AttendanceGate>,
    store: Arc<dyn AttendanceStore>,
    router: SnapshotRouter,
    clock: Arc<dyn Clock>,
    permits: Semaphore,
}

/// Runs recognition, attendance and routing for submitted snapshots, at
/// most `max_concurrent` at a time. Extra submissions wait for a slot.
#[derive(Clone)]
pub struct SnapshotDispatcher {
    inner: Arc<Inner>,
    tracker: TaskTracker,
}

impl SnapshotDispatcher {
    pub fn new(
        engine: RecognitionEngine,
        gate: Arc<AttendanceGate>,
        store: Arc<dyn AttendanceStore>,
        router: SnapshotRouter,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                gate,
                store,
                router,
                clock,
                permits: Semaphore::new(max_concurrent.max(1)),
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Queue a snapshot for background processing.
    pub fn submit(&self, path: PathBuf) {
        if self.tracker.is_closed() {
            tracing::warn!(file = %path.display(), "dispatcher shut down, snapshot not queued");
            return;
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = this.process(&path).await {
                tracing::error!(file = %path.display(), error = %e, "snapshot processing failed");
            }
        });
    }

    /// Process one snapshot once a concurrency slot is free.
    pub async fn process(&self, path: &Path) -> Result<SnapshotReport, DispatchError> {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::Closed)?;
        self.process_now(path).await
    }

    async fn process_now(&self, path: &Path) -> Result<SnapshotReport, DispatchError> {
        let inner = &self.inner;
        let trace_id = trace_id_for(path);
        let file = path.display();
        tracing::info!(trace_id = %trace_id, file = %file, "processing snapshot");

        let bytes = tokio::fs::read(path).await.map_err(|source| DispatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.is_empty() {
            tracing::warn!(trace_id = %trace_id, file = %file, "empty snapshot file");
        }

        let entries = inner.store.load_all_active_embeddings().await?;
        if entries.is_empty() {
            tracing::warn!(trace_id = %trace_id, "no employees with embeddings enrolled");
        }
        let index = EmbeddingIndex::from_entries(entries);

        let outcome = inner.engine.recognize(&bytes, &index).await;
        log_outcome(&outcome, &trace_id, path);

        let mut event = None;
        if let RecognitionOutcome::Match {
            person_id,
            confidence,
            ..
        } = &outcome
        {
            event = inner.gate.accept_entry(*person_id, *confidence, &trace_id).await?;
            if event.is_none() {
                return Ok(SnapshotReport {
                    trace_id,
                    outcome,
                    event,
                    disposition: Disposition::Kept,
                });
            }
        }

        let at = event.as_ref().map_or_else(|| inner.clock.utc(), |e| e.timestamp);
        let disposition = match inner.router.route(path, &outcome, at).await {
            Ok(d) => {
                tracing::debug!(trace_id = %trace_id, file = %file, disposition = ?d, "snapshot routed");
                d
            }
            Err(e) => {
                tracing::warn!(trace_id = %trace_id, file = %file, error = %e, "failed to route snapshot");
                Disposition::Kept
            }
        };

        Ok(SnapshotReport {
            trace_id,
            outcome,
            event,
            disposition,
        })
    }

    /// Stop accepting snapshots and wait for queued ones to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        tracing::info!(pending = self.tracker.len(), "draining snapshot dispatcher");
        self.tracker.wait().await;
    }
}

impl SnapshotSink for SnapshotDispatcher {
    fn submit(&self, path: PathBuf) {
        SnapshotDispatcher::submit(self, path);
    }
}

fn log_outcome(outcome: &RecognitionOutcome, trace_id: &str, path: &Path) {
    let file = path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
    match outcome {
        RecognitionOutcome::Match {
            person_id,
            person_name,
            confidence,
        } => tracing::info!(trace_id, %file, employee_id = person_id, employee = %person_name, confidence, "match"),
        RecognitionOutcome::LowConfidence {
            person_id,
            person_name,
            confidence,
        } => tracing::warn!(trace_id, %file, employee_id = person_id, employee = %person_name, confidence, "low-confidence match"),
        RecognitionOutcome::Unknown { best_confidence } => {
            tracing::info!(trace_id, %file, best_confidence, "unknown person")
        }
        RecognitionOutcome::NoFace => tracing::info!(trace_id, %file, "no face detected"),
        RecognitionOutcome::Error { message } => {
            tracing::error!(trace_id, %file, error = %message, "recognition failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::gate::tests::BrokenStore;
    use crate::model::{AttendanceEvent, EventType, NewAttendanceEvent};
    use crate::routing::RoutingPolicy;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use image::{DynamicImage, ImageFormat};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tally_core::{
        BoundingBox, DetectedFace, FaceProvider, MatchThresholds, Metric, PersonEmbedding,
        ProviderError,
    };

    /// Provider with a fixed answer that records how many calls overlap.
    #[derive(Default)]
    struct ScriptedProvider {
        embedding: Option<Vec<f32>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FaceProvider for ScriptedProvider {
        async fn detect_faces(&self, _: &DynamicImage) -> Result<Vec<DetectedFace>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(match self.embedding {
                Some(_) => vec![DetectedFace {
                    bbox: BoundingBox {
                        x: 0.0,
                        y: 0.0,
                        width: 8.0,
                        height: 8.0,
                    },
                    quality: 0.9,
                }],
                None => Vec::new(),
            })
        }
        async fn extract_embedding(&self, _: &DynamicImage) -> Result<Vec<f32>, ProviderError> {
            self.embedding.clone().ok_or(ProviderError::NoFaceDetected)
        }
        async fn quality(&self, _: &DynamicImage) -> Result<f32, ProviderError> {
            Ok(0.9)
        }
        fn is_loaded(&self) -> bool {
            true
        }
        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        gate: Arc<AttendanceGate>,
        dispatcher: SnapshotDispatcher,
    }

    async fn harness(provider: Arc<ScriptedProvider>, max_concurrent: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new());
        let gate = Arc::new(AttendanceGate::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(300),
        ));
        let engine = RecognitionEngine::new(provider, MatchThresholds::default(), Metric::Euclidean);
        let router = SnapshotRouter::new(RoutingPolicy::default(), dir.path().join("recognized"));
        let dispatcher = SnapshotDispatcher::new(
            engine,
            gate.clone(),
            store.clone(),
            router,
            clock,
            max_concurrent,
        );
        Harness {
            dir,
            store,
            gate,
            dispatcher,
        }
    }

    fn write_snapshot(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        DynamicImage::new_rgb8(16, 16)
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        path
    }

    fn matching_provider() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider {
            embedding: Some(vec![0.25, 0.0]),
            ..Default::default()
        })
    }

    #[test]
    fn test_trace_id_is_file_stem() {
        assert_eq!(trace_id_for(Path::new("/x/snapshot_20260302_090000_1.jpg")), "snapshot_20260302_090000_1");
        let generated = trace_id_for(Path::new("/"));
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[tokio::test]
    async fn test_match_records_entry_and_archives() {
        let h = harness(matching_provider(), 5).await;
        let ada = h.store.insert_employee("Ada", true).await.unwrap();
        h.store.insert_embedding(ada, &[0.0, 0.0], "test").await.unwrap();
        let before = h.gate.office_status().await.unwrap().present_count;

        let path = write_snapshot(h.dir.path(), "snap_1.png");
        let report = h.dispatcher.process(&path).await.unwrap();

        assert_eq!(report.trace_id, "snap_1");
        assert_eq!(
            report.outcome,
            RecognitionOutcome::Match {
                person_id: ada,
                person_name: "Ada".into(),
                confidence: 0.75,
            }
        );
        let event = report.event.unwrap();
        assert_eq!(event.event_type, EventType::Entry);
        assert_eq!(event.trace_id, "snap_1");
        match report.disposition {
            Disposition::Archived(target) => {
                assert!(target.exists());
                assert!(target.file_name().unwrap().to_string_lossy().starts_with(&format!("{ada}_ada_")));
            }
            other => panic!("expected archive, got {other:?}"),
        }
        assert!(!path.exists());

        let office = h.gate.office_status().await.unwrap();
        assert_eq!(office.present_count, before + 1);
    }

    #[tokio::test]
    async fn test_cooldown_rejection_leaves_file_untouched() {
        let h = harness(matching_provider(), 5).await;
        let ada = h.store.insert_employee("Ada", true).await.unwrap();
        h.store.insert_embedding(ada, &[0.0, 0.0], "test").await.unwrap();

        let first = write_snapshot(h.dir.path(), "first.png");
        assert!(h.dispatcher.process(&first).await.unwrap().event.is_some());

        let second = write_snapshot(h.dir.path(), "second.png");
        let report = h.dispatcher.process(&second).await.unwrap();
        assert!(report.event.is_none());
        assert_eq!(report.disposition, Disposition::Kept);
        assert!(second.exists());
    }

    #[tokio::test]
    async fn test_no_face_snapshot_is_deleted() {
        let h = harness(Arc::new(ScriptedProvider::default()), 5).await;
        let path = write_snapshot(h.dir.path(), "empty_hall.png");

        let report = h.dispatcher.process(&path).await.unwrap();
        assert_eq!(report.outcome, RecognitionOutcome::NoFace);
        assert_eq!(report.disposition, Disposition::Deleted);
        assert!(!path.exists());
        assert_eq!(h.gate.office_status().await.unwrap().present_count, 0);
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_is_kept() {
        let h = harness(matching_provider(), 5).await;
        let path = h.dir.path().join("broken.jpg");
        tokio::fs::write(&path, b"not a jpeg").await.unwrap();

        let report = h.dispatcher.process(&path).await.unwrap();
        assert!(matches!(report.outcome, RecognitionOutcome::Error { .. }));
        assert_eq!(report.disposition, Disposition::Kept);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let h = harness(matching_provider(), 5).await;
        let err = h.dispatcher.process(&h.dir.path().join("gone.jpg")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Read { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_snapshot_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn AttendanceStore> = Arc::new(BrokenStore);
        let clock = Arc::new(ManualClock::new());
        let gate = Arc::new(AttendanceGate::new(store.clone(), clock.clone(), Duration::from_secs(300)));
        let engine = RecognitionEngine::new(
            Arc::new(ScriptedProvider::default()),
            MatchThresholds::default(),
            Metric::Euclidean,
        );
        let dispatcher = SnapshotDispatcher::new(
            engine,
            gate,
            store,
            SnapshotRouter::new(RoutingPolicy::default(), dir.path().join("recognized")),
            clock,
            5,
        );

        let path = write_snapshot(dir.path(), "outage.png");
        let err = dispatcher.process(&path).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(_)));
        assert!(path.exists());
    }

    /// Reads from the inner store but cannot write attendance events.
    struct ReadOnlyStore(Arc<SqliteStore>);

    #[async_trait]
    impl AttendanceStore for ReadOnlyStore {
        async fn load_all_active_embeddings(&self) -> Result<Vec<PersonEmbedding>, StoreError> {
            self.0.load_all_active_embeddings().await
        }
        async fn append_attendance_event(
            &self,
            _: NewAttendanceEvent,
        ) -> Result<AttendanceEvent, StoreError> {
            Err(StoreError::Io(std::io::Error::other("database is read-only")))
        }
        async fn latest_event_for(&self, id: i64) -> Result<Option<AttendanceEvent>, StoreError> {
            self.0.latest_event_for(id).await
        }
        async fn latest_event_per_employee(
            &self,
        ) -> Result<HashMap<i64, AttendanceEvent>, StoreError> {
            self.0.latest_event_per_employee().await
        }
        async fn active_employee_count(&self) -> Result<usize, StoreError> {
            self.0.active_employee_count().await
        }
        async fn employee_name(&self, id: i64) -> Result<Option<String>, StoreError> {
            self.0.employee_name(id).await
        }
        async fn employee_names(&self) -> Result<HashMap<i64, String>, StoreError> {
            self.0.employee_names().await
        }
        async fn events_between(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            employee_id: Option<i64>,
        ) -> Result<Vec<AttendanceEvent>, StoreError> {
            self.0.events_between(from, to, employee_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_append_leaves_snapshot_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let ada = sqlite.insert_employee("Ada", true).await.unwrap();
        sqlite.insert_embedding(ada, &[0.0, 0.0], "test").await.unwrap();

        let store: Arc<dyn AttendanceStore> = Arc::new(ReadOnlyStore(sqlite.clone()));
        let clock = Arc::new(ManualClock::new());
        let gate = Arc::new(AttendanceGate::new(store.clone(), clock.clone(), Duration::from_secs(300)));
        let engine = RecognitionEngine::new(matching_provider(), MatchThresholds::default(), Metric::Euclidean);
        let recognized = dir.path().join("recognized");
        let dispatcher = SnapshotDispatcher::new(
            engine,
            gate,
            store,
            SnapshotRouter::new(RoutingPolicy::default(), recognized.clone()),
            clock,
            5,
        );

        let path = write_snapshot(dir.path(), "matched.png");
        let err = dispatcher.process(&path).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::Io(_))));
        assert!(path.exists());
        assert!(!recognized.exists());
        assert!(sqlite.latest_event_for(ada).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let provider = Arc::new(ScriptedProvider {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let h = harness(provider.clone(), 5).await;

        for i in 0..20 {
            h.dispatcher.submit(write_snapshot(h.dir.path(), &format!("s{i}.png")));
        }
        h.dispatcher.shutdown().await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 20);
        let peak = provider.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=5).contains(&peak), "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let provider = Arc::new(ScriptedProvider::default());
        let h = harness(provider.clone(), 1).await;
        h.dispatcher.shutdown().await;

        let path = write_snapshot(h.dir.path(), "late.png");
        SnapshotSink::submit(&h.dispatcher, path.clone());
        h.dispatcher.shutdown().await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(path.exists());
    }
}
