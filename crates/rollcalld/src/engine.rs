use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use rollcall_core::catalog::IdentityInfo;
use rollcall_core::{
    match_faces, AttendanceReport, CatalogError, EmbedError, EmbeddingStore, EnrollError,
    EnrollRequest, Enrolled, Enrollment, EuclideanMatcher, FaceEmbedder, MatchResult, Pose,
    QueryFace,
};
use rollcall_ledger::{AttendanceRecord, Ledger, LedgerError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests queued ahead of the engine thread before senders wait.
const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("enrollment error: {0}")]
    Enroll(#[from] EnrollError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One enrolled identity as listed to callers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub poses: Vec<Pose>,
}

/// Owns every stateful collaborator. Runs on a single thread, so all ledger
/// appends and enrollment writes from this process are serialized.
pub struct Engine {
    embedder: Box<dyn FaceEmbedder + Send>,
    store: EmbeddingStore,
    enrollment: Enrollment,
    ledger: Box<dyn Ledger>,
    threshold: f32,
}

impl Engine {
    pub fn new(
        embedder: Box<dyn FaceEmbedder + Send>,
        enroll_dir: PathBuf,
        ledger: Box<dyn Ledger>,
        threshold: f32,
    ) -> Self {
        Self {
            embedder,
            store: EmbeddingStore::new(enroll_dir.clone()),
            enrollment: Enrollment::new(enroll_dir),
            ledger,
            threshold,
        }
    }

    /// Match every face in `image_path` and record the results under `now`'s date.
    ///
    /// Never fails: errors become a `Failed` report.
    pub fn mark(&mut self, image_path: &Path, now: NaiveDateTime) -> AttendanceReport {
        match self.try_mark(image_path, now) {
            Ok(results) => AttendanceReport::recorded(results),
            Err(e) => {
                tracing::error!(image = %image_path.display(), error = %e, "mark attendance failed");
                AttendanceReport::failed(e)
            }
        }
    }

    fn try_mark(&mut self, image_path: &Path, now: NaiveDateTime) -> Result<Vec<MatchResult>, EngineError> {
        // Query image first, so an unreadable upload fails before the catalog is embedded.
        let faces: Vec<QueryFace> = self
            .embedder
            .extract(image_path)?
            .into_iter()
            .enumerate()
            .map(|(index, face)| QueryFace {
                index,
                embedding: face.embedding,
            })
            .collect();
        let catalog = self.store.load(self.embedder.as_mut())?;
        tracing::info!(
            faces = faces.len(),
            identities = catalog.len(),
            "processing attendance image"
        );

        let results = match_faces(&EuclideanMatcher, &catalog, &faces, self.threshold, now);
        self.ledger.append(now.date(), &results)?;

        tracing::info!(
            faces = results.len(),
            present = results.iter().filter(|r| r.is_match()).count(),
            date = %now.date(),
            "attendance recorded"
        );
        Ok(results)
    }

    pub fn register(&mut self, request: &EnrollRequest) -> Result<Enrolled, EnrollError> {
        self.enrollment.register(request, self.embedder.as_mut())
    }

    pub fn replace(&mut self, request: &EnrollRequest) -> Result<Enrolled, EnrollError> {
        self.enrollment.replace(request, self.embedder.as_mut())
    }

    pub fn remove(&mut self, id: &str) -> Result<(), EnrollError> {
        self.enrollment.remove(id)
    }

    pub fn records(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.ledger.query(date)
    }

    /// Dates that have a ledger segment, ascending.
    pub fn dates(&self) -> Result<Vec<NaiveDate>, LedgerError> {
        self.ledger.dates()
    }

    pub fn identities(&self) -> Result<Vec<IdentitySummary>, CatalogError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|(id, IdentityInfo { name, .. }, poses)| IdentitySummary { id, name, poses })
            .collect())
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Mark {
        image_path: PathBuf,
        reply: oneshot::Sender<AttendanceReport>,
    },
    Register {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<Enrolled, EnrollError>>,
    },
    Replace {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<Enrolled, EnrollError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<(), EnrollError>>,
    },
    Records {
        date: NaiveDate,
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, LedgerError>>,
    },
    Dates {
        reply: oneshot::Sender<Result<Vec<NaiveDate>, LedgerError>>,
    },
    Identities {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, CatalogError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Mark attendance from an image on disk.
    pub async fn mark(&self, image_path: PathBuf) -> Result<AttendanceReport, EngineError> {
        self.call(|reply| EngineRequest::Mark { image_path, reply }).await
    }

    pub async fn register(&self, request: EnrollRequest) -> Result<Enrolled, EngineError> {
        Ok(self.call(|reply| EngineRequest::Register { request, reply }).await??)
    }

    /// Re-enroll an existing identity with a fresh set of poses.
    pub async fn replace(&self, request: EnrollRequest) -> Result<Enrolled, EngineError> {
        Ok(self.call(|reply| EngineRequest::Replace { request, reply }).await??)
    }

    pub async fn remove(&self, id: String) -> Result<(), EngineError> {
        Ok(self.call(|reply| EngineRequest::Remove { id, reply }).await??)
    }

    pub async fn records(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, EngineError> {
        Ok(self.call(|reply| EngineRequest::Records { date, reply }).await??)
    }

    pub async fn dates(&self) -> Result<Vec<NaiveDate>, EngineError> {
        Ok(self.call(|reply| EngineRequest::Dates { reply }).await??)
    }

    pub async fn identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        Ok(self.call(|reply| EngineRequest::Identities { reply }).await??)
    }
}

/// Current local time truncated to whole seconds.
pub fn local_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Spawn the engine on a dedicated OS thread and return its handle.
pub fn spawn_engine(mut engine: Engine) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Mark { image_path, reply } => {
                        let _ = reply.send(engine.mark(&image_path, local_now()));
                    }
                    EngineRequest::Register { request, reply } => {
                        let _ = reply.send(engine.register(&request));
                    }
                    EngineRequest::Replace { request, reply } => {
                        let _ = reply.send(engine.replace(&request));
                    }
                    EngineRequest::Remove { id, reply } => {
                        let _ = reply.send(engine.remove(&id));
                    }
                    EngineRequest::Records { date, reply } => {
                        let _ = reply.send(engine.records(date));
                    }
                    EngineRequest::Dates { reply } => {
                        let _ = reply.send(engine.dates());
                    }
                    EngineRequest::Identities { reply } => {
                        let _ = reply.send(engine.identities());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::catalog::INFO_FILE;
    use rollcall_core::{BoundingBox, DetectedFace, Embedding, DEFAULT_MATCH_THRESHOLD, UNKNOWN_ID};
    use rollcall_ledger::{SqliteLedger, Status};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Extractor stub keyed by path; `fallback` answers for any other existing file.
    #[derive(Default)]
    struct FakeEmbedder {
        faces: HashMap<PathBuf, Vec<Vec<f32>>>,
        fallback: Option<Vec<f32>>,
        calls: Arc<AtomicUsize>,
    }

    impl FaceEmbedder for FakeEmbedder {
        fn extract(&mut self, image_path: &Path) -> Result<Vec<DetectedFace>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let faces = match self.faces.get(image_path) {
                Some(faces) => faces.clone(),
                None if image_path.exists() => self.fallback.clone().into_iter().collect(),
                None => return Err(EmbedError::ImageNotFound(image_path.display().to_string())),
            };
            Ok(faces
                .into_iter()
                .map(|values| DetectedFace {
                    bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 1.0 },
                    embedding: Embedding::new(values),
                })
                .collect())
        }
    }

    /// Ledger whose appends always fail.
    struct FailingLedger;

    impl Ledger for FailingLedger {
        fn append_records(&self, _: NaiveDate, _: &[AttendanceRecord]) -> Result<usize, LedgerError> {
            Err(LedgerError::Io(std::io::Error::other("disk full")))
        }
        fn query(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
            Err(LedgerError::NotFound(date))
        }
        fn dates(&self) -> Result<Vec<NaiveDate>, LedgerError> {
            Ok(vec![])
        }
    }

    /// Shares one in-memory ledger between the engine and the test.
    struct SharedLedger(Arc<SqliteLedger>);

    impl Ledger for SharedLedger {
        fn append_records(&self, date: NaiveDate, records: &[AttendanceRecord]) -> Result<usize, LedgerError> {
            self.0.append_records(date, records)
        }
        fn query(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
            self.0.query(date)
        }
        fn dates(&self) -> Result<Vec<NaiveDate>, LedgerError> {
            self.0.dates()
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        image: PathBuf,
        embedder: FakeEmbedder,
        ledger: Arc<SqliteLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().join("database");
            std::fs::create_dir_all(&root).unwrap();
            let image = tmp.path().join("class.jpg");
            std::fs::write(&image, b"jpeg").unwrap();
            Self {
                _tmp: tmp,
                root,
                image,
                embedder: FakeEmbedder::default(),
                ledger: Arc::new(SqliteLedger::open_in_memory().unwrap()),
            }
        }

        /// Enroll `id` with one embedding per given pose vector.
        fn identity(mut self, id: &str, name: &str, poses: &[&[f32]]) -> Self {
            let dir = self.root.join(id);
            std::fs::create_dir_all(&dir).unwrap();
            let info = serde_json::json!({"name": name, "roll": id});
            std::fs::write(dir.join(INFO_FILE), info.to_string()).unwrap();
            for (pose, values) in Pose::ALL.iter().zip(poses) {
                let path = dir.join(pose.file_name());
                std::fs::write(&path, b"jpeg").unwrap();
                self.embedder.faces.insert(path, vec![values.to_vec()]);
            }
            self
        }

        fn query_faces(mut self, faces: &[&[f32]]) -> Self {
            let faces = faces.iter().map(|v| v.to_vec()).collect();
            self.embedder.faces.insert(self.image.clone(), faces);
            self
        }

        fn engine(self) -> (Engine, Arc<SqliteLedger>, PathBuf, tempfile::TempDir) {
            let ledger = Arc::clone(&self.ledger);
            let engine = Engine::new(
                Box::new(self.embedder),
                self.root,
                Box::new(SharedLedger(Arc::clone(&self.ledger))),
                DEFAULT_MATCH_THRESHOLD,
            );
            (engine, ledger, self.image, self._tmp)
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(9, 30, 0))
            .unwrap()
    }

    fn jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 180, 160]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_mark_matches_and_records() {
        let (mut engine, ledger, image, _tmp) = Fixture::new()
            .identity("S1", "Ada", &[&[0.0, 0.0], &[0.1, 0.0], &[0.0, 0.1]])
            .identity("S2", "Grace", &[&[1.0, 1.0]])
            .query_faces(&[&[0.05, 0.0], &[5.0, 5.0], &[0.9, 1.0], &[0.0, 0.02]])
            .engine();

        let (total_faces, present_count, attendance, success) = match engine.mark(&image, now()) {
            AttendanceReport::Recorded { total_faces, present_count, attendance, success } => {
                (total_faces, present_count, attendance, success)
            }
            other => panic!("expected recorded report, got {other:?}"),
        };
        assert!(success);
        assert_eq!(total_faces, 4);
        assert_eq!(present_count, 3);
        let ids: Vec<&str> = attendance.iter().map(|r| r.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", UNKNOWN_ID, "S2", "S1"]);

        let rows = ledger.query(now().date()).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1].status, Status::Unknown);
        assert_eq!(rows[2].name, "Grace");
        assert_eq!(rows[3].time, now());
    }

    #[test]
    fn test_repeated_marks_append() {
        let (mut engine, ledger, image, _tmp) = Fixture::new()
            .identity("S1", "Ada", &[&[0.0]])
            .query_faces(&[&[0.1]])
            .engine();

        for _ in 0..3 {
            assert!(engine.mark(&image, now()).is_success());
        }
        assert_eq!(ledger.query(now().date()).unwrap().len(), 3);
    }

    #[test]
    fn test_no_faces_is_empty_success() {
        let (mut engine, ledger, image, _tmp) = Fixture::new()
            .identity("S1", "Ada", &[&[0.0]])
            .query_faces(&[])
            .engine();

        let report = engine.mark(&image, now());
        assert_eq!(report, AttendanceReport::recorded(vec![]));
        assert!(ledger.query(now().date()).unwrap().is_empty());
    }

    #[test]
    fn test_empty_catalog_marks_everyone_unknown() {
        let (mut engine, _ledger, image, _tmp) = Fixture::new().query_faces(&[&[0.0], &[1.0]]).engine();
        let json = serde_json::to_value(engine.mark(&image, now())).unwrap();
        assert_eq!(json["totalFaces"], 2);
        assert_eq!(json["presentCount"], 0);
    }

    #[test]
    fn test_corrupt_identity_does_not_abort_marking() {
        let fixture = Fixture::new().identity("S1", "Ada", &[&[0.0]]).query_faces(&[&[0.1]]);
        let broken = fixture.root.join("S2");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(INFO_FILE), b"{").unwrap();
        let (mut engine, _ledger, image, _tmp) = fixture.engine();

        let json = serde_json::to_value(engine.mark(&image, now())).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["presentCount"], 1);
    }

    #[test]
    fn test_ledger_failure_reports_error() {
        let fixture = Fixture::new().identity("S1", "Ada", &[&[0.0]]).query_faces(&[&[0.1]]);
        let image = fixture.image.clone();
        let mut engine = Engine::new(
            Box::new(fixture.embedder),
            fixture.root,
            Box::new(FailingLedger),
            DEFAULT_MATCH_THRESHOLD,
        );

        let json = serde_json::to_value(engine.mark(&image, now())).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("disk full"));
        assert!(json.get("attendance").is_none());
    }

    #[test]
    fn test_unreadable_image_reports_error() {
        let fixture = Fixture::new().identity("S1", "Ada", &[&[0.0], &[0.1], &[0.2]]);
        let calls = Arc::clone(&fixture.embedder.calls);
        let (mut engine, ledger, image, _tmp) = fixture.engine();
        let missing = image.with_file_name("absent.jpg");

        let report = engine.mark(&missing, now());
        assert!(!report.is_success());
        assert!(matches!(ledger.query(now().date()), Err(LedgerError::NotFound(_))));
        // Only the query image was attempted; no pose was embedded.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_list_remove() {
        let mut fixture = Fixture::new();
        fixture.embedder.fallback = Some(vec![0.3]);
        let (mut engine, _ledger, _image, _tmp) = fixture.engine();

        let request = Pose::ALL
            .into_iter()
            .fold(EnrollRequest::new("Ada", "S-1"), |req, pose| req.with_photo(pose, jpeg()));
        let enrolled = engine.register(&request).unwrap();
        assert_eq!(enrolled.id, "S1");

        let listed = engine.identities().unwrap();
        assert_eq!(
            listed,
            vec![IdentitySummary { id: "S1".into(), name: "Ada".into(), poses: Pose::ALL.to_vec() }]
        );

        engine.remove("S1").unwrap();
        assert!(engine.identities().unwrap().is_empty());
    }

    #[test]
    fn test_replace_reenrolls_identity() {
        let mut fixture = Fixture::new();
        fixture.embedder.fallback = Some(vec![0.3]);
        let (mut engine, _ledger, _image, _tmp) = fixture.engine();

        let request = |name: &str| {
            Pose::ALL
                .into_iter()
                .fold(EnrollRequest::new(name, "S1"), |req, pose| req.with_photo(pose, jpeg()))
        };
        assert!(matches!(
            engine.replace(&request("Ada")),
            Err(EnrollError::NotFound(_))
        ));

        engine.register(&request("Ada")).unwrap();
        let replaced = engine.replace(&request("Ada King")).unwrap();
        assert_eq!(replaced.id, "S1");
        assert_eq!(engine.identities().unwrap()[0].name, "Ada King");
    }

    #[test]
    fn test_dates_lists_marked_days() {
        let (mut engine, _ledger, image, _tmp) = Fixture::new()
            .identity("S1", "Ada", &[&[0.0]])
            .query_faces(&[&[0.1]])
            .engine();
        assert!(engine.dates().unwrap().is_empty());

        let next_day = now() + chrono::Duration::days(1);
        assert!(engine.mark(&image, next_day).is_success());
        assert!(engine.mark(&image, now()).is_success());
        assert_eq!(engine.dates().unwrap(), vec![now().date(), next_day.date()]);
    }

    #[tokio::test]
    async fn test_handle_replace_and_dates() {
        let mut fixture = Fixture::new();
        fixture.embedder.fallback = Some(vec![0.3]);
        let (engine, _ledger, _image, _tmp) = fixture.engine();
        let handle = spawn_engine(engine).unwrap();

        let request = Pose::ALL
            .into_iter()
            .fold(EnrollRequest::new("Ada", "S1"), |req, pose| req.with_photo(pose, jpeg()));
        assert!(matches!(
            handle.replace(request.clone()).await,
            Err(EngineError::Enroll(EnrollError::NotFound(_)))
        ));
        handle.register(request.clone()).await.unwrap();
        assert_eq!(handle.replace(request).await.unwrap().id, "S1");
        assert!(handle.dates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_serializes_concurrent_marks() {
        let (engine, ledger, image, _tmp) = Fixture::new()
            .identity("S1", "Ada", &[&[0.0]])
            .query_faces(&[&[0.1], &[0.2]])
            .engine();
        let handle = spawn_engine(engine).unwrap();

        let marks: Vec<_> = (0..6)
            .map(|_| {
                let handle = handle.clone();
                let image = image.clone();
                tokio::spawn(async move { handle.mark(image).await })
            })
            .collect();
        for m in marks {
            assert!(m.await.unwrap().unwrap().is_success());
        }

        // Marks are stamped by the engine clock and may straddle midnight.
        let dates = handle.dates().await.unwrap();
        assert!(!dates.is_empty() && dates.len() <= 2);
        let mut rows = Vec::new();
        for date in &dates {
            rows.extend(handle.records(*date).await.unwrap());
        }
        assert_eq!(rows.len(), 12);
        let stored: usize = dates.iter().map(|d| ledger.query(*d).unwrap().len()).sum();
        assert_eq!(stored, 12);
        for pair in rows.chunks(2) {
            assert_eq!((pair[0].face_index, pair[1].face_index), (0, 1));
        }
    }

    #[tokio::test]
    async fn test_handle_errors_propagate() {
        let (engine, _ledger, _image, _tmp) = Fixture::new().engine();
        let handle = spawn_engine(engine).unwrap();

        let date = NaiveDate::from_ymd_opt(1999, 1, 1).unwrap();
        assert!(matches!(
            handle.records(date).await,
            Err(EngineError::Ledger(LedgerError::NotFound(_)))
        ));
        assert!(matches!(
            handle.remove("nobody".into()).await,
            Err(EngineError::Enroll(EnrollError::NotFound(_)))
        ));
    }

    #[test]
    fn test_local_now_has_whole_seconds() {
        assert_eq!(local_now().nanosecond(), 0);
    }
}
