//! End-to-end service behaviour with the built-in renderer only.

use futures::StreamExt;
use notes2script::error::{ScriptDeckError, ToolError};
use notes2script::pipeline::render::PdfRasterizer;
use notes2script::pipeline::{ExportFormat, OfficeConverter};
use notes2script::{
    Deck, DeckReader, JobEvent, JsonDeckReader, JsonScriptWriter, MemoryProbe, RenderTools,
    ScriptService, ServiceConfig, TaskState, task_events,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Show library logs with `RUST_LOG=notes2script=debug cargo test`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const DECK: &str = r##"{
  "slides": [
    {"notes": "話者1: こんにちは。今日はよろしくお願いします。\n話者2: よろしくお願いします。",
     "shapes": [{"left": 0, "top": 0, "width": 914400, "height": 914400, "fill": "#3366FF"}]},
    {"notes": ""},
    {"notes": "Closing remarks."}
  ]
}"##;

/// Memory reading the test can move at will.
struct Dial(AtomicU64);

impl Dial {
    fn new(bytes: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(bytes)))
    }

    fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for Dial {
    fn resident_bytes(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn config(root: &Path, ttl: Duration) -> ServiceConfig {
    ServiceConfig::builder()
        .cache_dir(root.join("cache"))
        .work_root(root.join("work"))
        .artifacts_root(root.join("artifacts"))
        .governor_interval(Duration::ZERO)
        .completed_ttl(ttl)
        .memory_ceiling_mb(400)
        .build()
        .unwrap()
}

fn service(root: &Path, probe: Arc<Dial>, ttl: Duration) -> ScriptService {
    ScriptService::with_probe(
        config(root, ttl),
        RenderTools::internal_only(),
        Arc::new(JsonDeckReader),
        Arc::new(JsonScriptWriter::default()),
        probe,
    )
}

async fn submit_and_wait(svc: &ScriptService, name: &str, body: &str) -> Uuid {
    submit_modified_and_wait(svc, name, body, None).await
}

async fn submit_modified_and_wait(
    svc: &ScriptService,
    name: &str,
    body: &str,
    modified: Option<SystemTime>,
) -> Uuid {
    let rx = svc.subscribe();
    let receipt = svc
        .submit_with_modified(name, body.as_bytes(), modified)
        .await
        .unwrap();
    assert_eq!(receipt.status, TaskState::Queued);
    let events: Vec<JobEvent> = tokio::time::timeout(
        Duration::from_secs(60),
        task_events(svc.queue(), rx, receipt.task_id).collect(),
    )
    .await
    .expect("conversion timed out");
    assert!(events.last().is_some_and(JobEvent::is_finished));
    receipt.task_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn noted_slides_become_a_downloadable_script() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(tmp.path(), Dial::new(50 * MIB), Duration::from_secs(3600));

    let id = submit_and_wait(&svc, "../../talk.json", DECK).await;
    let status = svc.status(&id).unwrap();
    assert_eq!(status.status, TaskState::Completed, "{:?}", status.logs);
    assert_eq!(status.download_url.as_deref(), Some(format!("/download/{id}").as_str()));
    assert!(status.logs.iter().any(|l| l.contains("Slide 2: notes are empty")));

    let artifacts = tmp.path().join("artifacts").join(id.to_string());
    assert!(artifacts.join("script_slides.json").exists());
    // Only the per-task output directory remains; the work dir is gone.
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("work")).unwrap().collect();
    assert!(leftovers.is_empty());

    let mut download = svc.download(&id).await.unwrap();
    assert_eq!(download.file_name, "script_slides.json");
    let mut body = String::new();
    download.read_to_string(&mut body).await.unwrap();
    let doc: Value = serde_json::from_str(&body).unwrap();
    let pages = doc["slides"].as_array().unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0]["source_slide"], 1);
    assert_eq!(pages[1]["source_slide"], 3);
    assert_eq!(pages[0]["paragraphs"][0]["color"], "#FFFF00");
    assert!(pages.iter().all(|p| p["thumbnail"]["png_base64"].is_string()));

    drop(download);
    assert!(matches!(svc.status(&id), Err(ScriptDeckError::TaskNotFound { .. })));
    assert!(!artifacts.exists());
}

#[tokio::test]
async fn submissions_are_refused_over_the_memory_ceiling() {
    let tmp = tempfile::tempdir().unwrap();
    let dial = Dial::new(500 * MIB);
    let svc = service(tmp.path(), dial.clone(), Duration::from_secs(3600));

    let err = svc.submit("talk.json", DECK.as_bytes()).await.unwrap_err();
    assert!(matches!(err, ScriptDeckError::MemoryPressure { ceiling_mb: 400, .. }));
    assert!(err.is_retryable());
    assert_eq!(svc.health().memory_usage_mb, 500.0);
    assert_eq!(svc.queue().task_count(), 0);

    dial.set(10 * MIB);
    assert!(svc.submit("talk.json", DECK.as_bytes()).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn governor_purges_old_completed_tasks_under_pressure() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let dial = Dial::new(10 * MIB);
    let svc = service(tmp.path(), dial.clone(), Duration::ZERO);

    let done = submit_and_wait(&svc, "talk.json", DECK).await;
    let failed = submit_and_wait(&svc, "empty.json", r#"{"slides": [{"notes": ""}]}"#).await;
    assert_eq!(svc.status(&done).unwrap().status, TaskState::Completed);
    assert_eq!(svc.status(&failed).unwrap().status, TaskState::Failed);

    // Under the ceiling nothing is purged.
    let health = svc.health();
    assert_eq!(health.tracked_tasks, 2);
    assert_eq!(health.active_tasks, 0);

    dial.set(900 * MIB);
    let health = svc.health();
    assert_eq!(health.status, "healthy");
    assert!(matches!(svc.status(&done), Err(ScriptDeckError::TaskNotFound { .. })));
    assert!(!tmp.path().join("artifacts").join(done.to_string()).exists());
    // Failed tasks are left for the client to inspect.
    assert_eq!(svc.status(&failed).unwrap().status, TaskState::Failed);
}

#[tokio::test]
async fn bad_requests_are_rejected_up_front() {
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(tmp.path(), Dial::new(MIB), Duration::from_secs(3600));

    let err = svc.submit("talk.key", DECK.as_bytes()).await.unwrap_err();
    assert!(matches!(err, ScriptDeckError::UnsupportedFile { .. }));

    let unknown = Uuid::new_v4();
    assert!(matches!(svc.cleanup(&unknown), Err(ScriptDeckError::TaskNotFound { .. })));
    assert!(matches!(
        svc.download(&unknown).await,
        Err(ScriptDeckError::TaskNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_conversion_cannot_be_downloaded_but_can_be_cleaned_up() {
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(tmp.path(), Dial::new(MIB), Duration::from_secs(3600));

    let id = submit_and_wait(&svc, "broken.json", "{ not json").await;
    let status = svc.status(&id).unwrap();
    assert_eq!(status.status, TaskState::Failed);
    assert!(status.message.starts_with("Conversion failed: Could not read presentation"));

    assert!(matches!(
        svc.download(&id).await,
        Err(ScriptDeckError::NotCompleted { .. })
    ));
    svc.cleanup(&id).unwrap();
    assert!(svc.status(&id).is_err());
}

/// Office documents whose content happens to be deck JSON.
struct PptxReader;

impl DeckReader for PptxReader {
    fn extensions(&self) -> &[&'static str] {
        &["pptx"]
    }

    fn read(&self, path: &Path) -> Result<Deck, ScriptDeckError> {
        JsonDeckReader.read(path)
    }
}

/// Counts PDF conversions; writes a stand-in PDF.
#[derive(Default)]
struct CountingOffice {
    calls: AtomicUsize,
}

impl OfficeConverter for CountingOffice {
    fn name(&self) -> &str {
        "counting-office"
    }

    fn convert(&self, input: &Path, format: ExportFormat, out_dir: &Path) -> Result<Vec<PathBuf>, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if format != ExportFormat::Pdf {
            return Err(ToolError::InvocationFailed {
                tool: "counting-office".into(),
                detail: "pdf only".into(),
            });
        }
        std::fs::create_dir_all(out_dir).unwrap();
        let pdf = out_dir.join(format!("{}.pdf", input.file_stem().unwrap().to_string_lossy()));
        std::fs::write(&pdf, b"%PDF-1.4").unwrap();
        Ok(vec![pdf])
    }
}

struct SolidRasterizer;

impl PdfRasterizer for SolidRasterizer {
    fn name(&self) -> &str {
        "solid"
    }

    fn rasterize(
        &self,
        _pdf: &Path,
        _dpi: u32,
        first_page: usize,
        last_page: usize,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ToolError> {
        std::fs::create_dir_all(out_dir).unwrap();
        Ok((first_page..=last_page)
            .map(|p| {
                let path = out_dir.join(format!("page_{p}.png"));
                image::RgbImage::from_pixel(8, 6, image::Rgb([0, 0, 200]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubmitting_an_unchanged_file_reuses_cached_thumbnails() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let office = Arc::new(CountingOffice::default());
    let svc = ScriptService::with_probe(
        config(tmp.path(), Duration::from_secs(3600)),
        RenderTools::internal_only()
            .with_office(office.clone())
            .with_rasterizer(Arc::new(SolidRasterizer)),
        Arc::new(PptxReader),
        Arc::new(JsonScriptWriter::default()),
        Dial::new(MIB),
    );
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    let first = submit_modified_and_wait(&svc, "talk.pptx", DECK, Some(modified)).await;
    assert_eq!(svc.status(&first).unwrap().status, TaskState::Completed);
    assert_eq!(office.calls.load(Ordering::SeqCst), 1);
    assert_eq!(svc.cache().unwrap().stats().file_count, 3);

    let second = submit_modified_and_wait(&svc, "talk.pptx", DECK, Some(modified)).await;
    let status = svc.status(&second).unwrap();
    assert_eq!(status.status, TaskState::Completed, "{:?}", status.logs);
    assert!(status.logs.iter().any(|l| l == "All thumbnails were cached"));
    assert_eq!(office.calls.load(Ordering::SeqCst), 1);
    assert_eq!(svc.cache().unwrap().stats().file_count, 3);
}
