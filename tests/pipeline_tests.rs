//! Thumbnail pipeline tier behaviour with fake external tools.
//!
//! None of these tests need LibreOffice, pdfium or PowerPoint.

use notes2script::deck::{Rgb, Shape};
use notes2script::error::ToolError;
use notes2script::pipeline::native::NativeExporter;
use notes2script::pipeline::render::PdfRasterizer;
use notes2script::pipeline::{ExportFormat, OfficeConverter};
use notes2script::{
    Converter, Deck, JsonDeckReader, JsonScriptWriter, MemoryLog, RenderTools, Slide,
    ThumbnailCache, ThumbnailPipeline, ThumbnailPolicy, ThumbnailSource,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Fakes ────────────────────────────────────────────────────────────────

fn write_png(path: &Path) {
    image::RgbImage::from_pixel(8, 6, image::Rgb([200, 10, 10]))
        .save(path)
        .unwrap();
}

fn write_pngs(dir: &Path, prefix: &str, count: usize) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    (1..=count)
        .map(|i| {
            let p = dir.join(format!("{prefix}{i}.png"));
            write_png(&p);
            p
        })
        .collect()
}

/// Writes a dummy PDF; PNG export yields `png_count` images if set.
#[derive(Default)]
struct FakeOffice {
    png_count: Option<usize>,
    calls: AtomicUsize,
}

impl OfficeConverter for FakeOffice {
    fn name(&self) -> &str {
        "fake-office"
    }

    fn convert(&self, input: &Path, format: ExportFormat, out_dir: &Path) -> Result<Vec<PathBuf>, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match format {
            ExportFormat::Pdf => {
                std::fs::create_dir_all(out_dir).unwrap();
                let stem = input.file_stem().unwrap().to_string_lossy();
                let pdf = out_dir.join(format!("{stem}.pdf"));
                std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();
                Ok(vec![pdf])
            }
            ExportFormat::Png => match self.png_count {
                Some(n) => Ok(write_pngs(out_dir, "Slide", n)),
                None => Err(ToolError::InvocationFailed {
                    tool: "fake-office".into(),
                    detail: "png export unsupported".into(),
                }),
            },
        }
    }
}

/// Produces one image per requested page, optionally skipping one page.
#[derive(Default)]
struct FakeRasterizer {
    skip_page: Option<usize>,
    batches: Mutex<Vec<(u32, usize, usize)>>,
}

impl PdfRasterizer for FakeRasterizer {
    fn name(&self) -> &str {
        "fake-raster"
    }

    fn rasterize(
        &self,
        _pdf: &Path,
        dpi: u32,
        first_page: usize,
        last_page: usize,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ToolError> {
        self.batches.lock().unwrap().push((dpi, first_page, last_page));
        std::fs::create_dir_all(out_dir).unwrap();
        Ok((first_page..=last_page)
            .filter(|p| Some(*p) != self.skip_page)
            .map(|p| {
                let path = out_dir.join(format!("page_{p:04}.png"));
                write_png(&path);
                path
            })
            .collect())
    }
}

struct FakeNative {
    count: usize,
}

impl NativeExporter for FakeNative {
    fn name(&self) -> &str {
        "fake-native"
    }

    fn export(&self, _input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ToolError> {
        Ok(write_pngs(out_dir, "Slide", self.count))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn deck(n: usize) -> Deck {
    Deck {
        slides: vec![Slide::default(); n],
        ..Deck::default()
    }
}

fn source_file(dir: &Path) -> PathBuf {
    let p = dir.join("talk.json");
    std::fs::write(&p, b"{}").unwrap();
    p
}

fn slide_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("slide_"))
        .count()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[test]
fn large_deck_uses_adaptive_batches_and_fills_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let source = source_file(tmp.path());
    let cache = Arc::new(ThumbnailCache::open(tmp.path().join("cache"), 50 * 1024 * 1024).unwrap());
    let office = Arc::new(FakeOffice::default());
    let raster = Arc::new(FakeRasterizer::default());
    let pipeline = ThumbnailPipeline::new(
        RenderTools::internal_only()
            .with_office(office.clone())
            .with_rasterizer(raster.clone()),
        ThumbnailPolicy::default(),
    )
    .with_cache(cache.clone());

    let work = tmp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let set = pipeline
        .acquire(&deck(150), &source, &work, &MemoryLog::default())
        .unwrap();

    assert_eq!(set.len(), 150);
    assert_eq!(set.dpi, 80);
    assert_eq!(set.count_from(ThumbnailSource::BatchPdf), 150);
    let batches = raster.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 10);
    assert_eq!(batches[0], (80, 1, 15));
    assert_eq!(batches[9], (80, 136, 150));
    assert_eq!(cache.stats().file_count, 150);
    assert!(set.iter().all(|t| t.path.exists()));
}

#[test]
fn full_cache_hit_invokes_no_tool() {
    let tmp = tempfile::tempdir().unwrap();
    let source = source_file(tmp.path());
    let cache = Arc::new(ThumbnailCache::open(tmp.path().join("cache"), 50 * 1024 * 1024).unwrap());
    let tools = |office: Arc<FakeOffice>| {
        RenderTools::internal_only()
            .with_office(office)
            .with_rasterizer(Arc::new(FakeRasterizer::default()))
    };

    let first_office = Arc::new(FakeOffice::default());
    let work1 = tempfile::tempdir().unwrap();
    ThumbnailPipeline::new(tools(first_office.clone()), ThumbnailPolicy::default())
        .with_cache(cache.clone())
        .acquire(&deck(4), &source, work1.path(), &MemoryLog::default())
        .unwrap();
    assert_eq!(first_office.calls.load(Ordering::SeqCst), 1);

    let second_office = Arc::new(FakeOffice::default());
    let work2 = tempfile::tempdir().unwrap();
    let log = MemoryLog::default();
    let set = ThumbnailPipeline::new(tools(second_office.clone()), ThumbnailPolicy::default())
        .with_cache(cache.clone())
        .acquire(&deck(4), &source, work2.path(), &log)
        .unwrap();

    assert_eq!(second_office.calls.load(Ordering::SeqCst), 0);
    assert_eq!(set.count_from(ThumbnailSource::Cache), 4);
    assert!(log.contains("All thumbnails were cached"));
}

#[test]
fn one_missing_page_discards_the_whole_batch_tier() {
    let tmp = tempfile::tempdir().unwrap();
    let source = source_file(tmp.path());
    let cache = Arc::new(ThumbnailCache::open(tmp.path().join("cache"), 50 * 1024 * 1024).unwrap());
    let pipeline = ThumbnailPipeline::new(
        RenderTools::internal_only()
            .with_office(Arc::new(FakeOffice::default()))
            .with_rasterizer(Arc::new(FakeRasterizer {
                skip_page: Some(150),
                ..Default::default()
            }))
            .with_native(Arc::new(FakeNative { count: 150 })),
        ThumbnailPolicy::default(),
    )
    .with_cache(cache.clone());

    let work = tempfile::tempdir().unwrap();
    let log = MemoryLog::default();
    let set = pipeline.acquire(&deck(150), &source, work.path(), &log).unwrap();

    assert_eq!(set.count_from(ThumbnailSource::Native), 150);
    assert_eq!(set.count_from(ThumbnailSource::BatchPdf), 0);
    assert_eq!(slide_files(work.path()), 0);
    assert_eq!(cache.stats().file_count, 0);
    assert!(log.contains("produced 14 images, expected 15"));
}

#[test]
fn native_count_mismatch_falls_through_to_direct_export() {
    let tmp = tempfile::tempdir().unwrap();
    let source = source_file(tmp.path());
    let pipeline = ThumbnailPipeline::new(
        RenderTools::internal_only()
            .with_office(Arc::new(FakeOffice {
                png_count: Some(5),
                ..Default::default()
            }))
            .with_native(Arc::new(FakeNative { count: 4 })),
        ThumbnailPolicy::default(),
    );

    let work = tempfile::tempdir().unwrap();
    let set = pipeline
        .acquire(&deck(5), &source, work.path(), &MemoryLog::default())
        .unwrap();
    assert_eq!(set.count_from(ThumbnailSource::DirectExport), 5);
}

#[test]
fn without_tools_every_slide_is_still_resolved() {
    let tmp = tempfile::tempdir().unwrap();
    let source = source_file(tmp.path());
    let mut d = deck(3);
    d.slides[1].shapes.push(Shape {
        left: 0,
        top: 0,
        width: 914_400,
        height: 914_400,
        fill: Some(Rgb(0, 128, 255)),
        ..Shape::default()
    });

    let pipeline = ThumbnailPipeline::new(
        RenderTools::internal_only().with_office(Arc::new(FakeOffice {
            png_count: Some(2),
            ..Default::default()
        })),
        ThumbnailPolicy::default(),
    );
    let work = tempfile::tempdir().unwrap();
    let log = MemoryLog::default();
    let set = pipeline.acquire(&d, &source, work.path(), &log).unwrap();

    assert_eq!(set.len(), 3);
    assert_eq!(set.get(1).unwrap().source, ThumbnailSource::Internal);
    assert_eq!(set.get(0).unwrap().source, ThumbnailSource::Placeholder);
    assert_eq!(set.get(2).unwrap().source, ThumbnailSource::Placeholder);
    assert!(set.iter().all(|t| t.path.exists()));

    let placeholder = image::open(&set.get(0).unwrap().path).unwrap();
    assert_eq!((placeholder.width(), placeholder.height()), (1600, 900));
}

#[test]
fn json_source_is_never_handed_to_office_tools() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("talk.json");
    std::fs::write(&input, r#"{"slides": [{"notes": "Hello there."}]}"#).unwrap();

    let office = Arc::new(FakeOffice {
        png_count: Some(1),
        ..Default::default()
    });
    let cache = Arc::new(ThumbnailCache::open(tmp.path().join("cache"), 50 * 1024 * 1024).unwrap());
    let converter = Converter {
        pipeline: ThumbnailPipeline::new(
            RenderTools::internal_only()
                .with_office(office.clone())
                .with_rasterizer(Arc::new(FakeRasterizer::default()))
                .with_native(Arc::new(FakeNative { count: 1 })),
            ThumbnailPolicy::default(),
        )
        .with_cache(cache.clone()),
        reader: Arc::new(JsonDeckReader),
        writer: Arc::new(JsonScriptWriter::default()),
        max_chars_per_slide: 200,
        output_file_name: "script.json".into(),
    };

    let work = tempfile::tempdir().unwrap();
    let log = MemoryLog::default();
    let out = converter
        .convert(&input, work.path(), &tmp.path().join("out"), &log)
        .unwrap();

    assert_eq!(office.calls.load(Ordering::SeqCst), 0);
    assert_eq!(out.stats.script_slides, 1);
    assert_eq!(out.stats.placeholder_thumbnails, 1);
    assert_eq!(cache.stats().file_count, 0);
    assert!(log.contains("not an office document"));
}
