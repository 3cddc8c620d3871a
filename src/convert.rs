//! One conversion, start to finish: read deck → thumbnails → script slides →
//! output document.
//!
//! ## Why synchronous?
//!
//! Every step is either CPU-bound (rendering, segmentation, encoding) or
//! blocks on an external process (LibreOffice, pdfium, PowerPoint). The job
//! queue runs [`Converter::convert`] on the blocking pool, so async would
//! only add noise here. Callers outside the queue may call it directly from
//! a plain thread.

use crate::cache::ThumbnailCache;
use crate::config::ServiceConfig;
use crate::deck::DeckReader;
use crate::error::ScriptDeckError;
use crate::pipeline::{RenderTools, ThumbnailPipeline, ThumbnailSource};
use crate::progress::{emit, JobLog};
use crate::script::{build_script_slides, ScriptWriter};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Summary of one successful conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    pub output_path: PathBuf,
    pub stats: ConversionStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionStats {
    pub source_slides: usize,
    /// Source slides that had notes.
    pub noted_slides: usize,
    pub script_slides: usize,
    pub cached_thumbnails: usize,
    pub placeholder_thumbnails: usize,
    pub thumbnail_dpi: u32,
    pub total_duration_ms: u64,
}

/// Everything one conversion needs; shared by all jobs.
#[derive(Clone)]
pub struct Converter {
    pub pipeline: ThumbnailPipeline,
    pub reader: Arc<dyn DeckReader>,
    pub writer: Arc<dyn ScriptWriter>,
    pub max_chars_per_slide: usize,
    pub output_file_name: String,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("pipeline", &self.pipeline)
            .field("reader", &self.reader.extensions())
            .field("max_chars_per_slide", &self.max_chars_per_slide)
            .field("output_file_name", &self.output_file_name)
            .finish()
    }
}

impl Converter {
    /// Build a converter from service configuration.
    ///
    /// A cache directory that cannot be opened disables the cache rather
    /// than failing: conversions still work, just without reuse.
    pub fn from_config(
        config: &ServiceConfig,
        tools: RenderTools,
        reader: Arc<dyn DeckReader>,
        writer: Arc<dyn ScriptWriter>,
    ) -> Self {
        let mut pipeline = ThumbnailPipeline::new(tools, config.thumbnails.clone());
        if config.cache_enabled {
            match ThumbnailCache::open(&config.cache_dir, config.cache_max_bytes) {
                Ok(cache) => pipeline = pipeline.with_cache(Arc::new(cache)),
                Err(e) => warn!("Thumbnail cache disabled: {}", e),
            }
        }
        Self {
            pipeline,
            reader,
            writer,
            max_chars_per_slide: config.max_chars_per_slide,
            output_file_name: config.output_file_name.clone(),
        }
    }

    /// Convert the presentation at `input`.
    ///
    /// Intermediate images go to `work_dir` (owned by the caller); the
    /// script document is written to `output_dir/<output_file_name>`.
    ///
    /// # Errors
    /// Unreadable deck, no slide with notes, or the output cannot be written.
    /// Thumbnail trouble is never an error; it degrades to placeholders.
    pub fn convert(
        &self,
        input: &Path,
        work_dir: &Path,
        output_dir: &Path,
        log: &dyn JobLog,
    ) -> Result<ConversionOutput, ScriptDeckError> {
        let started = Instant::now();
        info!("Starting conversion: {}", input.display());

        // ── Step 1: Read the deck ────────────────────────────────────────
        emit(log, "Reading presentation...");
        let deck = self.reader.read(input)?;

        // ── Step 2: Thumbnails ───────────────────────────────────────────
        let thumbnails = if self.reader.office_document() {
            self.pipeline.acquire(&deck, input, work_dir, log)?
        } else {
            self.pipeline.acquire_internal(&deck, work_dir, log)?
        };

        // ── Step 3: Script slides ────────────────────────────────────────
        let slides = build_script_slides(&deck, &thumbnails, self.max_chars_per_slide, log);
        if slides.is_empty() {
            return Err(ScriptDeckError::NoScriptSlides {
                path: input.to_path_buf(),
            });
        }

        // ── Step 4: Write ────────────────────────────────────────────────
        let output_path = output_dir.join(&self.output_file_name);
        self.writer.write(&deck, &slides, &output_path)?;

        let stats = ConversionStats {
            source_slides: deck.slide_count(),
            noted_slides: deck.slides.iter().filter(|s| s.has_notes()).count(),
            script_slides: slides.len(),
            cached_thumbnails: thumbnails.count_from(ThumbnailSource::Cache),
            placeholder_thumbnails: thumbnails.count_from(ThumbnailSource::Placeholder),
            thumbnail_dpi: thumbnails.dpi,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        emit(
            log,
            format!(
                "Done: {} script slides -> {}",
                stats.script_slides,
                output_path.display()
            ),
        );
        Ok(ConversionOutput { output_path, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::JsonDeckReader;
    use crate::progress::MemoryLog;
    use crate::script::JsonScriptWriter;

    fn converter(cache_dir: &Path) -> Converter {
        let config = ServiceConfig::builder()
            .cache_dir(cache_dir)
            .build()
            .unwrap();
        Converter::from_config(
            &config,
            RenderTools::internal_only(),
            Arc::new(JsonDeckReader),
            Arc::new(JsonScriptWriter::default()),
        )
    }

    #[test]
    fn deck_without_notes_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("deck.json");
        std::fs::write(&input, r#"{"slides": [{"notes": "  "}, {}]}"#).unwrap();

        let err = converter(&dir.path().join("cache"))
            .convert(&input, dir.path(), &dir.path().join("out"), &MemoryLog::default())
            .unwrap_err();
        assert!(matches!(err, ScriptDeckError::NoScriptSlides { .. }));
    }

    #[test]
    fn notes_become_script_slides() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("deck.json");
        std::fs::write(
            &input,
            r#"{"slides": [{"notes": "話者1: はじめまして。"}, {"notes": ""}, {"notes": "second"}]}"#,
        )
        .unwrap();
        let log = MemoryLog::default();

        let out = converter(&dir.path().join("cache"))
            .convert(&input, dir.path(), &dir.path().join("out"), &log)
            .unwrap();
        assert_eq!(out.stats.source_slides, 3);
        assert_eq!(out.stats.noted_slides, 2);
        assert_eq!(out.stats.script_slides, 2);
        assert!(out.output_path.exists());
        assert!(log.contains("Slide 2: notes are empty"));
    }
}
