//! Thumbnail acquisition: one image per slide, whatever is installed.
//!
//! [`ThumbnailPipeline::acquire`] walks an ordered chain of strategies and
//! stops at the first one that delivers a usable result:
//!
//! ```text
//! 1. cache      ─ every slide already cached? done, no tool runs
//! 2. batch      ─ office → PDF once, pdfium rasterises in adaptive batches
//! 3. native     ─ PowerPoint export (Windows / macOS only)
//! 4. direct     ─ office → PNG for the whole deck
//! 5. internal   ─ draw each remaining slide from its shapes, or a placeholder
//! ```
//!
//! Tiers 2–4 must produce exactly one image per slide or they are discarded
//! wholesale; a partial deck from one tool is never mixed with another. When
//! accepted they fill every slot. Tier 5 fills only slots still empty, so
//! partial cache hits survive into it. No tier failure is fatal: the worst
//! outcome is a placeholder image for a slide.
//!
//! Only tier 2 writes to the cache.
//!
//! Submodules:
//! - [`tools`]  — `OfficeConverter` + LibreOffice, the [`RenderTools`] bundle
//! - [`render`] — `PdfRasterizer` + pdfium
//! - [`native`] — `NativeExporter` + PowerPoint automation
//! - [`draw`]   — internal renderer and placeholder images
//! - [`encode`] — thumbnail → base64 PNG for the script document

pub mod draw;
pub mod encode;
pub mod native;
pub mod render;
pub mod tools;

pub use tools::{ExportFormat, OfficeConverter, RenderTools};

use crate::cache::{DocumentFingerprint, ThumbnailCache};
use crate::config::ThumbnailPolicy;
use crate::deck::Deck;
use crate::error::{ScriptDeckError, ToolError};
use crate::progress::{emit, JobLog};
use render::PdfRasterizer;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Which tier produced a thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSource {
    Cache,
    BatchPdf,
    Native,
    DirectExport,
    Internal,
    Placeholder,
}

impl fmt::Display for ThumbnailSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThumbnailSource::Cache => "cache",
            ThumbnailSource::BatchPdf => "batch pdf",
            ThumbnailSource::Native => "native export",
            ThumbnailSource::DirectExport => "direct export",
            ThumbnailSource::Internal => "internal render",
            ThumbnailSource::Placeholder => "placeholder",
        };
        f.write_str(s)
    }
}

/// A resolved thumbnail image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub path: PathBuf,
    pub source: ThumbnailSource,
}

/// One thumbnail per slide, in slide order.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailSet {
    /// Resolution the deck was rendered at.
    pub dpi: u32,
    thumbnails: Vec<Thumbnail>,
}

impl ThumbnailSet {
    pub fn len(&self) -> usize {
        self.thumbnails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thumbnails.is_empty()
    }

    /// Thumbnail for the 0-based slide `index`.
    pub fn get(&self, index: usize) -> Option<&Thumbnail> {
        self.thumbnails.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thumbnail> {
        self.thumbnails.iter()
    }

    /// Number of slides resolved by `source`.
    pub fn count_from(&self, source: ThumbnailSource) -> usize {
        self.thumbnails.iter().filter(|t| t.source == source).count()
    }
}

/// The thumbnail acquisition pipeline. Cheap to clone; shared across jobs.
#[derive(Clone, Debug)]
pub struct ThumbnailPipeline {
    cache: Option<Arc<ThumbnailCache>>,
    tools: RenderTools,
    policy: ThumbnailPolicy,
}

impl ThumbnailPipeline {
    pub fn new(tools: RenderTools, policy: ThumbnailPolicy) -> Self {
        Self {
            cache: None,
            tools,
            policy,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ThumbnailCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ThumbnailCache>> {
        self.cache.as_ref()
    }

    pub fn policy(&self) -> &ThumbnailPolicy {
        &self.policy
    }

    /// Produce one thumbnail per slide of `deck`.
    ///
    /// `source` is the presentation file handed to external tools and used
    /// for the cache fingerprint. All intermediate and generated images are
    /// written below `work_dir`, which the caller owns and removes.
    ///
    /// # Errors
    /// Only when not even a placeholder image can be written.
    pub fn acquire(
        &self,
        deck: &Deck,
        source: &Path,
        work_dir: &Path,
        log: &dyn JobLog,
    ) -> Result<ThumbnailSet, ScriptDeckError> {
        let n = deck.slide_count();
        let dpi = self.policy.dpi_for(n);
        if n == 0 {
            return Ok(ThumbnailSet {
                dpi,
                thumbnails: Vec::new(),
            });
        }
        let started = Instant::now();
        emit(log, format!("Slides: {n}, thumbnail DPI: {dpi}"));

        let fingerprint = match DocumentFingerprint::of(source) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!("Cannot fingerprint {}: {}; cache disabled for this job", source.display(), e);
                None
            }
        };
        let mut slots: Vec<Option<Thumbnail>> = vec![None; n];

        // ── Tier 1: cache ────────────────────────────────────────────────
        if let (Some(cache), Some(fp)) = (&self.cache, &fingerprint) {
            let stats = cache.stats();
            emit(
                log,
                format!(
                    "Cache usage: {}MB ({}%)",
                    stats.total_size_mb(),
                    stats.usage_percent
                ),
            );
            let mut hits = 0;
            for (idx, slot) in slots.iter_mut().enumerate() {
                if let Some(path) = cache.get(fp, idx, dpi) {
                    *slot = Some(Thumbnail {
                        path,
                        source: ThumbnailSource::Cache,
                    });
                    hits += 1;
                }
            }
            if hits > 0 {
                emit(log, format!("Loaded {hits}/{n} thumbnails from cache"));
            }
            if hits == n {
                emit(log, "All thumbnails were cached");
                return Ok(finish(slots, dpi));
            }
        }

        // ── Tier 2: batch PDF rasterisation ──────────────────────────────
        match self.batch_tier(source, n, dpi, work_dir, log) {
            Ok(paths) => {
                emit(log, "Thumbnails generated via PDF conversion");
                if let (Some(cache), Some(fp)) = (&self.cache, &fingerprint) {
                    let stored = paths
                        .iter()
                        .enumerate()
                        .filter(|(idx, path)| cache.put(fp, *idx, dpi, path).is_some())
                        .count();
                    emit(log, format!("Stored {stored} thumbnails in cache"));
                }
                fill_all(&mut slots, paths, ThumbnailSource::BatchPdf);
                debug!("Thumbnails acquired in {}ms", started.elapsed().as_millis());
                return Ok(finish(slots, dpi));
            }
            Err(e) => emit(log, format!("PDF batch thumbnails unavailable: {e}")),
        }

        // ── Tier 3: native host export ───────────────────────────────────
        if let Some(native) = &self.tools.native {
            match native.export(source, &work_dir.join("native")) {
                Ok(paths) if paths.len() == n => {
                    emit(log, format!("Thumbnails exported with {}", native.name()));
                    fill_all(&mut slots, paths, ThumbnailSource::Native);
                    return Ok(finish(slots, dpi));
                }
                Ok(paths) => emit(
                    log,
                    format!(
                        "{} exported {} images for {} slides; falling back",
                        native.name(),
                        paths.len(),
                        n
                    ),
                ),
                Err(e) => emit(log, format!("Native export failed: {e}")),
            }
        }

        // ── Tier 4: direct whole-deck image export ───────────────────────
        if let Some(office) = &self.tools.office {
            match office.convert(source, ExportFormat::Png, &work_dir.join("direct")) {
                Ok(paths) if paths.len() == n => {
                    emit(log, format!("Thumbnails exported directly with {}", office.name()));
                    fill_all(&mut slots, paths, ThumbnailSource::DirectExport);
                    return Ok(finish(slots, dpi));
                }
                Ok(paths) => emit(
                    log,
                    format!(
                        "{} produced {} images for {} slides; using internal rendering",
                        office.name(),
                        paths.len(),
                        n
                    ),
                ),
                Err(e) => emit(log, format!("Direct export failed: {e}; using internal rendering")),
            }
        } else {
            emit(log, "No office converter found; rendering thumbnails internally");
        }

        // ── Tier 5: internal rendering / placeholder ─────────────────────
        self.render_remaining(deck, &mut slots, dpi, work_dir, log)?;
        debug!("Thumbnails acquired in {}ms", started.elapsed().as_millis());
        Ok(finish(slots, dpi))
    }

    /// Produce one thumbnail per slide with the internal renderer alone.
    ///
    /// For decks whose source file no office tool can open: neither the
    /// cache nor any external tool is used.
    pub fn acquire_internal(
        &self,
        deck: &Deck,
        work_dir: &Path,
        log: &dyn JobLog,
    ) -> Result<ThumbnailSet, ScriptDeckError> {
        let n = deck.slide_count();
        let dpi = self.policy.dpi_for(n);
        let mut slots: Vec<Option<Thumbnail>> = vec![None; n];
        if n > 0 {
            emit(log, format!("Slides: {n}, thumbnail DPI: {dpi}"));
            emit(log, "Source is not an office document; rendering thumbnails internally");
        }
        self.render_remaining(deck, &mut slots, dpi, work_dir, log)?;
        Ok(finish(slots, dpi))
    }

    fn render_remaining(
        &self,
        deck: &Deck,
        slots: &mut [Option<Thumbnail>],
        dpi: u32,
        work_dir: &Path,
        log: &dyn JobLog,
    ) -> Result<(), ScriptDeckError> {
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(self.render_one(deck, idx, dpi, work_dir, log)?);
            }
        }
        Ok(())
    }

    /// Convert to PDF once, then rasterise in batches. Any failure discards
    /// everything this tier wrote.
    fn batch_tier(
        &self,
        source: &Path,
        n: usize,
        dpi: u32,
        work_dir: &Path,
        log: &dyn JobLog,
    ) -> Result<Vec<PathBuf>, ToolError> {
        let (Some(office), Some(rasterizer)) = (&self.tools.office, &self.tools.rasterizer) else {
            return Err(ToolError::Unavailable {
                tool: "batch pdf".into(),
                detail: "needs both an office converter and a PDF rasterizer".into(),
            });
        };

        let pdf_dir = work_dir.join("pdf");
        let scratch = work_dir.join("pdf_images");
        let mut exports = Vec::with_capacity(n);

        let result = office
            .convert(source, ExportFormat::Pdf, &pdf_dir)
            .and_then(|pdfs| pick_pdf(&pdfs, source).ok_or_else(|| ToolError::InvocationFailed {
                tool: office.name().to_string(),
                detail: "no PDF produced".into(),
            }))
            .and_then(|pdf| {
                self.rasterize_batches(rasterizer.as_ref(), &pdf, n, dpi, &scratch, work_dir, &mut exports, log)
            });

        let _ = std::fs::remove_dir_all(&scratch);
        let _ = std::fs::remove_dir_all(&pdf_dir);
        match result {
            Ok(()) => Ok(exports),
            Err(e) => {
                for path in &exports {
                    let _ = std::fs::remove_file(path);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rasterize_batches(
        &self,
        rasterizer: &dyn PdfRasterizer,
        pdf: &Path,
        n: usize,
        dpi: u32,
        scratch: &Path,
        work_dir: &Path,
        exports: &mut Vec<PathBuf>,
        log: &dyn JobLog,
    ) -> Result<(), ToolError> {
        let batch = self.policy.batch_size_for(n);
        for start in (1..=n).step_by(batch) {
            let end = (start + batch - 1).min(n);
            emit(log, format!("PDF batch rasterisation: pages {start}-{end} of {n}"));

            let batch_dir = scratch.join(format!("batch_{start:03}"));
            let produced = rasterizer.rasterize(pdf, dpi, start, end, &batch_dir)?;
            let expected = end - start + 1;
            if produced.len() != expected {
                return Err(ToolError::CountMismatch {
                    tool: rasterizer.name().to_string(),
                    expected,
                    produced: produced.len(),
                });
            }

            for (offset, image) in produced.iter().enumerate() {
                let dest = work_dir.join(format!("slide_{:03}.png", start + offset));
                move_file(image, &dest).map_err(|e| ToolError::io(rasterizer.name(), e))?;
                exports.push(dest);
            }
            emit(log, format!("PDF batch done: pages {start}-{end} -> {} images", produced.len()));
        }
        Ok(())
    }

    fn render_one(
        &self,
        deck: &Deck,
        idx: usize,
        dpi: u32,
        work_dir: &Path,
        log: &dyn JobLog,
    ) -> Result<Thumbnail, ScriptDeckError> {
        let number = idx + 1;
        let dest = work_dir.join(format!("rendered_{number:03}.png"));
        match draw::render_slide(deck, idx, dpi, &dest) {
            Ok(drawn) if drawn > 0 => {
                return Ok(Thumbnail {
                    path: dest,
                    source: ThumbnailSource::Internal,
                })
            }
            Ok(_) => emit(
                log,
                format!("Slide {number}: nothing drawable found; using a placeholder"),
            ),
            Err(e) => emit(log, format!("Slide {number}: rendering failed ({e}); using a placeholder")),
        }

        let placeholder = work_dir.join(format!("placeholder_{number:03}.png"));
        draw::write_placeholder(number, self.policy.placeholder_size, &placeholder).map_err(|e| {
            ScriptDeckError::ThumbnailUnavailable {
                slide: number,
                detail: e.to_string(),
            }
        })?;
        Ok(Thumbnail {
            path: placeholder,
            source: ThumbnailSource::Placeholder,
        })
    }
}

fn fill_all(slots: &mut [Option<Thumbnail>], paths: Vec<PathBuf>, source: ThumbnailSource) {
    for (slot, path) in slots.iter_mut().zip(paths) {
        *slot = Some(Thumbnail { path, source });
    }
}

fn finish(slots: Vec<Option<Thumbnail>>, dpi: u32) -> ThumbnailSet {
    ThumbnailSet {
        dpi,
        thumbnails: slots.into_iter().flatten().collect(),
    }
}

/// The PDF named after the source file, else the first one produced.
fn pick_pdf(pdfs: &[PathBuf], source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem();
    pdfs.iter()
        .find(|p| p.file_stem() == stem)
        .or_else(|| pdfs.first())
        .cloned()
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Across filesystems rename fails; copy instead.
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_named_after_source_is_preferred() {
        let pdfs = vec![PathBuf::from("/w/other.pdf"), PathBuf::from("/w/talk.pdf")];
        assert_eq!(
            pick_pdf(&pdfs, Path::new("/in/talk.pptx")),
            Some(PathBuf::from("/w/talk.pdf"))
        );
        assert_eq!(
            pick_pdf(&pdfs, Path::new("/in/x.pptx")),
            Some(PathBuf::from("/w/other.pdf"))
        );
        assert_eq!(pick_pdf(&[], Path::new("x.pptx")), None);
    }

    #[test]
    fn source_display_names() {
        assert_eq!(ThumbnailSource::BatchPdf.to_string(), "batch pdf");
        assert_eq!(ThumbnailSource::Placeholder.to_string(), "placeholder");
    }
}
