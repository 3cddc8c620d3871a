//! PDF rasterisation: render a page range to PNG files via pdfium.
//!
//! ## Why bind per call?
//!
//! The pdfium library is loaded dynamically. Binding at the moment of use
//! means a host without pdfium still constructs [`RenderTools`] fine; the
//! batch tier then fails with [`ToolError::Unavailable`] and the pipeline
//! falls through to the next tier instead of refusing to start.
//!
//! ## Why scale by DPI?
//!
//! PDF pages are measured in points (1/72 in). Scaling by `dpi / 72` gives
//! thumbnails whose pixel size tracks the adaptive DPI chosen for the deck,
//! which is what bounds peak memory on very large decks.
//!
//! [`RenderTools`]: crate::pipeline::tools::RenderTools

use crate::error::ToolError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Rasterises pages of a PDF into image files.
pub trait PdfRasterizer: Send + Sync {
    fn name(&self) -> &str;

    /// Render pages `first_page..=last_page` (1-based) at `dpi` into
    /// `out_dir`. Pages beyond the end of the document are not produced, so
    /// callers must compare the returned count with the range size.
    fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        first_page: usize,
        last_page: usize,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ToolError>;
}

/// pdfium-backed rasterizer.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    /// Directory containing the pdfium shared library. `None` uses the
    /// system library search path.
    library_dir: Option<PathBuf>,
}

impl PdfiumRasterizer {
    const TOOL: &'static str = "pdfium";

    pub fn new(library_dir: Option<PathBuf>) -> Self {
        Self { library_dir }
    }

    /// Honour `PDFIUM_LIB_PATH` when set.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var_os("PDFIUM_LIB_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        )
    }

    fn bind(&self) -> Result<Pdfium, ToolError> {
        let bindings = match &self.library_dir {
            Some(dir) => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            }
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| ToolError::Unavailable {
            tool: Self::TOOL.into(),
            detail: format!("{:?}", e),
        })?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfRasterizer for PdfiumRasterizer {
    fn name(&self) -> &str {
        Self::TOOL
    }

    fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        first_page: usize,
        last_page: usize,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ToolError> {
        let failed = |detail: String| ToolError::InvocationFailed {
            tool: Self::TOOL.into(),
            detail,
        };

        std::fs::create_dir_all(out_dir).map_err(|e| ToolError::io(Self::TOOL, e))?;
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(pdf, None)
            .map_err(|e| failed(format!("cannot open {}: {:?}", pdf.display(), e)))?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);

        let first = first_page.max(1);
        let last = last_page.min(total_pages);
        let mut produced = Vec::with_capacity(last.saturating_sub(first) + 1);

        for page_num in first..=last {
            let page = pages
                .get((page_num - 1) as u16)
                .map_err(|e| failed(format!("page {}: {:?}", page_num, e)))?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| failed(format!("page {}: {:?}", page_num, e)))?;

            let image = bitmap.as_image();
            let path = out_dir.join(format!("page_{:04}.png", page_num));
            image
                .save_with_format(&path, image::ImageFormat::Png)
                .map_err(|e| failed(format!("page {}: {}", page_num, e)))?;
            debug!(
                "Rendered page {} → {}x{} px",
                page_num,
                image.width(),
                image.height()
            );
            produced.push(path);
        }

        info!(
            "pdfium rendered pages {}-{} of {} at {} DPI",
            first, last, total_pages, dpi
        );
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_dir_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let rasterizer = PdfiumRasterizer::new(Some(dir.path().join("no-pdfium-here")));
        let err = rasterizer
            .rasterize(Path::new("x.pdf"), 100, 1, 1, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, ToolError::Unavailable { .. }), "got {err:?}");
    }
}
