//! External render tools used by the thumbnail tiers.
//!
//! Each tool sits behind a trait so the pipeline can be driven by fakes in
//! tests and by whatever happens to be installed in production. A tool that
//! is missing is not an error at construction time: [`RenderTools::detect`]
//! simply leaves the slot empty and the corresponding tier is skipped.
//!
//! ```text
//! OfficeConverter  presentation ─▶ PDF | PNG   (LibreOffice, headless)
//! PdfRasterizer    PDF pages    ─▶ PNG         (pdfium)
//! NativeExporter   presentation ─▶ PNG         (PowerPoint / Keynote)
//! ```

use crate::error::ToolError;
use crate::pipeline::native::{self, NativeExporter};
use crate::pipeline::render::{PdfRasterizer, PdfiumRasterizer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

/// Target format of an office conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Pdf,
    Png,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Png => "png",
        }
    }
}

/// Converts a presentation into another document format.
pub trait OfficeConverter: Send + Sync {
    /// Short tool name used in log lines and errors.
    fn name(&self) -> &str;

    /// Convert `input` into `format`, writing into `out_dir`. Returns the
    /// produced files in slide order.
    fn convert(
        &self,
        input: &Path,
        format: ExportFormat,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ToolError>;
}

// ── LibreOffice ──────────────────────────────────────────────────────────

/// Headless LibreOffice (`soffice --headless --convert-to`).
#[derive(Debug, Clone)]
pub struct LibreOffice {
    binary: PathBuf,
}

impl LibreOffice {
    const TOOL: &'static str = "libreoffice";

    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Locate `soffice` or `libreoffice` on `PATH`.
    pub fn detect() -> Option<Self> {
        ["soffice", "libreoffice"]
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(|binary| {
                debug!("Found LibreOffice at {}", binary.display());
                Self { binary }
            })
    }
}

impl OfficeConverter for LibreOffice {
    fn name(&self) -> &str {
        Self::TOOL
    }

    fn convert(
        &self,
        input: &Path,
        format: ExportFormat,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ToolError> {
        std::fs::create_dir_all(out_dir).map_err(|e| ToolError::io(Self::TOOL, e))?;

        let output = Command::new(&self.binary)
            .arg("--headless")
            .arg("--convert-to")
            .arg(format.extension())
            .arg("--outdir")
            .arg(out_dir)
            .arg(input)
            .output()
            .map_err(|e| ToolError::InvocationFailed {
                tool: Self::TOOL.into(),
                detail: format!("could not start {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(ToolError::InvocationFailed {
                tool: Self::TOOL.into(),
                detail: format!(
                    "exit {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let produced = sorted_outputs(out_dir, format.extension())
            .map_err(|e| ToolError::io(Self::TOOL, e))?;
        if produced.is_empty() {
            return Err(ToolError::InvocationFailed {
                tool: Self::TOOL.into(),
                detail: format!("no .{} output in {}", format.extension(), out_dir.display()),
            });
        }
        Ok(produced)
    }
}

// ── Tool bundle ──────────────────────────────────────────────────────────

/// The set of external tools available to the pipeline.
///
/// `None` disables the tiers that need that tool.
#[derive(Clone, Default)]
pub struct RenderTools {
    pub office: Option<Arc<dyn OfficeConverter>>,
    pub rasterizer: Option<Arc<dyn PdfRasterizer>>,
    pub native: Option<Arc<dyn NativeExporter>>,
}

impl fmt::Debug for RenderTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTools")
            .field("office", &self.office.as_ref().map(|t| t.name().to_string()))
            .field("rasterizer", &self.rasterizer.as_ref().map(|t| t.name().to_string()))
            .field("native", &self.native.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

impl RenderTools {
    /// Wire up whatever is installed on this host.
    pub fn detect() -> Self {
        let tools = Self {
            office: LibreOffice::detect().map(|lo| Arc::new(lo) as Arc<dyn OfficeConverter>),
            rasterizer: Some(Arc::new(PdfiumRasterizer::from_env())),
            native: native::host_exporter(),
        };
        info!("Render tools: {:?}", tools);
        tools
    }

    /// No external tools: every slide is rendered internally.
    pub fn internal_only() -> Self {
        Self::default()
    }

    pub fn with_office(mut self, office: Arc<dyn OfficeConverter>) -> Self {
        self.office = Some(office);
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn with_native(mut self, native: Arc<dyn NativeExporter>) -> Self {
        self.native = Some(native);
        self
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Files in `dir` with extension `ext` (case-insensitive), in natural order:
/// `Slide2.png` sorts before `Slide10.png`.
pub(crate) fn sorted_outputs(dir: &Path, ext: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
                .unwrap_or(false)
        })
        .collect();
    files.sort_by_key(|p| natural_key(p));
    Ok(files)
}

fn natural_key(path: &Path) -> (String, u64, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let digits_at = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(stem.len());
    let number = stem[digits_at..].parse().unwrap_or(0);
    (stem[..digits_at].to_string(), number, stem)
}
