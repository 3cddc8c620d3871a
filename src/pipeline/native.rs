//! Host-application export: ask an installed PowerPoint to write one PNG per
//! slide.
//!
//! Windows drives PowerPoint through COM from a PowerShell one-liner; macOS
//! drives it through AppleScript via `osascript`. Both write `Slide1.png`,
//! `Slide2.png`, … (sometimes with an upper-case extension) into the target
//! directory. Other platforms have no exporter.

use crate::error::ToolError;
use crate::pipeline::tools::sorted_outputs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// Exports every slide of a presentation as an image using a host application.
pub trait NativeExporter: Send + Sync {
    fn name(&self) -> &str;

    /// Export `input` into `out_dir`; returns the images in slide order.
    fn export(&self, input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ToolError>;
}

/// The exporter for the current platform, if it has one.
pub fn host_exporter() -> Option<Arc<dyn NativeExporter>> {
    if cfg!(target_os = "windows") {
        Some(Arc::new(PowerPointExporter::windows()))
    } else if cfg!(target_os = "macos") {
        Some(Arc::new(PowerPointExporter::macos()))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bridge {
    /// PowerShell + `PowerPoint.Application` COM object.
    Com,
    /// `osascript` + PowerPoint's AppleScript dictionary.
    AppleScript,
}

/// PowerPoint driven through the platform's automation bridge.
#[derive(Debug, Clone)]
pub struct PowerPointExporter {
    bridge: Bridge,
}

impl PowerPointExporter {
    pub fn windows() -> Self {
        Self { bridge: Bridge::Com }
    }

    pub fn macos() -> Self {
        Self {
            bridge: Bridge::AppleScript,
        }
    }

    fn command(&self, input: &Path, out_dir: &Path) -> (&'static str, Vec<String>) {
        match self.bridge {
            Bridge::Com => (
                "powershell",
                vec![
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    powershell_script(input, out_dir),
                ],
            ),
            Bridge::AppleScript => ("osascript", vec!["-e".into(), applescript(input, out_dir)]),
        }
    }
}

impl NativeExporter for PowerPointExporter {
    fn name(&self) -> &str {
        match self.bridge {
            Bridge::Com => "powerpoint-com",
            Bridge::AppleScript => "powerpoint-applescript",
        }
    }

    fn export(&self, input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ToolError> {
        let tool = self.name().to_string();
        std::fs::create_dir_all(out_dir).map_err(|e| ToolError::io(&tool, e))?;

        let (program, args) = self.command(input, out_dir);
        let output = Command::new(program).args(&args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::Unavailable {
                    tool: tool.clone(),
                    detail: format!("{program} not found"),
                }
            } else {
                ToolError::InvocationFailed {
                    tool: tool.clone(),
                    detail: e.to_string(),
                }
            }
        })?;

        if !output.status.success() {
            return Err(ToolError::InvocationFailed {
                tool,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let exported = slide_images(out_dir).map_err(|e| ToolError::io(&tool, e))?;
        debug!("{} exported {} images", tool, exported.len());
        Ok(exported)
    }
}

/// `Slide*.png` files (any extension case) in natural order.
fn slide_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    Ok(sorted_outputs(dir, "png")?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().starts_with("slide"))
                .unwrap_or(false)
        })
        .collect())
}

fn powershell_script(input: &Path, out_dir: &Path) -> String {
    // Single quotes are literal in PowerShell; a quote inside is doubled.
    let quote = |p: &Path| format!("'{}'", p.display().to_string().replace('\'', "''"));
    format!(
        "$ErrorActionPreference = 'Stop'; \
         $app = New-Object -ComObject PowerPoint.Application; \
         try {{ \
           $pres = $app.Presentations.Open({input}, $true, $false, $false); \
           try {{ $pres.Export({out}, 'PNG') }} finally {{ $pres.Close() }} \
         }} finally {{ $app.Quit() }}",
        input = quote(input),
        out = quote(out_dir),
    )
}

fn applescript(input: &Path, out_dir: &Path) -> String {
    let quote = |p: &Path| p.display().to_string().replace('"', "\\\"");
    format!(
        "tell application \"Microsoft PowerPoint\"\n\
         \tset thePresentation to open POSIX file \"{}\" with read only\n\
         \tsave thePresentation in POSIX file \"{}\" as save as picture file format PNG\n\
         \tclose thePresentation saving no\n\
         end tell",
        quote(input),
        quote(out_dir)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_escape_quotes() {
        let ps = powershell_script(Path::new("C:/it's/deck.pptx"), Path::new("C:/out"));
        assert!(ps.contains("'C:/it''s/deck.pptx'"));
        assert!(ps.contains("'PNG'"));

        let osa = applescript(Path::new("/tmp/a\"b.pptx"), Path::new("/tmp/out"));
        assert!(osa.contains("/tmp/a\\\"b.pptx"));
        assert!(osa.contains("picture file format PNG"));
    }

    #[test]
    fn only_slide_images_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Slide2.PNG", "Slide1.png", "cover.png", "Slide3.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<_> = slide_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Slide1.png", "Slide2.PNG"]);
    }

    #[test]
    fn host_exporter_matches_platform() {
        let exporter = host_exporter();
        assert_eq!(
            exporter.is_some(),
            cfg!(any(target_os = "windows", target_os = "macos"))
        );
    }
}
