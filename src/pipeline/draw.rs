//! Internal slide renderer: draws a [`Slide`] from its shape geometry when no
//! external tool could.
//!
//! Fidelity is approximate. The slide background is painted first, then
//! solid shape fills and pictures in z-order, then text blocks on top. Text
//! is laid out as SVG and rasterised with `resvg` using the system fonts;
//! wrapping is character by character against the shape width using an
//! estimated advance (full-width for East Asian characters).
//!
//! Each shape is drawn independently. A shape that fails to draw is skipped
//! and does not affect the others.

use crate::deck::{emu_to_px, emu_to_px_signed, Deck, Rgb, Shape, ShapeKind, Slide};
use image::imageops::FilterType;
use once_cell::sync::Lazy;
use resvg::tiny_skia::{self, IntSize, Paint, Pixmap, PixmapPaint, Rect, Transform};
use resvg::usvg::{self, fontdb};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

/// Background used when a slide has no solid fill.
pub const DEFAULT_BACKGROUND: Rgb = Rgb(30, 30, 30);
const DEFAULT_FONT_PT: f32 = 24.0;
const LINE_SPACING: f32 = 1.2;
/// Longest canvas edge the renderer will allocate, in pixels.
pub const MAX_CANVAS_EDGE: u32 = 16_384;

/// Why one element (or a whole slide) could not be drawn.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("canvas of {width}x{height} px cannot be allocated")]
    Canvas { width: u32, height: u32 },

    #[error("picture could not be decoded: {0}")]
    Picture(#[from] image::ImageError),

    #[error("text layout failed: {0}")]
    Text(String),

    #[error("could not write image: {0}")]
    Write(String),
}

// ── Shared font database ─────────────────────────────────────────────────

static FONTS: Lazy<Mutex<Option<Arc<fontdb::Database>>>> = Lazy::new(|| Mutex::new(None));

/// The system font database, loaded on first use.
fn fonts() -> Arc<fontdb::Database> {
    let mut slot = FONTS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(db) = slot.as_ref() {
        return Arc::clone(db);
    }
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    debug!("Loaded {} system font faces", db.len());
    let db = Arc::new(db);
    *slot = Some(Arc::clone(&db));
    db
}

/// Drop the cached font database. It is reloaded lazily by the next render.
///
/// Returns whether a database was held.
pub fn release_fonts() -> bool {
    FONTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .is_some()
}

// ── Slide rendering ──────────────────────────────────────────────────────

/// Render slide `index` of `deck` at `dpi` and write it as PNG to `out`.
///
/// Returns the number of elements drawn. When it is zero nothing is written
/// and the caller should fall back to a placeholder.
pub fn render_slide(deck: &Deck, index: usize, dpi: u32, out: &Path) -> Result<usize, RenderError> {
    let Some(slide) = deck.slides.get(index) else {
        return Ok(0);
    };
    let width = emu_to_px(deck.slide_width, dpi);
    let height = emu_to_px(deck.slide_height, dpi);
    let mut canvas = Canvas::new(width, height, slide.background.unwrap_or(DEFAULT_BACKGROUND))?;

    let drawn = draw_shapes(&mut canvas, slide, dpi);
    if drawn > 0 {
        canvas.save(out)?;
    }
    Ok(drawn)
}

fn draw_shapes(canvas: &mut Canvas, slide: &Slide, dpi: u32) -> usize {
    let mut drawn = 0;

    for (i, shape) in slide.shapes.iter().enumerate() {
        let result = match shape.kind {
            ShapeKind::Picture => canvas.picture(shape, dpi),
            _ => Ok(canvas.fill(shape, dpi)),
        };
        match result {
            Ok(true) => drawn += 1,
            Ok(false) => {}
            Err(e) => debug!("Skipping shape {}: {}", i, e),
        }
    }

    for (i, shape) in slide.shapes.iter().enumerate() {
        if shape.kind == ShapeKind::Picture {
            continue;
        }
        match canvas.text(shape, dpi) {
            Ok(true) => drawn += 1,
            Ok(false) => {}
            Err(e) => debug!("Skipping text of shape {}: {}", i, e),
        }
    }
    drawn
}

/// Write a placeholder thumbnail for slide `number` (1-based).
pub fn write_placeholder(number: usize, size: (u32, u32), out: &Path) -> Result<(), RenderError> {
    let (width, height) = size;
    let mut canvas = Canvas::new(width, height, DEFAULT_BACKGROUND)?;

    let title = [format!("Slide {number}")];
    let body = [
        "No rendering tool produced a preview for this slide.".to_string(),
        "Install LibreOffice for accurate thumbnails.".to_string(),
    ];
    // Text is decoration; a host without fonts still gets the plain image.
    if let Err(e) = canvas.centered_lines(&title, 56.0, height as f32 * 0.3, Rgb(240, 240, 240)) {
        trace!("Placeholder title not drawn: {}", e);
    }
    if let Err(e) = canvas.centered_lines(&body, 28.0, height as f32 * 0.5, Rgb(200, 200, 200)) {
        trace!("Placeholder body not drawn: {}", e);
    }
    canvas.save(out)
}

// ── Canvas ───────────────────────────────────────────────────────────────

struct Canvas {
    pixmap: Pixmap,
}

impl Canvas {
    fn new(width: u32, height: u32, background: Rgb) -> Result<Self, RenderError> {
        if width > MAX_CANVAS_EDGE || height > MAX_CANVAS_EDGE {
            return Err(RenderError::Canvas { width, height });
        }
        let mut pixmap = Pixmap::new(width, height).ok_or(RenderError::Canvas { width, height })?;
        pixmap.fill(tiny_skia::Color::from_rgba8(background.0, background.1, background.2, 255));
        Ok(Self { pixmap })
    }

    fn width(&self) -> u32 {
        self.pixmap.width()
    }

    fn height(&self) -> u32 {
        self.pixmap.height()
    }

    fn fill(&mut self, shape: &Shape, dpi: u32) -> bool {
        let Some(color) = shape.fill else {
            return false;
        };
        let rect = Rect::from_xywh(
            emu_to_px_signed(shape.left, dpi) as f32,
            emu_to_px_signed(shape.top, dpi) as f32,
            emu_to_px(shape.width, dpi) as f32,
            emu_to_px(shape.height, dpi) as f32,
        );
        let Some(rect) = rect else {
            return false;
        };
        let mut paint = Paint::default();
        paint.set_color_rgba8(color.0, color.1, color.2, 255);
        self.pixmap.fill_rect(rect, &paint, Transform::identity(), None);
        true
    }

    fn picture(&mut self, shape: &Shape, dpi: u32) -> Result<bool, RenderError> {
        let Some(bytes) = shape.picture.as_deref() else {
            return Ok(false);
        };
        let left = emu_to_px_signed(shape.left, dpi);
        let top = emu_to_px_signed(shape.top, dpi);
        let width = emu_to_px(shape.width, dpi) as i64;
        let height = emu_to_px(shape.height, dpi) as i64;

        // Only the part of the picture that lands on the canvas is scaled.
        let x0 = left.max(0);
        let y0 = top.max(0);
        let x1 = (left + width).min(self.width() as i64);
        let y1 = (top + height).min(self.height() as i64);
        if x0 >= x1 || y0 >= y1 {
            return Ok(false);
        }

        let source = image::load_from_memory(bytes)?;
        let (sw, sh) = (source.width() as f64, source.height() as f64);
        let to_src_x = |x: i64| ((x - left) as f64 * sw / width as f64) as u32;
        let to_src_y = |y: i64| ((y - top) as f64 * sh / height as f64) as u32;
        let crop_x = to_src_x(x0).min(source.width().saturating_sub(1));
        let crop_y = to_src_y(y0).min(source.height().saturating_sub(1));
        let crop_w = to_src_x(x1).clamp(crop_x + 1, source.width().max(1)) - crop_x;
        let crop_h = to_src_y(y1).clamp(crop_y + 1, source.height().max(1)) - crop_y;

        let (vis_w, vis_h) = ((x1 - x0) as u32, (y1 - y0) as u32);
        let rgba = source
            .crop_imm(crop_x, crop_y, crop_w, crop_h)
            .resize_exact(vis_w, vis_h, FilterType::Lanczos3)
            .to_rgba8();

        let mut data = rgba.into_raw();
        premultiply(&mut data);
        let picture = IntSize::from_wh(vis_w, vis_h)
            .and_then(|size| Pixmap::from_vec(data, size))
            .ok_or(RenderError::Canvas {
                width: vis_w,
                height: vis_h,
            })?;

        self.pixmap.draw_pixmap(
            x0 as i32,
            y0 as i32,
            picture.as_ref(),
            &PixmapPaint::default(),
            Transform::identity(),
            None,
        );
        Ok(true)
    }

    fn text(&mut self, shape: &Shape, dpi: u32) -> Result<bool, RenderError> {
        if !shape.has_visible_text() {
            return Ok(false);
        }
        let run = shape.first_styled_run();
        let size_pt = run.and_then(|r| r.font_size_pt).unwrap_or(DEFAULT_FONT_PT);
        let color = run.and_then(|r| r.color).unwrap_or(Rgb::BLACK);
        let family = run.and_then(|r| r.font.clone());
        let font_px = size_pt * dpi as f32 / 72.0;

        let max_width = emu_to_px(shape.width, dpi) as f32;
        let lines: Vec<String> = shape
            .paragraph_texts()
            .iter()
            .flat_map(|p| wrap_chars(p, font_px, max_width))
            .collect();

        let left = emu_to_px_signed(shape.left, dpi) as f32;
        let top = emu_to_px_signed(shape.top, dpi) as f32;
        let svg = text_svg(
            self.width(),
            self.height(),
            &lines,
            |_, _| left,
            top,
            font_px,
            family.as_deref(),
            color,
        );
        self.draw_svg(&svg)?;
        Ok(lines.iter().any(|l| !l.is_empty()))
    }

    fn centered_lines(
        &mut self,
        lines: &[String],
        font_px: f32,
        top: f32,
        color: Rgb,
    ) -> Result<(), RenderError> {
        let canvas_width = self.width() as f32;
        let svg = text_svg(
            self.width(),
            self.height(),
            lines,
            |_, line| ((canvas_width - estimate_width(line, font_px)) / 2.0).max(0.0),
            top,
            font_px,
            None,
            color,
        );
        self.draw_svg(&svg)
    }

    fn draw_svg(&mut self, svg: &str) -> Result<(), RenderError> {
        let mut options = usvg::Options::default();
        options.fontdb = fonts();
        let tree =
            usvg::Tree::from_str(svg, &options).map_err(|e| RenderError::Text(e.to_string()))?;
        resvg::render(&tree, Transform::identity(), &mut self.pixmap.as_mut());
        Ok(())
    }

    fn save(&self, out: &Path) -> Result<(), RenderError> {
        // The canvas is opaque, so premultiplied and straight alpha coincide.
        let img = image::RgbaImage::from_raw(self.width(), self.height(), self.pixmap.data().to_vec())
            .ok_or_else(|| RenderError::Write("pixel buffer size mismatch".into()))?;
        image::DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .save_with_format(out, image::ImageFormat::Png)
            .map_err(|e| RenderError::Write(format!("{}: {}", out.display(), e)))
    }
}

fn premultiply(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        for c in &mut px[..3] {
            *c = ((*c as u16 * a + 127) / 255) as u8;
        }
    }
}

// ── Text layout ──────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn text_svg(
    width: u32,
    height: u32,
    lines: &[String],
    x_for: impl Fn(usize, &str) -> f32,
    top: f32,
    font_px: f32,
    family: Option<&str>,
    color: Rgb,
) -> String {
    let family = match family {
        Some(f) => format!("'{}', sans-serif", escape_xml(f)),
        None => "sans-serif".to_string(),
    };
    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    );
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let baseline = top + font_px * (1.0 + i as f32 * LINE_SPACING);
        svg.push_str(&format!(
            r#"<text x="{x:.1}" y="{baseline:.1}" font-family="{family}" font-size="{font_px:.1}" fill="{fill}" xml:space="preserve">{text}</text>"#,
            x = x_for(i, line),
            fill = color.to_hex(),
            text = escape_xml(line),
        ));
    }
    svg.push_str("</svg>");
    svg
}

/// Break `text` into lines no wider than `max_width`, one character at a
/// time. A line always holds at least one character. Empty input yields one
/// empty line so paragraph spacing is kept.
fn wrap_chars(text: &str, font_px: f32, max_width: f32) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0.0f32;
    for c in text.chars() {
        let advance = char_advance(c, font_px);
        if current.is_empty() || current_width + advance <= max_width {
            current.push(c);
            current_width += advance;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push(c);
            current_width = advance;
        }
    }
    lines.push(current);
    lines
}

fn estimate_width(text: &str, font_px: f32) -> f32 {
    text.chars().map(|c| char_advance(c, font_px)).sum()
}

fn char_advance(c: char, font_px: f32) -> f32 {
    if is_wide(c) {
        font_px
    } else if c == ' ' {
        font_px * 0.3
    } else {
        font_px * 0.6
    }
}

fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x1100..=0x115F
        | 0x2E80..=0x303E
        | 0x3041..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xA000..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6
        | 0x20000..=0x3FFFD)
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
