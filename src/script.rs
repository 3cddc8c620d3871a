//! Script slides: notes chunks laid out next to the source slide's thumbnail,
//! and the writer that turns them into the output document.
//!
//! Each slide with notes yields one or more [`ScriptSlide`]s (one per chunk
//! from [`crate::segment::segment_notes`]). Layout follows a fixed template on
//! the source deck's page size: black background, large bold text top-left
//! coloured per speaker, the thumbnail pinned bottom-right, and a `part/parts`
//! indicator beside the thumbnail when a slide's notes span several parts.

use crate::deck::{Deck, Rgb};
use crate::error::ScriptDeckError;
use crate::pipeline::encode::encode_thumbnail;
use crate::pipeline::ThumbnailSet;
use crate::progress::{emit, JobLog};
use crate::segment::{segment_notes, Segment};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// EMU per centimetre.
pub const EMU_PER_CM: i64 = 360_000;

fn cm(v: f64) -> i64 {
    (v * EMU_PER_CM as f64).round() as i64
}

/// One output slide: a chunk of one source slide's notes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSlide {
    /// 1-based index of the source slide.
    pub source_slide: usize,
    /// 1-based part number within the source slide.
    pub part: usize,
    pub parts: usize,
    pub segments: Vec<Segment>,
    pub thumbnail: Option<PathBuf>,
}

/// Text colour for a speaker tag. Speakers 1–3 get fixed colours; anyone
/// else (and untagged text) is white.
pub fn speaker_color(speaker: Option<&str>) -> Rgb {
    let number = speaker.and_then(|s| {
        s.trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse::<u32>()
            .ok()
    });
    match number {
        Some(1) => Rgb(0xFF, 0xFF, 0x00),
        Some(2) => Rgb(0x00, 0xFF, 0xFF),
        Some(3) => Rgb(0x00, 0xF9, 0x00),
        _ => Rgb::WHITE,
    }
}

/// Split every slide's notes into script slides, in deck order.
///
/// Slides with blank notes are skipped (and logged).
pub fn build_script_slides(
    deck: &Deck,
    thumbnails: &ThumbnailSet,
    max_chars: usize,
    log: &dyn JobLog,
) -> Vec<ScriptSlide> {
    let total = deck.slide_count();
    let mut out = Vec::new();

    for (idx, slide) in deck.slides.iter().enumerate() {
        let number = idx + 1;
        if !slide.has_notes() {
            emit(log, format!("Slide {number}: notes are empty, skipping"));
            continue;
        }
        let chunks = segment_notes(&slide.notes, max_chars);
        let segment_count: usize = chunks.iter().map(Vec::len).sum();
        emit(
            log,
            format!(
                "Slide {number}/{total}: {segment_count} segments -> {} parts",
                chunks.len()
            ),
        );

        let parts = chunks.len();
        let thumbnail = thumbnails.get(idx).map(|t| t.path.clone());
        out.extend(chunks.into_iter().enumerate().map(|(i, segments)| ScriptSlide {
            source_slide: number,
            part: i + 1,
            parts,
            segments,
            thumbnail: thumbnail.clone(),
        }));
    }
    out
}

// ── Layout ───────────────────────────────────────────────────────────────

/// Fixed presentation style of script slides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStyle {
    pub font_name: String,
    pub font_size_pt: f32,
    pub bold: bool,
    pub background: Rgb,
    pub indicator_color: Rgb,
    pub thumbnail_width_cm: f64,
}

impl Default for ScriptStyle {
    fn default() -> Self {
        Self {
            font_name: "メイリオ".to_string(),
            font_size_pt: 40.0,
            bold: true,
            background: Rgb::BLACK,
            indicator_color: Rgb(0x00, 0xB0, 0xF0),
            thumbnail_width_cm: 8.0,
        }
    }
}

/// A rectangle in EMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
}

const THUMB_MARGIN_CM: f64 = 0.1;
const TEXT_MARGIN_CM: f64 = 0.5;

/// Thumbnail pinned to the bottom-right corner, scaled to the style width.
fn thumbnail_frame(slide_w: i64, slide_h: i64, img_w: u32, img_h: u32, style: &ScriptStyle) -> Frame {
    let width = cm(style.thumbnail_width_cm);
    let height = (width as f64 * img_h as f64 / img_w.max(1) as f64).round() as i64;
    Frame {
        left: slide_w - width - cm(THUMB_MARGIN_CM),
        top: slide_h - height - cm(THUMB_MARGIN_CM),
        width,
        height,
    }
}

/// Text area top-left, stopping short of the thumbnail when there is one.
fn text_frame(slide_w: i64, slide_h: i64, thumb: Option<&Frame>) -> Frame {
    let left = cm(0.79);
    let top = cm(0.8);
    let width = match thumb {
        Some(t) => (t.left - cm(TEXT_MARGIN_CM) - left).max(cm(6.0)),
        None => (slide_w - left - cm(TEXT_MARGIN_CM)).max(cm(10.0)),
    };
    Frame {
        left,
        top,
        width,
        height: (slide_h - top - cm(TEXT_MARGIN_CM + 0.5)).max(cm(5.0)),
    }
}

/// `part/parts` label left of the thumbnail, vertically centred on it.
fn indicator_frame(slide_w: i64, slide_h: i64, thumb: Option<&Frame>, style: &ScriptStyle) -> Frame {
    let margin = cm(THUMB_MARGIN_CM);
    let width = cm(4.0);
    let height = cm(1.5);
    match thumb {
        Some(t) => Frame {
            left: (t.left - width - margin).max(margin),
            top: t.top + ((t.height - height) / 2).max(0),
            width,
            height,
        },
        None => {
            let thumb_h = cm(style.thumbnail_width_cm * 9.0 / 16.0);
            Frame {
                left: slide_w - width - margin,
                top: slide_h - thumb_h - height - cm(0.5),
                width,
                height,
            }
        }
    }
}

// ── Output document ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptParagraph {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub color: Rgb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageIndicator {
    pub text: String,
    pub frame: Frame,
    pub color: Rgb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedThumbnail {
    pub frame: Frame,
    pub png_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPage {
    pub source_slide: usize,
    pub part: usize,
    pub parts: usize,
    pub text_frame: Frame,
    pub paragraphs: Vec<ScriptParagraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_indicator: Option<PageIndicator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbeddedThumbnail>,
}

/// The complete laid-out script deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDocument {
    pub slide_width: i64,
    pub slide_height: i64,
    pub style: ScriptStyle,
    pub slides: Vec<ScriptPage>,
}

impl ScriptDocument {
    /// Lay out `slides` on `deck`'s page size. Thumbnails that cannot be read
    /// are left out of their page.
    pub fn layout(deck: &Deck, slides: &[ScriptSlide], style: ScriptStyle) -> Self {
        let (w, h) = (deck.slide_width, deck.slide_height);
        let pages = slides
            .iter()
            .map(|s| {
                let thumbnail = s.thumbnail.as_deref().and_then(|p| embed(p, w, h, &style));
                let thumb_frame = thumbnail.as_ref().map(|t| t.frame);
                ScriptPage {
                    source_slide: s.source_slide,
                    part: s.part,
                    parts: s.parts,
                    text_frame: text_frame(w, h, thumb_frame.as_ref()),
                    paragraphs: s
                        .segments
                        .iter()
                        .map(|seg| ScriptParagraph {
                            text: seg.text.clone(),
                            speaker: seg.speaker.clone(),
                            color: speaker_color(seg.speaker.as_deref()),
                        })
                        .collect(),
                    page_indicator: (s.parts > 1).then(|| PageIndicator {
                        text: format!("{}/{}", s.part, s.parts),
                        frame: indicator_frame(w, h, thumb_frame.as_ref(), &style),
                        color: style.indicator_color,
                    }),
                    thumbnail,
                }
            })
            .collect();
        Self {
            slide_width: w,
            slide_height: h,
            style,
            slides: pages,
        }
    }
}

fn embed(path: &Path, slide_w: i64, slide_h: i64, style: &ScriptStyle) -> Option<EmbeddedThumbnail> {
    let dims = image::image_dimensions(path);
    let encoded = dims.and_then(|dims| encode_thumbnail(path).map(|b64| (dims, b64)));
    match encoded {
        Ok(((img_w, img_h), png_base64)) => Some(EmbeddedThumbnail {
            frame: thumbnail_frame(slide_w, slide_h, img_w, img_h, style),
            png_base64,
        }),
        Err(e) => {
            warn!("Thumbnail {} could not be embedded: {}", path.display(), e);
            None
        }
    }
}

// ── Writers ──────────────────────────────────────────────────────────────

/// Writes the script deck to a file.
pub trait ScriptWriter: Send + Sync {
    /// Lay out and write `slides` (built from `deck`) to `out`.
    fn write(&self, deck: &Deck, slides: &[ScriptSlide], out: &Path) -> Result<(), ScriptDeckError>;
}

/// Writes a [`ScriptDocument`] as pretty-printed JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonScriptWriter {
    pub style: ScriptStyle,
}

impl ScriptWriter for JsonScriptWriter {
    fn write(&self, deck: &Deck, slides: &[ScriptSlide], out: &Path) -> Result<(), ScriptDeckError> {
        let doc = ScriptDocument::layout(deck, slides, self.style.clone());
        let write_err = |e: std::io::Error| ScriptDeckError::OutputWriteFailed {
            path: out.to_path_buf(),
            source: e,
        };

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        // Atomic write: temp file beside the target, then rename.
        let dir = out.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        serde_json::to_writer_pretty(&mut tmp, &doc).map_err(|e| write_err(e.into()))?;
        tmp.flush().map_err(write_err)?;
        tmp.persist(out).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_colours() {
        assert_eq!(speaker_color(Some("話者1")), Rgb(0xFF, 0xFF, 0x00));
        assert_eq!(speaker_color(Some("Speaker 2")), Rgb(0x00, 0xFF, 0xFF));
        assert_eq!(speaker_color(Some("話者3")), Rgb(0x00, 0xF9, 0x00));
        assert_eq!(speaker_color(Some("話者4")), Rgb::WHITE);
        assert_eq!(speaker_color(None), Rgb::WHITE);
    }

    #[test]
    fn thumbnail_sits_bottom_right_and_text_avoids_it() {
        let style = ScriptStyle::default();
        let (w, h) = (12_192_000, 6_858_000);
        let thumb = thumbnail_frame(w, h, 1600, 900, &style);
        assert_eq!(thumb.width, cm(8.0));
        assert_eq!(thumb.height, cm(4.5));
        assert_eq!(thumb.left + thumb.width + cm(0.1), w);
        assert_eq!(thumb.top + thumb.height + cm(0.1), h);

        let text = text_frame(w, h, Some(&thumb));
        assert!(text.left + text.width <= thumb.left);

        let ind = indicator_frame(w, h, Some(&thumb), &style);
        assert!(ind.left + ind.width <= thumb.left);
    }

    #[test]
    fn layout_adds_indicator_only_for_multi_part_slides() {
        let deck = Deck::default();
        let seg = |t: &str| Segment {
            text: t.into(),
            speaker: None,
        };
        let slides = vec![
            ScriptSlide {
                source_slide: 1,
                part: 1,
                parts: 1,
                segments: vec![seg("a")],
                thumbnail: None,
            },
            ScriptSlide {
                source_slide: 2,
                part: 2,
                parts: 3,
                segments: vec![seg("b")],
                thumbnail: Some(PathBuf::from("/missing/thumb.png")),
            },
        ];
        let doc = ScriptDocument::layout(&deck, &slides, ScriptStyle::default());
        assert!(doc.slides[0].page_indicator.is_none());
        assert_eq!(doc.slides[1].page_indicator.as_ref().unwrap().text, "2/3");
        assert!(doc.slides[1].thumbnail.is_none(), "unreadable thumbnail is dropped");
    }
}
