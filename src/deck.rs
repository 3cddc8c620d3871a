//! Structural description of a presentation, and how to read one.
//!
//! The thumbnail pipeline and the script builder never touch a presentation
//! file format directly; they consume a [`Deck`]. A [`DeckReader`] turns a
//! file on disk into a `Deck`. The crate ships [`JsonDeckReader`], which
//! reads the serialised form of this model; hosts that read `.pptx`
//! directly plug in their own reader.
//!
//! All geometry is in EMU (English Metric Units, 914 400 per inch), the unit
//! presentation formats store natively.

use crate::error::ScriptDeckError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// EMU per inch.
pub const EMU_PER_INCH: i64 = 914_400;

/// Convert a length in EMU to whole pixels at `dpi`. Never returns 0.
pub fn emu_to_px(emu: i64, dpi: u32) -> u32 {
    let px = (emu as f64 * dpi as f64 / EMU_PER_INCH as f64).round();
    px.max(1.0).min(u32::MAX as f64) as u32
}

/// Signed variant of [`emu_to_px`] for offsets, which may be negative.
pub fn emu_to_px_signed(emu: i64, dpi: u32) -> i64 {
    (emu as f64 * dpi as f64 / EMU_PER_INCH as f64).round() as i64
}

// ── Colour ───────────────────────────────────────────────────────────────

/// An sRGB colour, serialised as `"#RRGGBB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0, 0, 0);
    pub const WHITE: Rgb = Rgb(0xFF, 0xFF, 0xFF);

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.0, self.1, self.2)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Rgb {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("invalid colour {value:?}, expected #RRGGBB"));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| format!("invalid colour {value:?}, expected #RRGGBB"))
        };
        Ok(Rgb(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_hex()
    }
}

// ── Deck model ───────────────────────────────────────────────────────────

/// A presentation: page size plus ordered slides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deck {
    /// Slide width in EMU. Default: 12 192 000 (13.333 in, 16:9).
    #[serde(default = "default_slide_width")]
    pub slide_width: i64,
    /// Slide height in EMU. Default: 6 858 000 (7.5 in).
    #[serde(default = "default_slide_height")]
    pub slide_height: i64,
    #[serde(default)]
    pub slides: Vec<Slide>,
}

fn default_slide_width() -> i64 {
    12_192_000
}

fn default_slide_height() -> i64 {
    6_858_000
}

impl Default for Deck {
    fn default() -> Self {
        Self {
            slide_width: default_slide_width(),
            slide_height: default_slide_height(),
            slides: Vec::new(),
        }
    }
}

impl Deck {
    pub fn slide_count(&self) -> usize {
        self.slides.len()
    }
}

/// One slide: its speaker notes and the shapes drawn on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    #[serde(default)]
    pub notes: String,
    /// Solid background fill; `None` means no solid fill is defined.
    #[serde(default)]
    pub background: Option<Rgb>,
    #[serde(default)]
    pub shapes: Vec<Shape>,
}

impl Slide {
    pub fn has_notes(&self) -> bool {
        !self.notes.trim().is_empty()
    }
}

/// What kind of object a shape is. Only pictures are drawn differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Picture,
    #[default]
    AutoShape,
    TextBox,
    Other,
}

/// A positioned shape with optional fill, picture data and text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    #[serde(default)]
    pub kind: ShapeKind,
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
    /// Solid fill colour, if the shape has one.
    #[serde(default)]
    pub fill: Option<Rgb>,
    /// Encoded image bytes (PNG/JPEG) for picture shapes.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub picture: Option<Vec<u8>>,
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
}

impl Shape {
    /// Plain text of each paragraph, in order.
    pub fn paragraph_texts(&self) -> Vec<String> {
        self.paragraphs
            .iter()
            .map(|p| p.runs.iter().map(|r| r.text.as_str()).collect())
            .collect()
    }

    pub fn has_visible_text(&self) -> bool {
        self.paragraphs
            .iter()
            .flat_map(|p| p.runs.iter())
            .any(|r| !r.text.trim().is_empty())
    }

    /// The first run carrying non-blank text; its style applies to the block.
    pub fn first_styled_run(&self) -> Option<&TextRun> {
        self.paragraphs
            .iter()
            .flat_map(|p| p.runs.iter())
            .find(|r| !r.text.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub runs: Vec<TextRun>,
}

/// A run of text sharing one style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default)]
    pub font_size_pt: Option<f32>,
    #[serde(default)]
    pub color: Option<Rgb>,
    #[serde(default)]
    pub font: Option<String>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ── Readers ──────────────────────────────────────────────────────────────

/// Reads a presentation file into a [`Deck`].
///
/// Implementations are shared across jobs and must be `Send + Sync`.
pub trait DeckReader: Send + Sync {
    /// Lower-case file extensions (without the dot) this reader accepts.
    fn extensions(&self) -> &[&'static str];

    /// Parse the file at `path`.
    fn read(&self, path: &Path) -> Result<Deck, ScriptDeckError>;

    /// Whether the files this reader parses are office documents that
    /// LibreOffice or PowerPoint can open. When false, thumbnails come from
    /// the internal renderer only.
    fn office_document(&self) -> bool {
        true
    }

    /// Whether `file_name` carries one of [`Self::extensions`].
    fn accepts(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.extensions()
            .iter()
            .any(|ext| lower.ends_with(&format!(".{ext}")))
    }
}

/// Reads the JSON serialisation of [`Deck`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDeckReader;

impl DeckReader for JsonDeckReader {
    fn extensions(&self) -> &[&'static str] {
        &["json"]
    }

    fn office_document(&self) -> bool {
        false
    }

    fn read(&self, path: &Path) -> Result<Deck, ScriptDeckError> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ScriptDeckError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => ScriptDeckError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => ScriptDeckError::DeckUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        })?;
        let deck: Deck =
            serde_json::from_slice(&bytes).map_err(|e| ScriptDeckError::DeckUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        if deck.slide_width <= 0 || deck.slide_height <= 0 {
            return Err(ScriptDeckError::DeckUnreadable {
                path: path.to_path_buf(),
                detail: format!(
                    "slide size must be positive, got {}x{} EMU",
                    deck.slide_width, deck.slide_height
                ),
            });
        }
        debug!(
            "Read deck {}: {} slides",
            path.display(),
            deck.slide_count()
        );
        Ok(deck)
    }
}
