//! Thumbnail encoding: image file → base64 PNG for embedding in the script
//! document.
//!
//! Thumbnails from different tiers arrive as PNGs of varying size (a 150 DPI
//! batch render is far larger than what a script slide shows). Re-encoding
//! through `image` normalises them to PNG and caps the longest edge so the
//! written document stays a reasonable size.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Longest edge of an embedded thumbnail, in pixels.
pub const MAX_EMBED_EDGE: u32 = 1280;

/// Base64 PNG of the image at `path`, downscaled so neither edge exceeds
/// [`MAX_EMBED_EDGE`].
pub fn encode_thumbnail(path: &Path) -> Result<String, image::ImageError> {
    let mut img = image::open(path)?;
    if img.width() > MAX_EMBED_EDGE || img.height() > MAX_EMBED_EDGE {
        img = img.resize(MAX_EMBED_EDGE, MAX_EMBED_EDGE, FilterType::Triangle);
    }

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded {} → {} bytes base64", path.display(), b64.len());
    Ok(b64)
}
