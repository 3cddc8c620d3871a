//! Speaker-notes segmentation: notes text → bounded script chunks.
//!
//! Notes are split into lines; a leading `話者N:` / `Speaker N:` prefix tags
//! the line with a speaker. Long lines are broken at punctuation, then at
//! clause boundaries, and only as a last resort at a hard character count.
//! Segments are then packed greedily into chunks whose rendered text (one
//! segment per line) never exceeds the character bound. Each chunk becomes
//! one script slide.
//!
//! Lengths are counted in `char`s, not bytes: notes are frequently Japanese.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SPEAKER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*((?:話者|Speaker\s?)\d+)[:：]\s*(.*)$").expect("valid speaker regex")
});

static PHRASE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^。、，,.！？!?；;：:]+[。、，,.！？!?；;：:]?").expect("valid phrase regex")
});

/// Fallback break points for phrases longer than the bound, tried in order:
/// after a comma, after a sentence terminator, after any non-alphanumeric.
static BREAK_PATTERNS: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"^(.{1,80}[、,，])(.+)$").expect("valid comma break"),
        Regex::new(r"^(.{1,120}[。.！？!?])(.+)$").expect("valid sentence break"),
        Regex::new(r"^(.{1,60}[^a-zA-Z0-9]{1,2})(.+)$").expect("valid fallback break"),
    ]
});

/// One line of script text, optionally attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub speaker: Option<String>,
}

impl Segment {
    fn blank() -> Self {
        Self {
            text: String::new(),
            speaker: None,
        }
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Split `notes` into chunks of segments, each within `max_chars`.
///
/// Chunks that would contain only blank lines are dropped, so an empty or
/// whitespace-only note yields no chunks.
pub fn segment_notes(notes: &str, max_chars: usize) -> Vec<Vec<Segment>> {
    let max_chars = max_chars.max(1);
    chunk_segments(build_segments(notes, max_chars), max_chars)
        .into_iter()
        .filter(|chunk| chunk.iter().any(|s| !s.text.trim().is_empty()))
        .collect()
}

/// Convert raw notes into ordered segments with speaker metadata.
pub fn build_segments(notes: &str, max_chars: usize) -> Vec<Segment> {
    let normalized = notes.replace("\r\n", "\n").replace('\r', "\n");
    let mut segments = Vec::new();

    for raw_line in normalized.split('\n') {
        let stripped = raw_line.trim();
        if stripped.is_empty() {
            segments.push(Segment::blank());
            continue;
        }

        let (speaker, content) = match SPEAKER_PATTERN.captures(stripped) {
            Some(caps) => (
                caps.get(1).map(|m| m.as_str().to_string()),
                caps.get(2).map_or("", |m| m.as_str()).trim().to_string(),
            ),
            None => (None, stripped.to_string()),
        };

        // The speaker prefix is rendered in front of the first piece, so the
        // first piece gets correspondingly less room.
        let prefix = speaker.as_ref().map(|s| format!("{s}："));
        let prefix_len = prefix.as_ref().map_or(0, |p| p.chars().count());
        let bound = max_chars.saturating_sub(prefix_len).max(1);

        let mut pieces = segment_line(&content, bound);
        if pieces.is_empty() {
            pieces.push(content);
        }

        for (idx, piece) in pieces.into_iter().enumerate() {
            match (&prefix, idx) {
                (Some(prefix), 0) => segments.push(Segment {
                    text: format!("{prefix}{piece}"),
                    speaker: speaker.clone(),
                }),
                _ => segments.push(Segment {
                    text: piece,
                    speaker: None,
                }),
            }
        }
    }
    segments
}

/// Split one line into punctuation-aware pieces of at most `max_chars`.
pub fn segment_line(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();

    for phrase in PHRASE_PATTERN.find_iter(text) {
        let trimmed = phrase.as_str().trim();
        if trimmed.is_empty() {
            continue;
        }
        split_long(trimmed, max_chars, &mut pieces);
    }

    // A line made only of punctuation matches no phrase.
    if pieces.is_empty() && !text.trim().is_empty() {
        hard_split(text.trim(), max_chars, &mut pieces);
    }
    pieces
}

fn split_long(text: &str, max_chars: usize, out: &mut Vec<String>) {
    if text.chars().count() <= max_chars {
        out.push(text.to_string());
        return;
    }
    for pattern in BREAK_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let head = caps.get(1).map_or("", |m| m.as_str()).trim();
            let tail = caps.get(2).map_or("", |m| m.as_str()).trim();
            // Both halves are strictly shorter than `text`, so this recursion ends.
            if !head.is_empty() {
                split_long(head, max_chars, out);
            }
            if !tail.is_empty() {
                split_long(tail, max_chars, out);
            }
            return;
        }
    }
    hard_split(text, max_chars, out);
}

fn hard_split(text: &str, max_chars: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    out.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
}

/// Greedily pack segments into chunks whose joined text fits `max_chars`.
///
/// A chunk's length is the sum of its segment lengths (blank lines count as
/// one) plus one newline between consecutive segments.
pub fn chunk_segments(segments: Vec<Segment>, max_chars: usize) -> Vec<Vec<Segment>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Segment> = Vec::new();
    let mut current_len = 0usize;

    for seg in segments {
        let seg_len = seg.char_len().max(1);
        let additional = if current.is_empty() { seg_len } else { seg_len + 1 };
        if !current.is_empty() && current_len + additional > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = seg_len;
        } else {
            current_len += additional;
        }
        current.push(seg);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
