//! # notes2script
//!
//! Turn the speaker notes of a presentation into large, display-ready
//! "script" slides, each paired with a thumbnail of the original slide.
//!
//! ## Why this crate?
//!
//! Reading a talk from the speaker notes view means squinting at small text
//! next to a shrunken slide. A script deck puts the notes on their own
//! slides in large type, split by speaker and length, with the original
//! slide shown in the corner. The hard part is the thumbnail: the deck may
//! be unreadable by any one renderer, renderers may be missing, and large
//! decks must not exhaust memory. So thumbnails come from an ordered
//! fallback chain that never fails outright.
//!
//! ## Pipeline Overview
//!
//! ```text
//! deck
//!  │
//!  ├─ 1. Read       DeckReader → slides, notes, shapes
//!  ├─ 2. Thumbnails cache → office→PDF→pdfium batches → native export
//!  │                → direct image export → internal renderer → placeholder
//!  ├─ 3. Segment    speaker prefixes, length-bounded chunks
//!  └─ 4. Write      ScriptWriter → script document
//! ```
//!
//! Conversions run one at a time on the [`ScriptService`] worker; a memory
//! governor refuses new work above a ceiling and purges old results.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notes2script::{JsonDeckReader, JsonScriptWriter, RenderTools, ScriptService, ServiceConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ScriptService::new(
//!         ServiceConfig::default(),
//!         RenderTools::detect(),
//!         Arc::new(JsonDeckReader),
//!         Arc::new(JsonScriptWriter::default()),
//!     );
//!     let file = tokio::fs::File::open("talk.json").await?;
//!     let receipt = service.submit("talk.json", file).await?;
//!     println!("queued at position {}", receipt.queue_position);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `notes2script` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod convert;
pub mod deck;
pub mod error;
pub mod governor;
pub mod input;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod script;
pub mod segment;
pub mod service;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheStats, DocumentFingerprint, ThumbnailCache};
pub use config::{ServiceConfig, ServiceConfigBuilder, ThumbnailPolicy};
pub use convert::{ConversionOutput, ConversionStats, Converter};
pub use deck::{Deck, DeckReader, JsonDeckReader, Slide};
pub use error::{ScriptDeckError, ToolError};
pub use governor::{MemoryGovernor, MemoryProbe, SysinfoProbe};
pub use pipeline::{RenderTools, Thumbnail, ThumbnailPipeline, ThumbnailSet, ThumbnailSource};
pub use progress::{JobLog, MemoryLog, NoopLog};
pub use queue::{ConversionJob, JobEvent, JobQueue, JobRunner, TaskState, TaskStatus};
pub use script::{JsonScriptWriter, ScriptSlide, ScriptWriter};
pub use service::{Download, HealthReport, ScriptService, SubmitReceipt};
pub use stream::{job_events, task_events, JobEventStream};
