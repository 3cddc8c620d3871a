//! Configuration types for the notes-to-script service.
//!
//! All service behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. Thumbnail quality knobs live in the nested
//! [`ThumbnailPolicy`] because the pipeline consumes them without needing
//! the rest of the service settings.

use crate::error::ScriptDeckError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for a [`crate::service::ScriptService`].
///
/// # Example
/// ```rust
/// use notes2script::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .cache_max_mb(100)
///     .memory_ceiling_mb(512)
///     .max_queue_depth(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_queue_depth, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding cached thumbnails and their index.
    /// Default: `$TMPDIR/notes2script_cache`.
    pub cache_dir: PathBuf,

    /// Upper bound for the thumbnail cache in bytes. Default: 200 MiB.
    ///
    /// When exceeded, least-recently-used entries are evicted until the cache
    /// is back under 80 % of this value.
    pub cache_max_bytes: u64,

    /// Disable to skip the cache entirely (every job renders from scratch).
    pub cache_enabled: bool,

    /// Resident-memory ceiling in bytes for the process and its children.
    /// Default: 400 MiB.
    ///
    /// Above it, submissions are refused and the governor starts purging old
    /// completed tasks.
    pub memory_ceiling_bytes: u64,

    /// Minimum time between two governor memory checks. Default: 300 s.
    pub governor_interval: Duration,

    /// Completed tasks older than this are purged under memory pressure.
    /// Default: 1 h.
    pub completed_ttl: Duration,

    /// Maximum number of jobs waiting in the queue. Default: 32.
    pub max_queue_depth: usize,

    /// Character bound for the text of a single script slide. Default: 200.
    pub max_chars_per_slide: usize,

    /// Parent directory of per-job temporary working directories.
    pub work_root: PathBuf,

    /// Parent directory of per-task output directories awaiting download.
    pub artifacts_root: PathBuf,

    /// File name of the generated script document inside a task's output dir.
    pub output_file_name: String,

    /// Thumbnail resolution and batching policy.
    pub thumbnails: ThumbnailPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            cache_dir: tmp.join("notes2script_cache"),
            cache_max_bytes: 200 * MIB,
            cache_enabled: true,
            memory_ceiling_bytes: 400 * MIB,
            governor_interval: Duration::from_secs(300),
            completed_ttl: Duration::from_secs(3600),
            max_queue_depth: 32,
            max_chars_per_slide: 200,
            work_root: tmp.clone(),
            artifacts_root: tmp.join("notes2script_artifacts"),
            output_file_name: "script_slides.json".to_string(),
            thumbnails: ThumbnailPolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Memory ceiling expressed in whole megabytes, for messages.
    pub fn memory_ceiling_mb(&self) -> u64 {
        self.memory_ceiling_bytes / MIB
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn cache_max_mb(mut self, mb: u64) -> Self {
        self.config.cache_max_bytes = mb.max(1) * MIB;
        self
    }

    pub fn cache_max_bytes(mut self, bytes: u64) -> Self {
        self.config.cache_max_bytes = bytes;
        self
    }

    pub fn cache_enabled(mut self, v: bool) -> Self {
        self.config.cache_enabled = v;
        self
    }

    pub fn memory_ceiling_mb(mut self, mb: u64) -> Self {
        self.config.memory_ceiling_bytes = mb.max(1) * MIB;
        self
    }

    pub fn governor_interval(mut self, interval: Duration) -> Self {
        self.config.governor_interval = interval;
        self
    }

    pub fn completed_ttl(mut self, ttl: Duration) -> Self {
        self.config.completed_ttl = ttl;
        self
    }

    pub fn max_queue_depth(mut self, n: usize) -> Self {
        self.config.max_queue_depth = n;
        self
    }

    pub fn max_chars_per_slide(mut self, n: usize) -> Self {
        self.config.max_chars_per_slide = n;
        self
    }

    pub fn work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_root = dir.into();
        self
    }

    pub fn artifacts_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.artifacts_root = dir.into();
        self
    }

    pub fn output_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.output_file_name = name.into();
        self
    }

    pub fn thumbnails(mut self, policy: ThumbnailPolicy) -> Self {
        self.config.thumbnails = policy;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ScriptDeckError> {
        let c = &self.config;
        if c.max_queue_depth == 0 {
            return Err(ScriptDeckError::InvalidConfig(
                "max_queue_depth must be ≥ 1".into(),
            ));
        }
        if c.max_chars_per_slide < 10 {
            return Err(ScriptDeckError::InvalidConfig(format!(
                "max_chars_per_slide must be ≥ 10, got {}",
                c.max_chars_per_slide
            )));
        }
        if c.cache_max_bytes == 0 {
            return Err(ScriptDeckError::InvalidConfig(
                "cache size must be > 0".into(),
            ));
        }
        if c.output_file_name.is_empty() || c.output_file_name.contains(['/', '\\']) {
            return Err(ScriptDeckError::InvalidConfig(format!(
                "output_file_name must be a bare file name, got {:?}",
                c.output_file_name
            )));
        }
        c.thumbnails.validate()?;
        Ok(self.config)
    }
}

// ── Thumbnail policy ─────────────────────────────────────────────────────

/// Adaptive resolution and batch sizing for thumbnail acquisition.
///
/// Larger decks get a lower DPI and smaller rasterisation batches so that
/// peak memory stays bounded regardless of slide count:
///
/// | Slides   | DPI | Batch |
/// |----------|-----|-------|
/// | ≤ 60     | 150 | 40    |
/// | 61–100   | 100 | 25    |
/// | 101–120  | 80  | 25    |
/// | > 120    | 80  | 15    |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailPolicy {
    pub default_dpi: u32,
    pub reduced_dpi: u32,
    pub minimal_dpi: u32,
    /// Decks with more slides than this use `reduced_dpi`.
    pub reduced_dpi_above: usize,
    /// Decks with more slides than this use `minimal_dpi`.
    pub minimal_dpi_above: usize,
    pub small_batch: usize,
    pub medium_batch: usize,
    pub large_batch: usize,
    /// Decks with more slides than this rasterise in `medium_batch` pages.
    pub medium_batch_above: usize,
    /// Decks with more slides than this rasterise in `large_batch` pages.
    pub large_batch_above: usize,
    /// Size of generated placeholder thumbnails in pixels.
    pub placeholder_size: (u32, u32),
}

impl Default for ThumbnailPolicy {
    fn default() -> Self {
        Self {
            default_dpi: 150,
            reduced_dpi: 100,
            minimal_dpi: 80,
            reduced_dpi_above: 60,
            minimal_dpi_above: 100,
            small_batch: 40,
            medium_batch: 25,
            large_batch: 15,
            medium_batch_above: 60,
            large_batch_above: 120,
            placeholder_size: (1600, 900),
        }
    }
}

impl ThumbnailPolicy {
    /// Rendering DPI for a deck of `slide_count` slides.
    pub fn dpi_for(&self, slide_count: usize) -> u32 {
        if slide_count > self.minimal_dpi_above {
            self.minimal_dpi
        } else if slide_count > self.reduced_dpi_above {
            self.reduced_dpi
        } else {
            self.default_dpi
        }
    }

    /// Pages rasterised per batch for a deck of `slide_count` slides.
    pub fn batch_size_for(&self, slide_count: usize) -> usize {
        if slide_count > self.large_batch_above {
            self.large_batch
        } else if slide_count > self.medium_batch_above {
            self.medium_batch
        } else {
            self.small_batch
        }
    }

    fn validate(&self) -> Result<(), ScriptDeckError> {
        for dpi in [self.default_dpi, self.reduced_dpi, self.minimal_dpi] {
            if !(36..=600).contains(&dpi) {
                return Err(ScriptDeckError::InvalidConfig(format!(
                    "thumbnail DPI must be 36–600, got {dpi}"
                )));
            }
        }
        if self.small_batch == 0 || self.medium_batch == 0 || self.large_batch == 0 {
            return Err(ScriptDeckError::InvalidConfig(
                "batch sizes must be ≥ 1".into(),
            ));
        }
        if self.placeholder_size.0 == 0 || self.placeholder_size.1 == 0 {
            return Err(ScriptDeckError::InvalidConfig(
                "placeholder size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
