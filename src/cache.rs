//! Disk-backed thumbnail cache with LRU eviction.
//!
//! Thumbnails are stored as `{fingerprint}_{slide:03}_{dpi}.png` next to a
//! single JSON index (`cache_index.json`) that records size and access times.
//!
//! The cache is best-effort: every I/O failure degrades to a miss or a no-op
//! and is logged, never returned. The index is guarded by a mutex and written
//! atomically (temp file in the same directory, then rename), so concurrent
//! `get`/`put` calls cannot interleave partial writes and a crash leaves the
//! previous index in place. An index that still fails to parse is treated as
//! an empty cache.

use crate::error::ScriptDeckError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "cache_index.json";

/// Weak identity of a source document: name, byte size and modification
/// time, hashed. Two different files sharing all three collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentFingerprint(String);

impl DocumentFingerprint {
    /// Fingerprint the file at `path` from its metadata (contents are not read).
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Self::from_parts(&name, meta.len(), mtime))
    }

    pub fn from_parts(name: &str, size: u64, mtime_secs: f64) -> Self {
        let input = format!("{name}_{size}_{mtime_secs}");
        let hash = blake3::hash(input.as_bytes());
        Self(hash.to_hex().as_str()[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Metadata of one cached thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub slide_index: usize,
    pub dpi: u32,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    /// Logical clock value of the last access; orders entries whose
    /// timestamps tie.
    #[serde(default)]
    pub access_tick: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    tick: u64,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Size and occupancy of the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub file_count: usize,
    pub max_size_bytes: u64,
    pub usage_percent: f64,
}

impl CacheStats {
    pub fn total_size_mb(&self) -> f64 {
        (self.total_size_bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0
    }
}

/// Persistent, size-bounded thumbnail store. Shared across jobs via `Arc`.
pub struct ThumbnailCache {
    dir: PathBuf,
    max_bytes: u64,
    index: Mutex<CacheIndex>,
}

impl std::fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("dir", &self.dir)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl ThumbnailCache {
    /// Open (or create) the cache in `dir`, bounded to `max_bytes`.
    ///
    /// Fails only when the directory itself cannot be created.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, ScriptDeckError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ScriptDeckError::OutputWriteFailed {
            path: dir.clone(),
            source: e,
        })?;

        let index = load_index(&dir.join(INDEX_FILE));
        let cache = Self {
            dir,
            max_bytes: max_bytes.max(1),
            index: Mutex::new(index),
        };
        {
            let mut index = cache.lock();
            cache.prune_missing(&mut index);
            cache.enforce_size_limit(&mut index);
            cache.save(&index);
        }
        info!(
            "Thumbnail cache at {} ({} entries)",
            cache.dir.display(),
            cache.lock().entries.len()
        );
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index key for one thumbnail.
    pub fn key(fingerprint: &DocumentFingerprint, slide_index: usize, dpi: u32) -> String {
        format!("{}_{:03}_{}", fingerprint.as_str(), slide_index, dpi)
    }

    fn image_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.png"))
    }

    /// Look up a thumbnail; refreshes its access time on a hit.
    pub fn get(
        &self,
        fingerprint: &DocumentFingerprint,
        slide_index: usize,
        dpi: u32,
    ) -> Option<PathBuf> {
        let key = Self::key(fingerprint, slide_index, dpi);
        let path = self.image_path(&key);
        let mut index = self.lock();

        if !index.entries.contains_key(&key) {
            return None;
        }
        if !path.is_file() {
            debug!("Cache entry {} lost its image file; dropping it", key);
            index.entries.remove(&key);
            self.save(&index);
            return None;
        }

        let tick = index.next_tick();
        if let Some(entry) = index.entries.get_mut(&key) {
            entry.last_access_at = Utc::now();
            entry.access_tick = tick;
        }
        self.save(&index);
        Some(path)
    }

    /// Copy `source_image` into the cache, record it, then enforce the size
    /// limit. Returns the cached path, or `None` if the copy failed.
    pub fn put(
        &self,
        fingerprint: &DocumentFingerprint,
        slide_index: usize,
        dpi: u32,
        source_image: &Path,
    ) -> Option<PathBuf> {
        let key = Self::key(fingerprint, slide_index, dpi);
        let dest = self.image_path(&key);
        let mut index = self.lock();

        let size_bytes = match std::fs::copy(source_image, &dest) {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "Cache put failed for {} ({}): {}",
                    key,
                    source_image.display(),
                    e
                );
                return None;
            }
        };

        let now = Utc::now();
        let tick = index.next_tick();
        index.entries.insert(
            key.clone(),
            CacheEntry {
                fingerprint: fingerprint.as_str().to_string(),
                slide_index,
                dpi,
                size_bytes,
                created_at: now,
                last_access_at: now,
                access_tick: tick,
            },
        );
        self.enforce_size_limit(&mut index);
        self.save(&index);

        // Eviction may have removed the entry just written if it alone
        // exceeds the limit.
        index.entries.contains_key(&key).then_some(dest)
    }

    /// Remove every cached image and reset the index.
    pub fn clear(&self) {
        let mut index = self.lock();
        for key in index.entries.keys() {
            let path = self.image_path(key);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove cached {}: {}", path.display(), e);
                }
            }
        }
        index.entries.clear();
        self.save(&index);
        info!("Thumbnail cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let mut index = self.lock();
        self.prune_missing(&mut index);
        let total: u64 = index.entries.values().map(|e| e.size_bytes).sum();
        CacheStats {
            total_size_bytes: total,
            file_count: index.entries.len(),
            max_size_bytes: self.max_bytes,
            usage_percent: ((total as f64 / self.max_bytes as f64) * 1000.0).round() / 10.0,
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, CacheIndex> {
        // A poisoned index is at worst a stale view of disk.
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune_missing(&self, index: &mut CacheIndex) {
        let before = index.entries.len();
        let dir = &self.dir;
        index
            .entries
            .retain(|key, _| dir.join(format!("{key}.png")).is_file());
        let dropped = before - index.entries.len();
        if dropped > 0 {
            debug!("Dropped {} cache entries whose files are gone", dropped);
        }
    }

    /// Evict least-recently-accessed entries until total size is at most
    /// 80 % of the limit. Does nothing while under the limit.
    fn enforce_size_limit(&self, index: &mut CacheIndex) {
        let mut total: u64 = index.entries.values().map(|e| e.size_bytes).sum();
        if total <= self.max_bytes {
            return;
        }
        let target = self.max_bytes / 5 * 4 + (self.max_bytes % 5) * 4 / 5;

        let mut by_age: Vec<(DateTime<Utc>, u64, String)> = index
            .entries
            .iter()
            .map(|(k, e)| (e.last_access_at, e.access_tick, k.clone()))
            .collect();
        by_age.sort();

        let mut evicted = 0usize;
        for (_, _, key) in by_age {
            if total <= target {
                break;
            }
            let path = self.image_path(&key);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    // Newer entries must not go while an older one stays.
                    warn!("Could not evict {}: {}; stopping eviction", path.display(), e);
                    break;
                }
            }
            if let Some(entry) = index.entries.remove(&key) {
                total = total.saturating_sub(entry.size_bytes);
                evicted += 1;
            }
        }
        info!(
            "Cache eviction removed {} entries ({} bytes remain, limit {})",
            evicted, total, self.max_bytes
        );
    }

    fn save(&self, index: &CacheIndex) {
        if let Err(e) = write_index_atomically(&self.dir, index) {
            warn!("Could not persist cache index in {}: {}", self.dir.display(), e);
        }
    }
}

fn load_index(path: &Path) -> CacheIndex {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(
                "Cache index {} is corrupt ({}); starting with an empty cache",
                path.display(),
                e
            );
            CacheIndex::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheIndex::default(),
        Err(e) => {
            warn!("Cache index {} unreadable: {}", path.display(), e);
            CacheIndex::default()
        }
    }
}

fn write_index_atomically(dir: &Path, index: &CacheIndex) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, index)?;
    tmp.flush()?;
    tmp.persist(dir.join(INDEX_FILE)).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_of_size(dir: &Path, name: &str, size: usize) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, vec![7u8; size]).unwrap();
        p
    }

    fn fp(name: &str) -> DocumentFingerprint {
        DocumentFingerprint::from_parts(name, 1234, 1_700_000_000.5)
    }

    #[test]
    fn fingerprint_depends_on_name_size_and_mtime() {
        let a = DocumentFingerprint::from_parts("deck.pptx", 10, 1.0);
        assert_eq!(a, DocumentFingerprint::from_parts("deck.pptx", 10, 1.0));
        assert_ne!(a, DocumentFingerprint::from_parts("deck.pptx", 11, 1.0));
        assert_ne!(a, DocumentFingerprint::from_parts("other.pptx", 10, 1.0));
        assert_ne!(a, DocumentFingerprint::from_parts("deck.pptx", 10, 2.0));
        assert_eq!(a.as_str().len(), 12);
    }

    #[test]
    fn put_then_get_hits() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 10_000).unwrap();
        let img = image_of_size(src.path(), "a.png", 100);

        assert!(cache.get(&fp("d"), 0, 150).is_none());
        let stored = cache.put(&fp("d"), 0, 150, &img).unwrap();
        assert_eq!(cache.get(&fp("d"), 0, 150), Some(stored));
        assert!(cache.get(&fp("d"), 0, 100).is_none(), "dpi is part of the key");
        assert!(cache.get(&fp("d"), 1, 150).is_none());
    }

    #[test]
    fn index_survives_reopen() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let img = image_of_size(src.path(), "a.png", 64);
        {
            let cache = ThumbnailCache::open(cache_dir.path(), 10_000).unwrap();
            cache.put(&fp("d"), 2, 80, &img).unwrap();
        }
        let cache = ThumbnailCache::open(cache_dir.path(), 10_000).unwrap();
        assert!(cache.get(&fp("d"), 2, 80).is_some());
        assert_eq!(cache.stats().file_count, 1);
    }

    #[test]
    fn eviction_keeps_recently_used_and_lands_under_eighty_percent() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 450).unwrap();
        let img = image_of_size(src.path(), "a.png", 100);

        for i in 0..4 {
            cache.put(&fp("d"), i, 150, &img).unwrap();
        }
        // Touch slide 0 so it becomes the most recently used.
        assert!(cache.get(&fp("d"), 0, 150).is_some());
        cache.put(&fp("d"), 4, 150, &img).unwrap();

        let stats = cache.stats();
        assert!(stats.total_size_bytes <= 360, "got {}", stats.total_size_bytes);
        assert_eq!(stats.file_count, 3);
        assert!(cache.get(&fp("d"), 0, 150).is_some());
        assert!(cache.get(&fp("d"), 1, 150).is_none());
        assert!(cache.get(&fp("d"), 2, 150).is_none());
        assert!(cache.get(&fp("d"), 3, 150).is_some());
        assert!(cache.get(&fp("d"), 4, 150).is_some());
    }

    #[test]
    fn failed_eviction_does_not_skip_to_newer_entries() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 450).unwrap();
        let img = image_of_size(src.path(), "a.png", 100);

        for i in 0..4 {
            cache.put(&fp("d"), i, 150, &img).unwrap();
        }
        // The oldest image can no longer be removed as a file.
        let oldest = cache.image_path(&ThumbnailCache::key(&fp("d"), 0, 150));
        std::fs::remove_file(&oldest).unwrap();
        std::fs::create_dir(&oldest).unwrap();
        std::fs::write(oldest.join("keep"), b"x").unwrap();

        assert!(cache.put(&fp("d"), 4, 150, &img).is_some());
        assert!(cache.get(&fp("d"), 1, 150).is_some());
        assert!(cache.get(&fp("d"), 2, 150).is_some());
        assert!(cache.get(&fp("d"), 3, 150).is_some());
    }

    #[test]
    fn corrupt_index_means_empty_cache() {
        let cache_dir = tempfile::tempdir().unwrap();
        std::fs::write(cache_dir.path().join(INDEX_FILE), b"{\"entries\": {tru").unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 1000).unwrap();
        assert_eq!(cache.stats().file_count, 0);
        assert!(cache.get(&fp("d"), 0, 150).is_none());
    }

    #[test]
    fn deleted_image_is_a_miss() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 10_000).unwrap();
        let img = image_of_size(src.path(), "a.png", 10);
        let stored = cache.put(&fp("d"), 0, 150, &img).unwrap();
        std::fs::remove_file(stored).unwrap();
        assert!(cache.get(&fp("d"), 0, 150).is_none());
        assert_eq!(cache.stats().file_count, 0);
    }

    #[test]
    fn put_of_missing_source_is_a_noop() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 10_000).unwrap();
        assert!(cache
            .put(&fp("d"), 0, 150, Path::new("/definitely/not/here.png"))
            .is_none());
        assert_eq!(cache.stats().file_count, 0);
    }

    #[test]
    fn clear_and_stats() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open(cache_dir.path(), 1000).unwrap();
        let img = image_of_size(src.path(), "a.png", 250);
        cache.put(&fp("d"), 0, 150, &img).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.total_size_bytes, 250);
        assert_eq!(stats.usage_percent, 25.0);

        cache.clear();
        assert_eq!(cache.stats().file_count, 0);
        assert!(cache.get(&fp("d"), 0, 150).is_none());
    }
}
