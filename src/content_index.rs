//! Lazily built per-directory index from recording identifier to file.
//!
//! Indexes are rebuilt wholesale once older than the TTL, patched with
//! [`ContentIndexRegistry::add`] when a download lands, and lose single
//! entries whose file turns out to be gone. Builds for one directory are
//! serialized by a keyed lock; different directories build independently.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::tags::TagReader;
use crate::track_cache::normalize_id;

pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(5 * 60);

/// Lazily-created async mutex per key.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn lock_for(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub dir: PathBuf,
    pub entries: usize,
    pub file_count: usize,
    pub build_duration_ms: u64,
    pub built_at: DateTime<Utc>,
}

/// Identifier to path mapping for one directory tree.
#[derive(Debug)]
pub struct ContentIndex {
    dir: PathBuf,
    entries: RwLock<HashMap<String, PathBuf>>,
    built: Instant,
    built_at: DateTime<Utc>,
    build_duration: Duration,
    file_count: usize,
}

impl ContentIndex {
    fn empty(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(HashMap::new()),
            built: Instant::now(),
            built_at: Utc::now(),
            build_duration: Duration::ZERO,
            file_count: 0,
        }
    }

    /// Walk `dir` and read tags of every file the reader handles.
    /// Unreadable or untagged files are skipped.
    fn build(dir: &Path, reader: &dyn TagReader) -> Self {
        let start = Instant::now();
        let mut entries = HashMap::new();
        let mut file_count = 0;

        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let handled = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| reader.extensions().iter().any(|x| e.eq_ignore_ascii_case(x)))
                .unwrap_or(false);
            if !handled {
                continue;
            }

            let isrc = match reader.read_metadata(path) {
                Ok(tags) => tags.isrc,
                Err(_) => None,
            };
            if let Some(isrc) = isrc.map(|i| normalize_id(&i)).filter(|i| !i.is_empty()) {
                entries.insert(isrc, path.to_path_buf());
                file_count += 1;
            }
        }

        let build_duration = start.elapsed();
        log_info!(
            "[index] Built index for {}: {} files in {}ms",
            dir.display(),
            file_count,
            build_duration.as_millis()
        );

        Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(entries),
            built: Instant::now(),
            built_at: Utc::now(),
            build_duration,
            file_count,
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.built.elapsed() < ttl
    }

    pub fn lookup(&self, id: &str) -> Option<PathBuf> {
        let key = normalize_id(id);
        if key.is_empty() {
            return None;
        }
        self.entries.read().get(&key).cloned()
    }

    pub fn add(&self, id: &str, path: &Path) {
        let key = normalize_id(id);
        if key.is_empty() || path.as_os_str().is_empty() {
            return;
        }
        self.entries.write().insert(key, path.to_path_buf());
    }

    pub fn remove(&self, id: &str) {
        self.entries.write().remove(&normalize_id(id));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            dir: self.dir.clone(),
            entries: self.len(),
            file_count: self.file_count,
            build_duration_ms: self.build_duration.as_millis() as u64,
            built_at: self.built_at,
        }
    }
}

/// Present, a regular file and not empty.
pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| !m.is_dir() && m.len() > 0)
        .unwrap_or(false)
}

/// One track in a batch existence query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackQuery {
    #[serde(alias = "identifier")]
    pub isrc: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artist_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExistence {
    pub isrc: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub track_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artist_name: String,
}

/// Owner of every directory index.
pub struct ContentIndexRegistry {
    indexes: RwLock<HashMap<PathBuf, Arc<ContentIndex>>>,
    build_locks: KeyedLocks<PathBuf>,
    reader: Arc<dyn TagReader>,
    ttl: Duration,
    walks: AtomicUsize,
}

impl ContentIndexRegistry {
    pub fn new(reader: Arc<dyn TagReader>, ttl: Duration) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            build_locks: KeyedLocks::default(),
            reader,
            ttl,
            walks: AtomicUsize::new(0),
        }
    }

    fn cached(&self, dir: &Path) -> Option<Arc<ContentIndex>> {
        self.indexes
            .read()
            .get(dir)
            .filter(|idx| idx.is_fresh(self.ttl))
            .cloned()
    }

    /// Fresh index for `dir`, building it if needed.
    pub async fn get(&self, dir: &Path) -> Arc<ContentIndex> {
        if let Some(idx) = self.cached(dir) {
            return idx;
        }

        let lock = self.build_locks.lock_for(&dir.to_path_buf());
        let _guard = lock.lock().await;

        // Another task may have finished the build while we waited
        if let Some(idx) = self.cached(dir) {
            return idx;
        }

        self.rebuild(dir).await
    }

    /// Build now regardless of freshness, e.g. before a large batch.
    pub async fn prebuild(&self, dir: &Path) -> Result<Arc<ContentIndex>> {
        if dir.as_os_str().is_empty() {
            return Err(Error::invalid_input("output directory is required"));
        }
        let lock = self.build_locks.lock_for(&dir.to_path_buf());
        let _guard = lock.lock().await;
        Ok(self.rebuild(dir).await)
    }

    async fn rebuild(&self, dir: &Path) -> Arc<ContentIndex> {
        let index = if dir.as_os_str().is_empty() {
            ContentIndex::empty(dir)
        } else {
            self.walks.fetch_add(1, Ordering::SeqCst);
            let reader = Arc::clone(&self.reader);
            let owned = dir.to_path_buf();
            match tokio::task::spawn_blocking(move || ContentIndex::build(&owned, reader.as_ref()))
                .await
            {
                Ok(index) => index,
                Err(e) => {
                    log_error!("[index] build task for {} failed: {}", dir.display(), e);
                    ContentIndex::empty(dir)
                }
            }
        };

        let index = Arc::new(index);
        self.indexes
            .write()
            .insert(dir.to_path_buf(), Arc::clone(&index));
        index
    }

    /// Drop the cached index so the next access rebuilds it.
    pub fn invalidate(&self, dir: &Path) {
        if self.indexes.write().remove(dir).is_some() {
            log_debug!("[index] invalidated {}", dir.display());
        }
    }

    /// Record a freshly produced file. Only patches an index that already
    /// exists; a missing one will pick the file up when it is built.
    pub fn add(&self, dir: &Path, id: &str, path: &Path) {
        if let Some(idx) = self.indexes.read().get(dir) {
            idx.add(id, path);
        }
    }

    /// Path of an existing file for `id`, evicting the entry when the file
    /// has disappeared since indexing.
    pub async fn find_existing(&self, dir: &Path, id: &str) -> Option<PathBuf> {
        if dir.as_os_str().is_empty() || id.trim().is_empty() {
            return None;
        }
        let idx = self.get(dir).await;
        let path = idx.lookup(id)?;

        let candidate = path.clone();
        let present = tokio::task::spawn_blocking(move || file_exists(&candidate))
            .await
            .unwrap_or(false);
        if present {
            Some(path)
        } else {
            log_debug!("[index] stale entry for {} ({})", id, path.display());
            idx.remove(id);
            None
        }
    }

    /// Resolve every query against the index concurrently. Results keep
    /// the input order and echo the display fields.
    pub async fn check_files_exist_parallel(
        &self,
        dir: &Path,
        tracks: Vec<TrackQuery>,
    ) -> Vec<FileExistence> {
        let idx = self.get(dir).await;

        let tasks = tracks.into_iter().map(|track| {
            let idx = Arc::clone(&idx);
            tokio::spawn(async move {
                let file_path = if track.isrc.is_empty() {
                    None
                } else {
                    idx.lookup(&track.isrc)
                };
                FileExistence {
                    exists: file_path.is_some(),
                    file_path,
                    isrc: track.isrc,
                    track_name: track.track_name,
                    artist_name: track.artist_name,
                }
            })
        });

        futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|res| {
                res.unwrap_or_else(|e| {
                    log_error!("[index] existence task failed: {}", e);
                    FileExistence {
                        isrc: String::new(),
                        exists: false,
                        file_path: None,
                        track_name: String::new(),
                        artist_name: String::new(),
                    }
                })
            })
            .collect()
    }

    /// JSON in, JSON out variant for the host bridge.
    pub async fn check_files_exist_json(&self, dir: &Path, tracks_json: &str) -> Result<String> {
        let tracks: Vec<TrackQuery> = serde_json::from_str(tracks_json)
            .map_err(|e| Error::decode(format!("failed to parse tracks JSON: {}", e)))?;
        let results = self.check_files_exist_parallel(dir, tracks).await;
        Ok(serde_json::to_string(&results)?)
    }

    pub fn stats(&self, dir: &Path) -> Option<IndexStats> {
        self.indexes.read().get(dir).map(|idx| idx.stats())
    }

    /// Number of directory walks performed so far.
    pub fn walk_count(&self) -> usize {
        self.walks.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TrackTags;

    struct NameReader;

    impl TagReader for NameReader {
        fn read_metadata(&self, path: &Path) -> anyhow::Result<TrackTags> {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            Ok(TrackTags {
                isrc: Some(stem.to_string()),
                ..Default::default()
            })
        }
    }

    #[test]
    fn build_only_indexes_handled_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("usabc1234567.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("GBXYZ7654321.mp3"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("QZ0000000001.FLAC"), b"x").unwrap();

        let idx = ContentIndex::build(dir.path(), &NameReader);
        assert_eq!(idx.len(), 2);
        assert!(idx.lookup("USABC1234567").is_some());
        assert!(idx.lookup("qz0000000001").is_some());
        assert!(idx.lookup("GBXYZ7654321").is_none());
        assert_eq!(idx.stats().file_count, 2);
    }

    #[tokio::test]
    async fn empty_dir_argument_yields_empty_index_without_walk() {
        let registry = ContentIndexRegistry::new(Arc::new(NameReader), DEFAULT_INDEX_TTL);
        let idx = registry.get(Path::new("")).await;
        assert!(idx.is_empty());
        assert_eq!(registry.walk_count(), 0);
        assert!(registry.prebuild(Path::new("")).await.is_err());
    }

    #[test]
    fn keyed_locks_share_one_mutex_per_key() {
        let locks: KeyedLocks<String> = KeyedLocks::default();
        let a = locks.lock_for(&"a".to_string());
        let a2 = locks.lock_for(&"a".to_string());
        let b = locks.lock_for(&"b".to_string());
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
