//! Version Cache
//!
//! On-disk store of plugin source trees, one directory per version, plus a single
//! `metadata.json` document describing every cached version.
//!
//! ```text
//! <root>/
//!   metadata.json
//!   versions/<name>_v<N>/...
//!   .trash/            tombstones awaiting deletion
//! ```
//!
//! Eviction renames the version directory into `.trash` first. Only when that rename succeeds
//! is the metadata entry dropped, so a version is either fully present or fully gone.

pub mod cleanup;
pub mod metadata;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;
use crate::clock::{system_clock, SharedClock};
use crate::plugin::{PluginError, PluginIdentity, PluginResult};

pub use cleanup::{CleanupStats, Eviction, EvictionReason};
pub use metadata::{CacheDocument, PluginVersionMetadata, TestResults};

const METADATA_FILE: &str = "metadata.json";
const VERSIONS_DIR: &str = "versions";
const TRASH_DIR: &str = ".trash";

/// Retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Most recent versions kept per plugin
    pub max_versions: usize,
    /// Versions idle for longer than this are evicted
    pub unused_threshold: Duration,
    /// Versions below this success rate are evicted
    pub min_success_rate: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("plugin-runtime")
                .join("versions"),
            max_versions: 3,
            unused_threshold: Duration::from_secs(30 * 24 * 60 * 60),
            min_success_rate: 0.5,
        }
    }
}

impl CacheConfig {
    pub fn with_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = root.into();
        self
    }

    pub fn validate(&self) -> PluginResult<()> {
        if self.max_versions == 0 {
            return Err(PluginError::configuration_error("max versions must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(PluginError::configuration_error(format!(
                "min success rate must be in [0, 1], got {}", self.min_success_rate
            )));
        }
        Ok(())
    }
}

fn plugin_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid regex"))
}

/// Plugin version store with retention policy
pub struct VersionCache {
    root: PathBuf,
    config: CacheConfig,
    clock: SharedClock,
    document: Mutex<CacheDocument>,
    /// Snapshot counter, advanced while the document lock is held
    generation: AtomicU64,
    /// Generation of the last snapshot written to disk
    written: Mutex<u64>,
}

/// Serialized metadata waiting to be written outside the document lock
struct PendingWrite {
    generation: u64,
    bytes: Vec<u8>,
}

impl VersionCache {
    /// Open (or create) a cache rooted at `root`, loading any existing metadata
    pub fn open<P: Into<PathBuf>>(root: P, config: CacheConfig, clock: SharedClock) -> PluginResult<Self> {
        config.validate()?;
        let root = root.into();
        fs::create_dir_all(root.join(VERSIONS_DIR))?;

        let document = Self::load_document(&root.join(METADATA_FILE));
        info!("Opened version cache at {} with {} versions", root.display(), document.versions.len());

        let cache = Self {
            root,
            config,
            clock,
            document: Mutex::new(document),
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
        };
        cache.purge_trash();
        Ok(cache)
    }

    /// Open using `config.root`
    pub fn from_config(config: CacheConfig) -> PluginResult<Self> {
        let root = config.root.clone();
        Self::open(root, config, system_clock())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn load_document(path: &Path) -> CacheDocument {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheDocument::default(),
            Err(e) => {
                warn!("Could not read cache metadata {}: {}", path.display(), e);
                return CacheDocument::default();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            error!("Cache metadata {} is corrupt, starting empty: {}", path.display(), e);
            CacheDocument::default()
        })
    }

    /// Serialize the document; must be called with the document lock held
    fn snapshot(&self, document: &CacheDocument) -> Option<PendingWrite> {
        match serde_json::to_vec_pretty(document) {
            Ok(bytes) => Some(PendingWrite {
                generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
                bytes,
            }),
            Err(e) => {
                warn!("Failed to serialize cache metadata: {}", e);
                None
            }
        }
    }

    /// Write a snapshot to a temp file and rename it into place, after the document lock is
    /// released. Snapshots older than the last one written are dropped. Failures are logged only.
    fn flush(&self, pending: Option<PendingWrite>) {
        let Some(pending) = pending else { return };
        let mut written = self.written.lock();
        if pending.generation <= *written {
            debug!("Skipping stale cache metadata snapshot {}", pending.generation);
            return;
        }

        let target = self.root.join(METADATA_FILE);
        let temp = self.root.join(format!("{}.{}.tmp", METADATA_FILE, Uuid::new_v4()));
        let result = fs::write(&temp, &pending.bytes).and_then(|_| fs::rename(&temp, &target));

        match result {
            Ok(()) => *written = pending.generation,
            Err(e) => {
                warn!("Failed to persist cache metadata to {}: {}", target.display(), e);
                let _ = fs::remove_file(&temp);
            }
        }
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    fn purge_trash(&self) {
        let trash = self.trash_dir();
        if trash.exists() {
            if let Err(e) = fs::remove_dir_all(&trash) {
                warn!("Could not purge cache tombstones in {}: {}", trash.display(), e);
            }
        }
    }

    /// Copy `source_dir` into a new version of `name` and record its metadata.
    ///
    /// Returns the versioned name (`<name>_v<N>`).
    pub fn cache_version<I, S>(
        &self,
        name: &str,
        source_dir: &Path,
        test_results: TestResults,
        dependencies: I,
        description: &str,
    ) -> PluginResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !plugin_name_pattern().is_match(name) {
            return Err(PluginError::cache_error(format!("invalid plugin name '{}'", name)));
        }
        if !source_dir.is_dir() {
            return Err(PluginError::cache_error(format!(
                "source directory {} does not exist", source_dir.display()
            )));
        }

        let (number, pending) = {
            let mut document = self.document.lock();
            let number = document.next_version(name);
            (number, self.snapshot(&document))
        };
        self.flush(pending);
        let identity = PluginIdentity::versioned(name, number);
        let versioned = identity.cache_key();
        let target = self.versions_dir().join(&versioned);

        let size_bytes = match copy_tree(source_dir, &target) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_dir_all(&target);
                return Err(PluginError::cache_error(format!(
                    "failed to copy {} into cache: {}", source_dir.display(), e
                )));
            }
        };

        let now = self.clock.now();
        let mut metadata = PluginVersionMetadata {
            name: name.to_string(),
            version: versioned.clone(),
            version_number: number,
            created_at: now,
            last_used: now,
            success_rate: 0.0,
            test_results: TestResults::default(),
            dependencies: dependencies.into_iter().map(Into::into).collect::<BTreeSet<String>>(),
            description: description.to_string(),
            size_bytes,
        };
        metadata.set_test_results(test_results);

        let pending = {
            let mut document = self.document.lock();
            document.versions.insert(versioned.clone(), metadata);
            self.snapshot(&document)
        };
        self.flush(pending);
        info!("Cached {} ({} bytes)", versioned, size_bytes);
        Ok(versioned)
    }

    /// Highest-numbered version currently present for `name`
    pub fn get_latest(&self, name: &str) -> Option<String> {
        self.document.lock()
            .versions_of(name)
            .max_by_key(|m| m.version_number)
            .map(|m| m.version.clone())
    }

    /// All present versions of `name`, oldest number first
    pub fn list_versions(&self, name: &str) -> Vec<PluginVersionMetadata> {
        let document = self.document.lock();
        let mut versions: Vec<_> = document.versions_of(name).cloned().collect();
        versions.sort_by_key(|m| m.version_number);
        versions
    }

    pub fn get_metadata(&self, versioned: &str) -> Option<PluginVersionMetadata> {
        self.document.lock().versions.get(versioned).cloned()
    }

    /// Directory holding a cached version's files
    pub fn version_path(&self, versioned: &str) -> Option<PathBuf> {
        self.document.lock()
            .versions
            .contains_key(versioned)
            .then(|| self.versions_dir().join(versioned))
    }

    /// Mark a version as used now
    pub fn record_usage(&self, versioned: &str) -> PluginResult<()> {
        let pending = {
            let mut document = self.document.lock();
            let metadata = document.versions.get_mut(versioned)
                .ok_or_else(|| PluginError::plugin_not_found(versioned))?;
            metadata.last_used = self.clock.now();
            self.snapshot(&document)
        };
        self.flush(pending);
        Ok(())
    }

    /// Replace a version's test results, recomputing its success rate
    pub fn update_test_results(&self, versioned: &str, results: TestResults) -> PluginResult<PluginVersionMetadata> {
        let (updated, pending) = {
            let mut document = self.document.lock();
            let metadata = document.versions.get_mut(versioned)
                .ok_or_else(|| PluginError::plugin_not_found(versioned))?;
            metadata.set_test_results(results);
            let updated = metadata.clone();
            (updated, self.snapshot(&document))
        };
        self.flush(pending);
        debug!("Re-tested {}: success rate {:.2}", versioned, updated.success_rate);
        Ok(updated)
    }

    /// Remove one version, returning the bytes freed
    pub fn remove_version(&self, versioned: &str) -> PluginResult<u64> {
        if self.get_metadata(versioned).is_none() {
            return Err(PluginError::plugin_not_found(versioned));
        }
        self.evict(versioned)
    }

    /// Apply the retention policy to every version of `name`.
    ///
    /// A version that cannot be evicted is logged and counted in `failed_removals`; the rest of
    /// the pass continues.
    pub fn cleanup(&self, name: &str) -> CleanupStats {
        let now = self.clock.now();
        let versions = self.list_versions(name);
        let refs: Vec<&PluginVersionMetadata> = versions.iter().collect();
        let evictions = cleanup::select_evictions(
            &refs,
            self.config.max_versions,
            self.config.min_success_rate,
            self.config.unused_threshold,
            now,
        );

        let stats = self.apply_evictions(&versions, evictions);
        info!(
            "Cleanup of '{}': removed {} of {} versions, freed {} bytes",
            name, stats.removed_plugins, stats.total_plugins, stats.bytes_freed
        );
        stats
    }

    /// Prune failed ephemeral instances once there are more than `threshold` of them.
    ///
    /// Instances are grouped by plugin name and only the most recently created one per group
    /// survives. Repeated ids count once and unknown ids are skipped.
    pub fn cleanup_failed<S: AsRef<str>>(&self, failed_ids: &[S], threshold: usize) -> CleanupStats {
        let distinct: BTreeSet<&str> = failed_ids.iter().map(AsRef::as_ref).collect();
        if distinct.len() <= threshold {
            debug!("{} failed instances within threshold {}, nothing to prune", distinct.len(), threshold);
            return CleanupStats { total_plugins: distinct.len(), ..Default::default() };
        }

        let instances: Vec<PluginVersionMetadata> = distinct.into_iter()
            .filter_map(|id| {
                let found = self.get_metadata(id);
                if found.is_none() {
                    warn!("Failed instance '{}' is not in the cache", id);
                }
                found
            })
            .collect();
        let refs: Vec<&PluginVersionMetadata> = instances.iter().collect();
        let evictions = cleanup::select_superseded(&refs);

        let stats = self.apply_evictions(&instances, evictions);
        info!("Pruned {} of {} failed instances", stats.removed_plugins, stats.total_plugins);
        stats
    }

    fn apply_evictions(&self, considered: &[PluginVersionMetadata], evictions: Vec<Eviction>) -> CleanupStats {
        let mut stats = CleanupStats { total_plugins: considered.len(), ..Default::default() };
        let mut removed: HashMap<&str, bool> = HashMap::new();

        for eviction in &evictions {
            match self.evict(&eviction.version) {
                Ok(bytes) => {
                    debug!("Evicted {} ({:?})", eviction.version, eviction.reasons);
                    stats.record_removed(eviction.created_at, bytes);
                    removed.insert(eviction.version.as_str(), true);
                }
                Err(e) => {
                    error!("Failed to evict {}: {}", eviction.version, e);
                    stats.failed_removals += 1;
                }
            }
        }

        for meta in considered {
            if !removed.contains_key(meta.version.as_str()) {
                stats.record_kept(meta.created_at);
            }
        }
        stats
    }

    /// Rename to a tombstone, drop the metadata entry, then delete the tombstone
    fn evict(&self, versioned: &str) -> PluginResult<u64> {
        let dir = self.versions_dir().join(versioned);
        let mut tombstone = None;
        let mut bytes = 0;

        if dir.exists() {
            bytes = tree_size(&dir);
            let trash = self.trash_dir();
            fs::create_dir_all(&trash)?;
            let target = trash.join(format!("{}-{}", versioned, Uuid::new_v4()));
            fs::rename(&dir, &target)?;
            tombstone = Some(target);
        }

        let pending = {
            let mut document = self.document.lock();
            document.versions.remove(versioned);
            self.snapshot(&document)
        };
        self.flush(pending);

        if let Some(tombstone) = tombstone {
            if let Err(e) = fs::remove_dir_all(&tombstone) {
                warn!("Could not delete tombstone {}: {}", tombstone.display(), e);
            }
        }
        Ok(bytes)
    }
}

/// Recursively copy `source` into `target`, returning the bytes copied
fn copy_tree(source: &Path, target: &Path) -> std::io::Result<u64> {
    fs::create_dir_all(target)?;
    let mut copied = 0;

    for entry in WalkDir::new(source).min_depth(1).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry.path().strip_prefix(source)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            copied += fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(copied)
}

/// Summed size of regular files under `dir`
fn tree_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
