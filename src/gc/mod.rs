use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs as async_fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{
    unix_now, CacheKey, LocalStore, MemoryIndex, SUFFIX_LAYER_FILE, SUFFIX_MANIFEST_FILE,
    SUFFIX_META_FILE, SUFFIX_PARTIAL_FILE,
};
use crate::metrics;

const REDUCER_INTERVAL: Duration = Duration::from_secs(100);
const DISK_TOLERANCE_PERCENT: u64 = 15;
const STALE_PARTIAL_SAMPLES: u32 = 4;
const STALE_PARTIAL_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const HASH_BUF_SIZE: usize = 8192;

/// Age bounds applied per item type.
#[derive(Debug, Clone, Copy)]
pub struct AgeThresholds {
    pub max_age: Duration,
    pub max_unused: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct GcOptions {
    pub interval: Duration,
    pub check_sha: bool,
    pub max_disk_size: u64,
    pub layers: AgeThresholds,
    pub manifests: AgeThresholds,
}

/// Periodic sweep over the data directory and the index, plus an independent
/// disk-usage reducer. The sweep runs under a mutex shared with `try_collect`
/// so a worker-triggered cleanup never overlaps a scheduled one; the reducer
/// only issues best-effort deletes and stays outside that mutex.
pub struct GarbageCollector {
    options: GcOptions,
    index: Arc<MemoryIndex>,
    store: Arc<LocalStore>,
    mu: Mutex<()>,
}

impl GarbageCollector {
    pub fn new(index: Arc<MemoryIndex>, store: Arc<LocalStore>, options: GcOptions) -> Self {
        Self {
            options,
            index,
            store,
            mu: Mutex::new(()),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let reducer = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = reducer.enforce_disk_cap().await {
                    error!(error = %err, "failed to reduce disk usage");
                }
                tokio::time::sleep(REDUCER_INTERVAL).await;
            }
        });

        let gc = self.clone();
        tokio::spawn(async move {
            loop {
                {
                    let _guard = gc.mu.lock().await;
                    gc.run_pass(true).await;
                }
                tokio::time::sleep(gc.options.interval).await;
            }
        });
    }

    /// Non-blocking cleanup attempt used by workers on cache-read failures.
    /// Silently does nothing when a pass is already running.
    pub async fn try_collect(&self) {
        if let Ok(_guard) = self.mu.try_lock() {
            self.run_pass(false).await;
        }
    }

    async fn run_pass(&self, include_stale_partials: bool) {
        metrics::record_gc_run();
        self.clean_undesired_files().await;
        self.clean_orphan_files().await;
        self.clean_cache_keys().await;
        if self.options.check_sha {
            self.clean_corrupt_layers().await;
        }
        if include_stale_partials {
            self.clean_stale_partials().await;
        }
    }

    /// Anything in the data directory that is not a data file, sidecar, or
    /// partial does not belong to us and is unlinked.
    async fn clean_undesired_files(&self) {
        let files = match self.store.list().await {
            Ok(files) => files,
            Err(err) => {
                error!(error = %err, "failed to list files");
                return;
            }
        };
        for name in files {
            if name.ends_with(SUFFIX_META_FILE)
                || name.ends_with(SUFFIX_LAYER_FILE)
                || name.ends_with(SUFFIX_MANIFEST_FILE)
                || name.ends_with(SUFFIX_PARTIAL_FILE)
            {
                continue;
            }
            let path = self.store.data_dir().join(&name);
            info!(file = %path.display(), "deleting undesired file");
            let _ = async_fs::remove_file(&path).await;
        }
    }

    /// Pair every content file with its sidecar; whatever remains unpaired is
    /// deleted. Partials are in flight and skipped.
    async fn clean_orphan_files(&self) {
        let files = match self.store.list().await {
            Ok(files) => files,
            Err(err) => {
                error!(error = %err, "failed to list files");
                return;
            }
        };

        let mut orphans: HashSet<String> = HashSet::new();
        for name in &files {
            if let Some(data_name) = name.strip_suffix(SUFFIX_META_FILE) {
                if !orphans.remove(data_name) {
                    orphans.insert(name.clone());
                }
            } else if name.ends_with(SUFFIX_PARTIAL_FILE) {
                continue;
            } else {
                let meta_name = format!("{name}{SUFFIX_META_FILE}");
                if !orphans.remove(&meta_name) {
                    orphans.insert(name.clone());
                }
            }
        }

        for name in orphans {
            let path = self.store.data_dir().join(&name);
            info!(file = %path.display(), "deleting orphan file");
            let _ = self.store.delete(Some(path), None, false).await;
        }
    }

    async fn clean_cache_keys(&self) {
        let now = unix_now();
        for key in self.index.list_cache_keys() {
            let Ok(datafile) = self.index.get_datafile(&key) else {
                continue;
            };
            let Some(name) = datafile.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let thresholds = if name.ends_with(SUFFIX_LAYER_FILE) {
                self.options.layers
            } else if name.ends_with(SUFFIX_MANIFEST_FILE) {
                self.options.manifests
            } else {
                continue;
            };
            self.clean_cache_key(&key, &datafile, thresholds, now).await;
        }
    }

    async fn clean_cache_key(
        &self,
        key: &CacheKey,
        datafile: &Path,
        thresholds: AgeThresholds,
        now: i64,
    ) {
        match self.index.get_atime(key) {
            Ok(atime) => {
                if now - atime > thresholds.max_unused.as_secs() as i64 {
                    info!(file = %datafile.display(), "deleting unused file");
                    let _ = self
                        .store
                        .delete(Some(datafile.to_path_buf()), Some(key.clone()), false)
                        .await;
                    return;
                }
            }
            Err(err) => error!(key = %key, error = %err, "failed to read atime from index"),
        }

        match self.index.get_ctime(key) {
            Ok(ctime) => {
                if now - ctime > thresholds.max_age.as_secs() as i64 {
                    info!(file = %datafile.display(), "deleting file, max age reached");
                    let _ = self
                        .store
                        .delete(Some(datafile.to_path_buf()), Some(key.clone()), false)
                        .await;
                    return;
                }
            }
            Err(err) => error!(key = %key, error = %err, "failed to read ctime from index"),
        }

        // entry exists but the underlying file is gone
        match async_fs::metadata(datafile).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(key = %key, "cleaning up cache key without data file");
                let _ = self
                    .store
                    .delete(Some(datafile.to_path_buf()), Some(key.clone()), false)
                    .await;
            }
            _ => {}
        }
    }

    /// Recompute the SHA-256 of every layer file and drop the ones whose
    /// content no longer matches their digest name.
    async fn clean_corrupt_layers(&self) {
        let files = match self.store.list().await {
            Ok(files) => files,
            Err(err) => {
                error!(error = %err, "failed to list files");
                return;
            }
        };
        for name in files {
            let Some(expected) = name.strip_suffix(SUFFIX_LAYER_FILE).map(str::to_string) else {
                continue;
            };
            let datafile = self.store.data_dir().join(&name);
            let hash_path = datafile.clone();
            let actual = match tokio::task::spawn_blocking(move || sha256_hex(&hash_path)).await {
                Ok(Ok(hash)) => hash,
                Ok(Err(err)) => {
                    error!(file = %datafile.display(), error = %err, "failed to calculate sha256");
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "sha256 task failed");
                    continue;
                }
            };
            if actual != expected {
                info!(file = %datafile.display(), "deleting corrupted file");
                let _ = self.store.delete(Some(datafile), None, false).await;
            }
        }
    }

    /// Sample each partial file a few times; unlink the ones that never grow.
    /// Active downloads keep growing and survive.
    async fn clean_stale_partials(&self) {
        let files = match self.store.list().await {
            Ok(files) => files,
            Err(err) => {
                error!(error = %err, "failed to list files");
                return;
            }
        };
        for name in files {
            if !name.ends_with(SUFFIX_PARTIAL_FILE) {
                continue;
            }
            let path = self.store.data_dir().join(&name);
            let initial = match async_fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => {
                    warn!(file = %path.display(), "cannot stat partial file");
                    continue;
                }
            };

            let mut growing = false;
            for _ in 0..STALE_PARTIAL_SAMPLES {
                match async_fs::metadata(&path).await {
                    Ok(meta) if meta.len() > initial => {
                        growing = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        warn!(file = %path.display(), "cannot stat partial file");
                        continue;
                    }
                }
                tokio::time::sleep(STALE_PARTIAL_SAMPLE_INTERVAL).await;
            }

            if !growing {
                info!(file = %path.display(), "removing stale partial file");
                let _ = async_fs::remove_file(&path).await;
            }
        }
    }

    /// Evict from the LRU tail until disk usage is back inside the tolerance
    /// band below the configured cap.
    pub async fn enforce_disk_cap(&self) -> Result<()> {
        let tolerance = self.options.max_disk_size / 100 * DISK_TOLERANCE_PERCENT;
        let floor = self.options.max_disk_size.saturating_sub(tolerance);
        loop {
            let size = dir_size(self.store.data_dir()).await?;
            metrics::set_cache_size(size);
            if size < floor {
                debug!(size, "disk usage is under the limit");
                return Ok(());
            }
            let least_used = match self.store.least_used_file() {
                Ok(file) => file,
                Err(err) => {
                    error!(error = %err, "failed to fetch least used file");
                    return Ok(());
                }
            };
            match self.store.delete(Some(least_used.clone()), None, false).await {
                Ok(()) => info!(file = %least_used.display(), "deleted least recently used file"),
                Err(err) => {
                    error!(file = %least_used.display(), error = %err, "failed to delete file")
                }
            }
        }
    }
}

async fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut entries = async_fs::read_dir(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}
