use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use super::{
    meta_file_path, partial_file_path, CacheKey, EntryStatus, MemoryIndex, ResponseFile,
    SUFFIX_LAYER_FILE, SUFFIX_MANIFEST_FILE,
};

const COPY_BUF_SIZE: usize = 4 * 1024;

/// Disk persistence for cached objects, plus the LRU recency list used by the
/// size-based eviction. The recency list is only ever touched inside store
/// operations, under its own lock.
pub struct LocalStore {
    data_dir: PathBuf,
    index: Arc<MemoryIndex>,
    recency: Mutex<LruCache<CacheKey, ()>>,
}

impl LocalStore {
    pub fn new(index: Arc<MemoryIndex>, data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            index,
            recency: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Materialize an entry on disk: response metadata goes into the index
    /// first so any reader that later observes `Available` finds it, then the
    /// body is streamed into `<datafile>.partial`, fsynced, the sidecar is
    /// written, and the partial is renamed into its final name. A crash leaves
    /// either a partial (reaped by GC) or a sidecar-less final file (swept as
    /// an orphan); neither is ever advertised.
    ///
    /// Returns the number of body bytes written. The caller owns the status
    /// transition to `Available`.
    pub async fn create<R>(
        &self,
        key: &CacheKey,
        datafile: &Path,
        meta: &ResponseFile,
        body: R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.index.set_response_file(key, meta)?;

        let partial = partial_file_path(datafile);
        let written = match self.write_through_partial(&partial, datafile, meta, body).await {
            Ok(written) => written,
            Err(err) => {
                // best effort; GC reaps leftovers
                let _ = async_fs::remove_file(&partial).await;
                return Err(err);
            }
        };

        self.recency.lock().push(key.clone(), ());
        Ok(written)
    }

    async fn write_through_partial<R>(
        &self,
        partial: &Path,
        datafile: &Path,
        meta: &ResponseFile,
        mut body: R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut dst = async_fs::File::create(partial)
            .await
            .with_context(|| format!("failed to create cache file {}", partial.display()))?;

        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut written = 0u64;
        loop {
            let n = body
                .read(&mut buf)
                .await
                .context("failed reading body for cache")?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])
                .await
                .with_context(|| format!("failed writing cache file {}", partial.display()))?;
            written += n as u64;
        }
        dst.flush().await?;
        dst.sync_all()
            .await
            .with_context(|| format!("failed to sync cache file {}", partial.display()))?;

        meta.dump(&meta_file_path(datafile)).await?;

        async_fs::rename(partial, datafile).await.with_context(|| {
            format!(
                "failed to rename partial cache file into {}",
                datafile.display()
            )
        })?;
        Ok(written)
    }

    /// Open a cached object for streaming. Bumps the access time and the LRU
    /// recency before handing out the reader.
    pub async fn read(
        &self,
        key: &CacheKey,
        datafile: &Path,
    ) -> Result<(async_fs::File, ResponseFile)> {
        let meta = self.index.get_response_file(key)?;
        self.index.set_atime(key)?;

        let file = async_fs::File::open(datafile)
            .await
            .with_context(|| format!("failed to open data file {}", datafile.display()))?;

        self.recency.lock().promote(key);
        Ok((file, meta))
    }

    /// Drop an entry from the recency list, the index, and disk. At least one
    /// of `datafile` / `key` must be given; the other is resolved through the
    /// index. With `atomic` any unexpected filesystem error aborts and is
    /// returned; without it the sweep is best-effort. Not atomic against
    /// concurrent reads: a reader holding an open handle finishes its stream.
    pub async fn delete(
        &self,
        datafile: Option<PathBuf>,
        key: Option<CacheKey>,
        atomic: bool,
    ) -> Result<()> {
        if datafile.is_none() && key.is_none() {
            bail!("empty cache key and empty datafile");
        }

        let datafile = match datafile {
            Some(df) => Some(df),
            None => key.as_ref().and_then(|k| self.index.get_datafile(k).ok()),
        };
        let key = match key {
            Some(k) => Some(k),
            None => datafile.as_ref().and_then(|df| self.index.get_data_ref(df)),
        };

        if let Some(key) = &key {
            self.recency.lock().pop(key);
            self.index.delete(key);
        }

        if let Some(df) = &datafile {
            remove_file_tolerant(df, atomic).await?;
            remove_file_tolerant(&meta_file_path(df), atomic).await?;
        }
        Ok(())
    }

    /// Names of all regular files in the data directory, non-recursive.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = async_fs::read_dir(&self.data_dir)
            .await
            .with_context(|| format!("failed to list {}", self.data_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Rebuild the index from disk on startup. Every file with a recognized
    /// content suffix whose sidecar parses is re-inserted as `Available` and
    /// pushed onto the recency list; anything else is skipped and left for GC.
    /// Blocking directory walk, run it from `spawn_blocking`.
    pub fn restore(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.data_dir)
            .with_context(|| format!("failed to restore from {}", self.data_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(SUFFIX_LAYER_FILE) && !name.ends_with(SUFFIX_MANIFEST_FILE) {
                continue;
            }

            let datafile = entry.path();
            let rf = match ResponseFile::load(&meta_file_path(&datafile)) {
                Ok(rf) => rf,
                Err(err) => {
                    warn!(file = %datafile.display(), error = %err, "skipping entry without usable sidecar");
                    continue;
                }
            };

            let key = CacheKey::new(rf.cache_key.clone());
            if let Err(err) = self.index.put(&key, &datafile) {
                warn!(file = %datafile.display(), error = %err, "failed to restore entry");
                continue;
            }
            let _ = self.index.set_response_file(&key, &rf);
            if self.index.set_status(&key, EntryStatus::Available).is_err() {
                self.index.delete(&key);
                continue;
            }
            self.recency.lock().push(key, ());
        }
        Ok(())
    }

    /// Data file of the least-recently-used digest, the next eviction victim
    /// for the disk-usage reducer.
    pub fn least_used_file(&self) -> Result<PathBuf> {
        let key = self
            .recency
            .lock()
            .peek_lru()
            .map(|(key, _)| key.clone());
        let key = match key {
            Some(key) => key,
            None => bail!("recency list is empty"),
        };
        Ok(self.index.get_datafile(&key)?)
    }
}

async fn remove_file_tolerant(path: &Path, atomic: bool) -> Result<()> {
    match async_fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) if atomic => {
            Err(err).with_context(|| format!("failed to remove {}", path.display()))
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{data_file_path, ItemType};
    use http::{HeaderMap, StatusCode};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("upstream body broke")))
        }
    }

    fn build_store(dir: &TempDir) -> (Arc<MemoryIndex>, LocalStore) {
        let index = Arc::new(MemoryIndex::new());
        let store = LocalStore::new(index.clone(), dir.path().to_path_buf());
        (index, store)
    }

    fn put_entry(
        index: &MemoryIndex,
        dir: &TempDir,
        digest: &str,
        item: ItemType,
    ) -> (CacheKey, PathBuf) {
        let key = CacheKey::new(digest);
        let datafile = data_file_path(dir.path(), digest, item);
        index.put(&key, &datafile).unwrap();
        (key, datafile)
    }

    fn meta_for(key: &CacheKey, len: i64) -> ResponseFile {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/octet-stream".parse().unwrap());
        ResponseFile::new(len, StatusCode::OK, &headers, key)
    }

    #[tokio::test]
    async fn create_then_read_round_trips_the_body() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);
        let (key, datafile) = put_entry(&index, &dir, "abc", ItemType::Layer);

        let body = b"OK";
        let written = store
            .create(&key, &datafile, &meta_for(&key, body.len() as i64), &body[..])
            .await?;
        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&datafile)?, body);
        assert!(meta_file_path(&datafile).exists());
        assert!(!partial_file_path(&datafile).exists());

        index.set_status(&key, EntryStatus::Available)?;
        let (mut file, meta) = store.read(&key, &datafile).await?;
        let mut out = Vec::new();
        file.read_to_end(&mut out).await?;
        assert_eq!(out, body);
        assert_eq!(meta.status_code, 200);
        assert_eq!(meta.content_length, body.len() as i64);
        Ok(())
    }

    #[tokio::test]
    async fn create_requires_an_index_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let (_index, store) = build_store(&dir);
        let key = CacheKey::new("abc");
        let datafile = data_file_path(dir.path(), "abc", ItemType::Layer);

        let err = store
            .create(&key, &datafile, &meta_for(&key, 2), &b"OK"[..])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(!datafile.exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_body_stream_leaves_no_partial_or_final_file() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);
        let (key, datafile) = put_entry(&index, &dir, "abc", ItemType::Layer);

        let err = store
            .create(&key, &datafile, &meta_for(&key, -1), FailingReader)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed reading body"));
        assert!(!datafile.exists());
        assert!(!partial_file_path(&datafile).exists());
        // the entry was never promoted, so there is nothing to evict
        assert!(store.least_used_file().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn read_updates_atime() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);
        let (key, datafile) = put_entry(&index, &dir, "abc", ItemType::Manifest);
        store
            .create(&key, &datafile, &meta_for(&key, 4), &b"{{}}"[..])
            .await?;

        let before = index.get_atime(&key)?;
        store.read(&key, &datafile).await?;
        assert!(index.get_atime(&key)? >= before);
        Ok(())
    }

    #[tokio::test]
    async fn read_fails_when_data_file_is_gone() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);
        let (key, datafile) = put_entry(&index, &dir, "abc", ItemType::Layer);
        store
            .create(&key, &datafile, &meta_for(&key, 2), &b"OK"[..])
            .await?;

        std::fs::remove_file(&datafile)?;
        assert!(store.read(&key, &datafile).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_index_rows_lru_node_and_files() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);
        let (key, datafile) = put_entry(&index, &dir, "abc", ItemType::Layer);
        store
            .create(&key, &datafile, &meta_for(&key, 2), &b"OK"[..])
            .await?;

        store.delete(None, Some(key.clone()), false).await?;
        assert!(!datafile.exists());
        assert!(!meta_file_path(&datafile).exists());
        assert_eq!(index.len(), 0);
        assert_eq!(index.get_data_ref(&datafile), None);
        assert!(store.least_used_file().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn delete_by_datafile_resolves_the_key() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);
        let (_key, datafile) = put_entry(&index, &dir, "abc", ItemType::Layer);

        store.delete(Some(datafile.clone()), None, false).await?;
        assert_eq!(index.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn delete_rejects_empty_arguments_and_tolerates_missing_files() -> Result<()> {
        let dir = TempDir::new()?;
        let (_index, store) = build_store(&dir);

        assert!(store.delete(None, None, false).await.is_err());
        // atomic delete of a file that does not exist is still fine
        store
            .delete(Some(dir.path().join("ghost.layer")), None, true)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn least_used_follows_insertion_order_modulo_reads() -> Result<()> {
        let dir = TempDir::new()?;
        let (index, store) = build_store(&dir);

        let mut files = Vec::new();
        for digest in ["d1", "d2", "d3"] {
            let (key, datafile) = put_entry(&index, &dir, digest, ItemType::Layer);
            store
                .create(&key, &datafile, &meta_for(&key, 1), &b"x"[..])
                .await?;
            index.set_status(&key, EntryStatus::Available)?;
            files.push((key, datafile));
        }

        assert_eq!(store.least_used_file()?, files[0].1);

        // reading d1 bumps it to the front; d2 becomes the tail
        store.read(&files[0].0, &files[0].1).await?;
        assert_eq!(store.least_used_file()?, files[1].1);
        Ok(())
    }

    #[tokio::test]
    async fn restore_rebuilds_only_entries_with_parsable_sidecars() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (index, store) = build_store(&dir);
            for digest in ["aaa", "bbb"] {
                let (key, datafile) = put_entry(&index, &dir, digest, ItemType::Layer);
                store
                    .create(&key, &datafile, &meta_for(&key, 4), &b"data"[..])
                    .await?;
            }
        }
        // orphan content file without a sidecar
        std::fs::write(dir.path().join("ccc.layer"), b"orphan")?;
        // content file with an unparseable sidecar
        std::fs::write(dir.path().join("ddd.layer"), b"data")?;
        std::fs::write(dir.path().join("ddd.layer.meta.json"), b"not json")?;
        // partials are not restore's business
        std::fs::write(dir.path().join("eee.layer.partial"), b"inflight")?;

        let (index, store) = build_store(&dir);
        store.restore()?;

        assert_eq!(index.len(), 2);
        for digest in ["aaa", "bbb"] {
            let key = CacheKey::new(digest);
            assert_eq!(index.get_status(&key), EntryStatus::Available);
            assert!(index.get_response_file(&key).is_ok());
        }
        assert_eq!(index.get_status(&CacheKey::new("ccc")), EntryStatus::NotFound);
        assert_eq!(index.get_status(&CacheKey::new("ddd")), EntryStatus::NotFound);
        // restored entries are eviction candidates right away
        assert!(store.least_used_file().is_ok());
        Ok(())
    }
}
