//! Local read-through cache of object store contents.
//!
//! Every object maps to one file below the cache root, at
//! `<root>/<bucket>/<key>`. A cached file is served only when its
//! modification time is not older than the `last_modified` of the object;
//! otherwise it is fetched again first.
//!
//! Fetches of the same cache file are serialized by a per-path lock, and
//! go through a temporary file that is renamed into place, so a reader
//! never sees a half-written file. The freshness check itself is not
//! atomic with respect to a concurrent upload of the same key: a racing
//! writer can cause one extra fetch, never a corrupt file.
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::errors::FsResult;
use crate::store::{ObjectInfo, ObjectStore};

// Give a cache file the modification time of its object.
async fn stamp(tmp: &Path, modified: SystemTime) -> io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(tmp).await?;
    if let Err(e) = file.into_std().await.set_modified(modified) {
        debug!("cannot set mtime of {tmp:?}: {e}");
    }
    Ok(())
}

/// The cache directory.
#[derive(Debug)]
pub struct CacheDir {
    root: PathBuf,
    fetching: Mutex<HashMap<PathBuf, Weak<tokio::sync::Mutex<()>>>>,
}

// keys may contain segments that mean something to a filesystem.
fn cache_segment(seg: &str) -> &str {
    match seg {
        "." => "%2E",
        ".." => "%2E%2E",
        s => s,
    }
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Arc<CacheDir> {
        Arc::new(CacheDir {
            root: root.into(),
            fetching: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of an object (or of a directory prefix).
    pub fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root.join(cache_segment(bucket));
        for seg in key.split('/').filter(|s| !s.is_empty()) {
            path.push(cache_segment(seg));
        }
        path
    }

    /// Is the cached copy at least as new as the object?
    pub async fn is_fresh(&self, path: &Path, info: &ObjectInfo) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta
                .modified()
                .map(|m| m >= info.last_modified)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn fetch_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut fetching = self.fetching.lock();
        if let Some(lock) = fetching.get(path).and_then(|w| w.upgrade()) {
            return lock;
        }
        fetching.retain(|_, w| w.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        fetching.insert(path.to_path_buf(), Arc::downgrade(&lock));
        lock
    }

    /// Make sure the cached copy of `bucket/key` is fresh, and return its path.
    pub async fn refresh(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        key: &str,
        info: &ObjectInfo,
    ) -> FsResult<PathBuf> {
        let path = self.path_for(bucket, key);
        if self.is_fresh(&path, info).await {
            return Ok(path);
        }
        let lock = self.fetch_lock(&path);
        let _guard = lock.lock().await;

        // another request might have done the work while we waited.
        if self.is_fresh(&path, info).await {
            return Ok(path);
        }

        trace!("FS: cache fetch {bucket}/{key} -> {path:?}");
        let tmp = self.temp_path(&path).await?;
        if let Err(e) = store.fetch_to_file(bucket, key, &tmp).await {
            error!("cache fetch of {bucket}/{key} failed: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        // the store's clock decides, not ours.
        stamp(&tmp, info.last_modified).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// A fresh temporary path next to `path`, with the parent directory created.
    pub async fn temp_path(&self, path: &Path) -> io::Result<PathBuf> {
        let parent = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(parent.join(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple())))
    }

    /// Put a freshly uploaded file in place as the cached copy of an
    /// object that was last modified at `modified`.
    pub async fn install(
        &self,
        tmp: &Path,
        bucket: &str,
        key: &str,
        modified: SystemTime,
    ) -> io::Result<()> {
        let path = self.path_for(bucket, key);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.is_dir() {
                // used to be an implicit directory.
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
        }
        stamp(tmp, modified).await?;
        tokio::fs::rename(tmp, &path).await
    }

    /// Forget the cached copy of an object.
    pub async fn invalidate(&self, bucket: &str, key: &str) {
        let path = self.path_for(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => trace!("FS: cache drop {path:?}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot drop cached {path:?}: {e}"),
        }
    }

    /// Forget everything cached below a bucket or a directory prefix.
    pub async fn invalidate_tree(&self, bucket: &str, prefix: &str) {
        let path = self.path_for(bucket, prefix);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => trace!("FS: cache drop {path:?}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot drop cached {path:?}: {e}"),
        }
    }

    /// Modification time of a cached copy, if any.
    pub async fn cached_mtime(&self, bucket: &str, key: &str) -> Option<SystemTime> {
        let meta = tokio::fs::metadata(self.path_for(bucket, key)).await.ok()?;
        meta.modified().ok()
    }
}
