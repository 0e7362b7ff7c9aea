//! Local filesystem resources.
//!
//! This implementation is stateless: a resource is a path below the base
//! directory plus the `stat` taken when it was resolved.
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;

/// Serves a directory.
#[derive(Debug, Clone)]
pub(crate) struct LocalBackend {
    basedir: Arc<PathBuf>,
}

/// A file or directory below the base directory.
#[derive(Debug)]
pub(crate) struct LocalResource {
    basedir: Arc<PathBuf>,
    path: DavPath,
    abs: PathBuf,
    meta: Option<ResourceMeta>,
}

/// An open local file.
#[derive(Debug)]
pub(crate) struct LocalFile(pub(crate) tokio::fs::File);

impl LocalBackend {
    pub fn new(base: impl Into<PathBuf>) -> LocalBackend {
        LocalBackend {
            basedir: Arc::new(base.into()),
        }
    }
}

// the fingerprint is a hash of where the file is, when it was last
// changed and how big it is.
fn local_meta(abs: &Path, meta: &std::fs::Metadata) -> ResourceMeta {
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let created = meta.created().unwrap_or(modified);
    let size = if meta.is_dir() { 0 } else { meta.len() };
    let nanos = systemtime_nanos(modified).to_string();
    let etag = hash_etag(&[
        abs.to_string_lossy().as_bytes(),
        nanos.as_bytes(),
        size.to_string().as_bytes(),
    ]);
    ResourceMeta {
        is_collection: meta.is_dir(),
        size,
        created,
        modified,
        etag,
    }
}

fn absent(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || not_a_dir(e)
}

// "a/b" where "a" is a file.
#[cfg(unix)]
fn not_a_dir(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTDIR)
}

#[cfg(not(unix))]
fn not_a_dir(_: &io::Error) -> bool {
    false
}

// Symlinks are not followed: they could point anywhere, also outside
// the base directory. A path through one is forbidden.
async fn stat(basedir: &Path, abs: &Path) -> FsResult<Option<ResourceMeta>> {
    let rel = abs.strip_prefix(basedir).map_err(|_| FsError::Forbidden)?;
    let mut cur = basedir.to_path_buf();
    let mut meta = None;
    for component in rel.components() {
        cur.push(component);
        match tokio::fs::symlink_metadata(&cur).await {
            Ok(m) if m.file_type().is_symlink() => {
                debug!("refusing symlink {cur:?}");
                return Err(FsError::Forbidden);
            }
            Ok(m) => meta = Some(m),
            Err(e) if absent(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    match meta {
        Some(m) => Ok(Some(local_meta(abs, &m))),
        // the base directory itself.
        None => match tokio::fs::metadata(abs).await {
            Ok(m) => Ok(Some(local_meta(abs, &m))),
            Err(e) if absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        },
    }
}

impl LocalResource {
    async fn resolve(basedir: Arc<PathBuf>, path: &DavPath) -> FsResult<LocalResource> {
        let abs = path.as_pathbuf_under(&basedir);
        let meta = stat(&basedir, &abs).await?;
        Ok(LocalResource {
            basedir,
            path: path.clone(),
            abs,
            meta,
        })
    }
}

impl DavBackend for LocalBackend {
    fn resolve<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavResource>> {
        async move {
            let res = LocalResource::resolve(self.basedir.clone(), path).await?;
            Ok(Box::new(res) as Box<dyn DavResource>)
        }
        .boxed()
    }
}

impl DavResource for LocalResource {
    fn path(&self) -> &DavPath {
        &self.path
    }

    fn meta(&self) -> Option<&ResourceMeta> {
        self.meta.as_ref()
    }

    fn parent(&self) -> FsFuture<'_, Box<dyn DavResource>> {
        async move {
            let res = LocalResource::resolve(self.basedir.clone(), &self.path.parent()).await?;
            Ok(Box::new(res) as Box<dyn DavResource>)
        }
        .boxed()
    }

    fn children(&self) -> FsFuture<'_, Vec<Box<dyn DavResource>>> {
        async move {
            trace!("FS: read_dir {:?}", self.path);
            let mut read_dir = tokio::fs::read_dir(&self.abs).await?;
            let mut children = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(name) => {
                        debug!("skipping non-utf8 name {name:?}");
                        continue;
                    }
                };
                let abs = entry.path();
                let meta = match tokio::fs::symlink_metadata(&abs).await {
                    Ok(m) if m.file_type().is_symlink() => continue,
                    Ok(m) => local_meta(&abs, &m),
                    Err(e) => {
                        debug!("skipping {abs:?}: {e}");
                        continue;
                    }
                };
                children.push(Box::new(LocalResource {
                    basedir: self.basedir.clone(),
                    path: self.path.join(&name),
                    abs,
                    meta: Some(meta),
                }) as Box<dyn DavResource>);
            }
            children.sort_by(|a, b| a.name().cmp(b.name()));
            Ok(children)
        }
        .boxed()
    }

    fn open(&self, mode: OpenMode) -> FsFuture<'_, Box<dyn DavFile>> {
        async move {
            trace!("FS: open {:?} {:?}", self.path, mode);
            if self.is_collection() {
                return Err(FsError::Forbidden);
            }
            let file = match mode {
                OpenMode::Read | OpenMode::ReadThroughCache => {
                    tokio::fs::File::open(&self.abs).await?
                }
                OpenMode::Write => tokio::fs::File::create(&self.abs).await?,
            };
            Ok(Box::new(LocalFile(file)) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn local_path(&self) -> FsFuture<'_, Option<PathBuf>> {
        let p = if self.is_leaf() {
            Some(self.abs.clone())
        } else {
            None
        };
        async move { Ok(p) }.boxed()
    }

    fn remove(&self) -> FsFuture<'_, ()> {
        async move {
            trace!("FS: remove {:?}", self.path);
            if self.path.is_root() {
                return Err(FsError::Forbidden);
            }
            match &self.meta {
                None => Err(FsError::NotFound),
                Some(m) if m.is_collection => Ok(tokio::fs::remove_dir(&self.abs).await?),
                Some(_) => Ok(tokio::fs::remove_file(&self.abs).await?),
            }
        }
        .boxed()
    }

    fn create_collection(&self) -> FsFuture<'_, ()> {
        async move {
            trace!("FS: create_dir {:?}", self.path);
            if self.exists() {
                return Err(FsError::Exists);
            }
            Ok(tokio::fs::create_dir(&self.abs).await?)
        }
        .boxed()
    }

    fn copy_leaf_to<'a>(&'a self, dst: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            trace!("FS: copy {:?} {:?}", self.path, dst);
            if !self.is_leaf() {
                return Err(FsError::NotFound);
            }
            let to = dst.as_pathbuf_under(&self.basedir);
            if let Err(e) = tokio::fs::copy(&self.abs, &to).await {
                debug!("copy({:?}, {:?}) failed: {}", self.path, dst, e);
                return Err(e.into());
            }
            Ok(())
        }
        .boxed()
    }
}

impl DavFile for LocalFile {
    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        async move {
            let mut buf = BytesMut::with_capacity(count);
            self.0.read_buf(&mut buf).await?;
            Ok(buf.freeze())
        }
        .boxed()
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        async move { Ok(self.0.write_all(&buf).await?) }.boxed()
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        async move {
            self.0.flush().await?;
            Ok(self.0.sync_all().await?)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        let backend = LocalBackend::new(dir.path());

        let root = backend.resolve(&DavPath::root()).await.unwrap();
        assert!(root.is_collection());
        let names: Vec<_> = root
            .children()
            .await
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["b.txt", "sub"]);

        let a = backend.resolve(&DavPath::new("/sub/a.txt").unwrap()).await.unwrap();
        assert!(a.is_leaf());
        assert_eq!(a.size(), 5);
        let missing = backend.resolve(&DavPath::new("/b.txt/nope").unwrap()).await.unwrap();
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn etag_changes_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let path = DavPath::new("/f.txt").unwrap();

        let res = backend.resolve(&path).await.unwrap();
        let mut f = res.open(OpenMode::Write).await.unwrap();
        f.write_bytes(Bytes::from("one")).await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let e1 = backend.resolve(&path).await.unwrap().etag().unwrap().to_string();
        let e2 = backend.resolve(&path).await.unwrap().etag().unwrap().to_string();
        assert_eq!(e1, e2);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let res = backend.resolve(&path).await.unwrap();
        let mut f = res.open(OpenMode::Write).await.unwrap();
        f.write_bytes(Bytes::from("three")).await.unwrap();
        f.flush().await.unwrap();
        drop(f);
        let e3 = backend.resolve(&path).await.unwrap().etag().unwrap().to_string();
        assert_ne!(e1, e3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s3cr3t").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("file")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("dir")).unwrap();
        let backend = LocalBackend::new(dir.path());

        let root = backend.resolve(&DavPath::root()).await.unwrap();
        let names: Vec<_> = root
            .children()
            .await
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["plain.txt"]);

        for path in ["/file", "/dir", "/dir/secret", "/dir/new.txt"] {
            let r = backend.resolve(&DavPath::new(path).unwrap()).await;
            assert!(matches!(r, Err(FsError::Forbidden)), "{path}");
        }
    }
}
