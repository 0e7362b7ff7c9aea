//! The resource abstraction.
//!
//! A [`DavResource`] is one node of the exported hierarchy, a collection
//! or a leaf, or a node that does not exist (yet). Resources are resolved
//! from a path by a [`DavBackend`] for every request and hold a snapshot
//! of the metadata taken at that time. Nothing is cached between requests.
//!
//! The recursive algorithms (walk, delete, copy, move) are written once
//! here against the trait, and work for every backend.
use std::fmt::Debug;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

use async_stream::stream;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use sha2::{Digest, Sha256};

use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::multierror::MultiError;

pub(crate) mod localfs;
pub(crate) mod objstore;

/// Future returned by the resource methods.
pub type FsFuture<'a, T> = Pin<Box<dyn Future<Output = FsResult<T>> + Send + 'a>>;

/// Metadata of an existing resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    pub is_collection: bool,
    pub size: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    /// Opaque fingerprint, without quotes.
    pub etag: String,
}

/// How to open a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Like `Read`, but bring a cached copy up to date first.
    ReadThroughCache,
}

/// Recursion depth of a walk or copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Finite(u32),
    Infinity,
}

impl Depth {
    pub fn is_zero(&self) -> bool {
        matches!(self, Depth::Finite(0))
    }

    /// The depth one level further down.
    pub fn decrement(&self) -> Depth {
        match *self {
            Depth::Finite(n) => Depth::Finite(n.saturating_sub(1)),
            Depth::Infinity => Depth::Infinity,
        }
    }
}

/// An open leaf.
pub trait DavFile: Debug + Send {
    /// Read at most `count` bytes. An empty buffer means end of file.
    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes>;
    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()>;
    /// Commit what was written. For an object store this is the upload.
    fn flush(&mut self) -> FsFuture<'_, ()>;
}

/// One node in the hierarchy.
pub trait DavResource: Debug + Send + Sync {
    fn path(&self) -> &DavPath;

    /// `None` if the resource does not exist.
    fn meta(&self) -> Option<&ResourceMeta>;

    fn exists(&self) -> bool {
        self.meta().is_some()
    }

    fn is_collection(&self) -> bool {
        self.meta().map(|m| m.is_collection).unwrap_or(false)
    }

    fn is_leaf(&self) -> bool {
        self.meta().map(|m| !m.is_collection).unwrap_or(false)
    }

    /// Last path segment.
    fn name(&self) -> &str {
        self.path().file_name()
    }

    fn size(&self) -> u64 {
        self.meta().map(|m| m.size).unwrap_or(0)
    }

    fn etag(&self) -> Option<&str> {
        self.meta().map(|m| m.etag.as_str())
    }

    fn modified(&self) -> Option<SystemTime> {
        self.meta().map(|m| m.modified)
    }

    fn created(&self) -> Option<SystemTime> {
        self.meta().map(|m| m.created)
    }

    fn parent(&self) -> FsFuture<'_, Box<dyn DavResource>>;

    /// Direct children. Only defined for collections.
    fn children(&self) -> FsFuture<'_, Vec<Box<dyn DavResource>>>;

    fn open(&self, mode: OpenMode) -> FsFuture<'_, Box<dyn DavFile>>;

    /// Path of a local file with the current contents, for X-Sendfile.
    fn local_path(&self) -> FsFuture<'_, Option<PathBuf>>;

    /// Remove this node only: a leaf, or a collection without children.
    fn remove(&self) -> FsFuture<'_, ()>;

    /// Fails with `FsError::Exists` if the resource already exists.
    fn create_collection(&self) -> FsFuture<'_, ()>;

    /// Duplicate this leaf at `dst`, which must not be a collection.
    fn copy_leaf_to<'a>(&'a self, dst: &'a DavPath) -> FsFuture<'a, ()>;
}

/// Resolves paths to resources.
pub trait DavBackend: Send + Sync {
    fn resolve<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavResource>>;
}

/// Fingerprint for resources that have no native one.
pub(crate) fn hash_etag(parts: &[&[u8]]) -> String {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
        h.update([0u8]);
    }
    let hash = format!("{:x}", h.finalize());
    hash[..32].to_string()
}

pub(crate) fn systemtime_nanos(t: SystemTime) -> u128 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Walk `res` and its descendants, pre-order, down to `depth`.
///
/// Depth zero yields only `res` itself. Failures to list a collection
/// are yielded as errors; the walk continues with the next node.
pub fn descendants(
    res: Box<dyn DavResource>,
    depth: Depth,
) -> BoxStream<'static, FsResult<Box<dyn DavResource>>> {
    Box::pin(stream! {
        let mut stack = vec![(res, depth)];
        while let Some((res, depth)) = stack.pop() {
            if res.is_collection() && !depth.is_zero() {
                match res.children().await {
                    Ok(children) => {
                        let next = depth.decrement();
                        stack.extend(children.into_iter().rev().map(|c| (c, next)));
                    }
                    Err(e) => {
                        yield Ok(res);
                        yield Err(e);
                        continue;
                    }
                }
            }
            yield Ok(res);
        }
    })
}

type TreeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

fn fail(errors: &mut MultiError, path: &DavPath, what: &str, e: FsError) {
    warn!("{what} {path} failed: {e}");
    errors.add(path.clone(), e.statuscode());
}

/// Remove `res` and everything below it.
///
/// Children go first. A failure is recorded and the walk continues with
/// the siblings; a collection with a failed child is left in place.
/// Returns `true` if everything was removed.
pub(crate) fn delete_tree<'a>(res: &'a dyn DavResource, errors: &'a mut MultiError) -> TreeFuture<'a> {
    async move {
        if !res.exists() {
            return true;
        }
        let mut ok = true;
        if res.is_collection() {
            match res.children().await {
                Ok(children) => {
                    for child in &children {
                        ok &= delete_tree(child.as_ref(), errors).await;
                    }
                }
                Err(e) => {
                    fail(errors, res.path(), "list", e);
                    return false;
                }
            }
        }
        if !ok {
            return false;
        }
        match res.remove().await {
            Ok(()) => true,
            Err(e) => {
                fail(errors, res.path(), "delete", e);
                false
            }
        }
    }
    .boxed()
}

/// Copy `src` to `dst`.
///
/// A collection is recreated at `dst`, and with `Depth::Infinity` its
/// children are copied recursively. A destination of the other kind is
/// removed first. Failures are recorded against the destination path.
/// Returns `true` if everything was copied.
pub(crate) fn copy_tree<'a>(
    backend: &'a dyn DavBackend,
    src: &'a dyn DavResource,
    dst: DavPath,
    depth: Depth,
    errors: &'a mut MultiError,
) -> TreeFuture<'a> {
    async move {
        let dres = match backend.resolve(&dst).await {
            Ok(d) => d,
            Err(e) => {
                fail(errors, &dst, "resolve", e);
                return false;
            }
        };

        if dres.exists() && dres.is_collection() != src.is_collection() {
            if !delete_tree(dres.as_ref(), errors).await {
                return false;
            }
        }

        if src.is_leaf() {
            return match src.copy_leaf_to(&dst).await {
                Ok(()) => true,
                Err(e) => {
                    fail(errors, &dst, "copy", e);
                    false
                }
            };
        }

        if !dres.is_collection() {
            // the snapshot is stale if a leaf was just removed.
            let created = match backend.resolve(&dst).await {
                Ok(fresh) => fresh.create_collection().await,
                Err(e) => Err(e),
            };
            if let Err(e) = created {
                fail(errors, &dst, "mkcol", e);
                return false;
            }
        }
        if depth.is_zero() {
            return true;
        }

        let children = match src.children().await {
            Ok(c) => c,
            Err(e) => {
                fail(errors, src.path(), "list", e);
                return false;
            }
        };
        let mut ok = true;
        let next = depth.decrement();
        for child in &children {
            let cdst = dst.join(child.name());
            ok &= copy_tree(backend, child.as_ref(), cdst, next, errors).await;
        }
        ok
    }
    .boxed()
}

/// Move = copy everything, then delete the source if that fully worked.
pub(crate) fn move_tree<'a>(
    backend: &'a dyn DavBackend,
    src: &'a dyn DavResource,
    dst: DavPath,
    errors: &'a mut MultiError,
) -> TreeFuture<'a> {
    async move {
        if !copy_tree(backend, src, dst, Depth::Infinity, errors).await {
            return false;
        }
        delete_tree(src, errors).await
    }
    .boxed()
}
