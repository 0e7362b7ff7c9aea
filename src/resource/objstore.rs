//! Object store resources.
//!
//! The flat key space of the store is shown as a hierarchy:
//!
//! - `/` is a virtual collection that lists the buckets.
//! - `/<bucket>` is a collection that exists when the bucket exists.
//! - `/<bucket>/<key>` is a leaf when `<key>` exists. Otherwise it is a
//!   collection when a `<key>/` marker object exists, or when any key
//!   starts with `<key>/` (an implicit directory). A leaf wins over a
//!   directory of the same name.
//!
//! Contents are read through the local [`CacheDir`]; writes go to a
//! temporary file in the cache that is uploaded on flush.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::FutureExt;

use super::localfs::LocalFile;
use super::*;
use crate::cache::CacheDir;
use crate::store::{BucketInfo, ObjectInfo, ObjectStore, StoreError};

/// One store client plus the cache, for the duration of a request.
#[derive(Clone)]
pub(crate) struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    cache: Arc<CacheDir>,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("cache", &self.cache.root())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Root,
    Bucket(String),
    /// Key without trailing slash.
    Key { bucket: String, key: String },
}

impl Node {
    fn from_path(path: &DavPath) -> Node {
        let mut segs = path.segments();
        match segs.next() {
            None => Node::Root,
            Some(bucket) => {
                let key = segs.collect::<Vec<_>>().join("/");
                if key.is_empty() {
                    Node::Bucket(bucket.to_string())
                } else {
                    Node::Key {
                        bucket: bucket.to_string(),
                        key,
                    }
                }
            }
        }
    }

    // bucket and key prefix of the children of this node.
    fn list_prefix(&self) -> Option<(&str, String)> {
        match self {
            Node::Root => None,
            Node::Bucket(b) => Some((b, String::new())),
            Node::Key { bucket, key } => Some((bucket, format!("{key}/"))),
        }
    }
}

/// A node in the bucket / key hierarchy.
#[derive(Debug)]
pub(crate) struct ObjectResource {
    backend: ObjectStoreBackend,
    path: DavPath,
    node: Node,
    meta: Option<ResourceMeta>,
    /// The backing object of a leaf.
    object: Option<ObjectInfo>,
}

fn dir_etag(path: &DavPath, modified: SystemTime) -> String {
    let nanos = systemtime_nanos(modified).to_string();
    hash_etag(&[path.as_str().as_bytes(), nanos.as_bytes()])
}

fn collection_meta(path: &DavPath, created: SystemTime, modified: SystemTime) -> ResourceMeta {
    ResourceMeta {
        is_collection: true,
        size: 0,
        created,
        modified,
        etag: dir_etag(path, modified),
    }
}

fn leaf_meta(info: &ObjectInfo) -> ResourceMeta {
    ResourceMeta {
        is_collection: false,
        size: info.size,
        created: info.last_modified,
        modified: info.last_modified,
        etag: info.etag.clone(),
    }
}

// a missing bucket makes everything below it missing.
fn absent<T>(r: Result<Option<T>, StoreError>) -> FsResult<Option<T>> {
    match r {
        Ok(v) => Ok(v),
        Err(StoreError::NoSuchBucket(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// Entry for one child name while grouping a key listing.
struct ChildEntry {
    leaf: Option<ObjectInfo>,
    is_dir: bool,
    newest: SystemTime,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<CacheDir>) -> ObjectStoreBackend {
        ObjectStoreBackend { store, cache }
    }

    fn resource(
        &self,
        path: DavPath,
        node: Node,
        meta: Option<ResourceMeta>,
        object: Option<ObjectInfo>,
    ) -> ObjectResource {
        ObjectResource {
            backend: self.clone(),
            path,
            node,
            meta,
            object,
        }
    }

    fn bucket_resource(&self, parent: &DavPath, info: BucketInfo) -> ObjectResource {
        let path = parent.join(&info.name);
        let meta = collection_meta(&path, info.created, info.created);
        self.resource(path, Node::Bucket(info.name), Some(meta), None)
    }

    async fn resolve_path(&self, path: &DavPath) -> FsResult<ObjectResource> {
        let node = Node::from_path(path);
        match &node {
            Node::Root => {
                let buckets = self.store.list_buckets().await?;
                let newest = buckets
                    .iter()
                    .map(|b| b.created)
                    .max()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let meta = collection_meta(path, SystemTime::UNIX_EPOCH, newest);
                Ok(self.resource(path.clone(), node, Some(meta), None))
            }
            Node::Bucket(bucket) => {
                let meta = self
                    .store
                    .get_bucket(bucket)
                    .await?
                    .map(|b| collection_meta(path, b.created, b.created));
                Ok(self.resource(path.clone(), node, meta, None))
            }
            Node::Key { bucket, key } => {
                if let Some(info) = absent(self.store.get_key(bucket, key).await)? {
                    let meta = leaf_meta(&info);
                    return Ok(self.resource(path.clone(), node, Some(meta), Some(info)));
                }
                let prefix = format!("{key}/");
                let below = absent(self.store.list_keys(bucket, &prefix).await.map(Some))?
                    .unwrap_or_default();
                let meta = below
                    .iter()
                    .map(|o| o.last_modified)
                    .max()
                    .map(|newest| collection_meta(path, newest, newest));
                Ok(self.resource(path.clone(), node, meta, None))
            }
        }
    }

    async fn list_children(&self, parent: &ObjectResource) -> FsResult<Vec<Box<dyn DavResource>>> {
        let (bucket, prefix) = match parent.node.list_prefix() {
            Some(bp) => bp,
            None => {
                let buckets = self.store.list_buckets().await?;
                return Ok(buckets
                    .into_iter()
                    .map(|b| Box::new(self.bucket_resource(&parent.path, b)) as Box<dyn DavResource>)
                    .collect());
            }
        };

        let mut entries: BTreeMap<String, ChildEntry> = BTreeMap::new();
        for obj in self.store.list_keys(bucket, &prefix).await? {
            let rest = &obj.key[prefix.len()..];
            let (name, is_dir) = match rest.find('/') {
                None => (rest, false),
                Some(idx) => (&rest[..idx], true),
            };
            if name.is_empty() {
                continue;
            }
            let entry = entries.entry(name.to_string()).or_insert(ChildEntry {
                leaf: None,
                is_dir: false,
                newest: obj.last_modified,
            });
            entry.newest = entry.newest.max(obj.last_modified);
            if is_dir {
                entry.is_dir = true;
            } else {
                entry.leaf = Some(obj);
            }
        }

        let mut children = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let path = parent.path.join(&name);
            let node = Node::Key {
                bucket: bucket.to_string(),
                key: format!("{prefix}{name}"),
            };
            let res = match entry.leaf {
                Some(info) => self.resource(path, node, Some(leaf_meta(&info)), Some(info)),
                None => {
                    let meta = collection_meta(&path, entry.newest, entry.newest);
                    self.resource(path, node, Some(meta), None)
                }
            };
            children.push(Box::new(res) as Box<dyn DavResource>);
        }
        Ok(children)
    }
}

impl DavBackend for ObjectStoreBackend {
    fn resolve<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavResource>> {
        async move {
            trace!("STORE: resolve {path:?}");
            let res = self.resolve_path(path).await?;
            Ok(Box::new(res) as Box<dyn DavResource>)
        }
        .boxed()
    }
}

impl ObjectResource {
    fn bucket_key(&self) -> FsResult<(&str, &str)> {
        match &self.node {
            Node::Key { bucket, key } => Ok((bucket, key)),
            _ => Err(FsError::Forbidden),
        }
    }

    async fn cached_copy(&self) -> FsResult<PathBuf> {
        let (bucket, key) = self.bucket_key()?;
        let info = self.object.as_ref().ok_or(FsError::NotFound)?;
        let backend = &self.backend;
        backend
            .cache
            .refresh(&*backend.store, bucket, key, info)
            .await
    }
}

impl DavResource for ObjectResource {
    fn path(&self) -> &DavPath {
        &self.path
    }

    fn meta(&self) -> Option<&ResourceMeta> {
        self.meta.as_ref()
    }

    fn parent(&self) -> FsFuture<'_, Box<dyn DavResource>> {
        async move {
            let res = self.backend.resolve_path(&self.path.parent()).await?;
            Ok(Box::new(res) as Box<dyn DavResource>)
        }
        .boxed()
    }

    fn children(&self) -> FsFuture<'_, Vec<Box<dyn DavResource>>> {
        async move {
            if !self.is_collection() {
                return Ok(Vec::new());
            }
            self.backend.list_children(self).await
        }
        .boxed()
    }

    fn open(&self, mode: OpenMode) -> FsFuture<'_, Box<dyn DavFile>> {
        async move {
            trace!("STORE: open {:?} {:?}", self.path, mode);
            if self.is_collection() {
                return Err(FsError::Forbidden);
            }
            match mode {
                OpenMode::Read | OpenMode::ReadThroughCache => {
                    let path = self.cached_copy().await?;
                    let file = tokio::fs::File::open(&path).await?;
                    Ok(Box::new(LocalFile(file)) as Box<dyn DavFile>)
                }
                OpenMode::Write => {
                    let (bucket, key) = self.bucket_key()?;
                    let cache = &self.backend.cache;
                    let tmp = cache.temp_path(&cache.path_for(bucket, key)).await?;
                    let file = tokio::fs::File::create(&tmp).await?;
                    Ok(Box::new(UploadFile {
                        backend: self.backend.clone(),
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        tmp,
                        file: Some(file),
                    }) as Box<dyn DavFile>)
                }
            }
        }
        .boxed()
    }

    fn local_path(&self) -> FsFuture<'_, Option<PathBuf>> {
        async move {
            if !self.is_leaf() {
                return Ok(None);
            }
            Ok(Some(self.cached_copy().await?))
        }
        .boxed()
    }

    fn remove(&self) -> FsFuture<'_, ()> {
        async move {
            trace!("STORE: remove {:?}", self.path);
            if !self.exists() {
                return Err(FsError::NotFound);
            }
            let store = &self.backend.store;
            let cache = &self.backend.cache;
            match &self.node {
                Node::Root => Err(FsError::Forbidden),
                Node::Bucket(bucket) => {
                    // keys that have no place in the hierarchy (like "a//b").
                    for obj in store.list_keys(bucket, "").await? {
                        store.delete_key(bucket, &obj.key).await?;
                    }
                    store.delete_bucket(bucket).await?;
                    cache.invalidate_tree(bucket, "").await;
                    Ok(())
                }
                Node::Key { bucket, key } if self.is_collection() => {
                    // the marker, and keys hidden behind a leaf of the same
                    // name (like "d/x/y" next to "d/x").
                    for obj in store.list_keys(bucket, &format!("{key}/")).await? {
                        store.delete_key(bucket, &obj.key).await?;
                    }
                    cache.invalidate_tree(bucket, key).await;
                    Ok(())
                }
                Node::Key { bucket, key } => {
                    store.delete_key(bucket, key).await?;
                    cache.invalidate(bucket, key).await;
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn create_collection(&self) -> FsFuture<'_, ()> {
        async move {
            trace!("STORE: mkcol {:?}", self.path);
            if self.exists() {
                return Err(FsError::Exists);
            }
            let store = &self.backend.store;
            match &self.node {
                Node::Root => Err(FsError::Exists),
                Node::Bucket(bucket) => Ok(store.create_bucket(bucket).await?),
                Node::Key { bucket, key } => {
                    store
                        .put_bytes(bucket, &format!("{key}/"), Bytes::new())
                        .await?;
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn copy_leaf_to<'a>(&'a self, dst: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            trace!("STORE: copy {:?} {:?}", self.path, dst);
            let (src_bucket, src_key) = self.bucket_key()?;
            if self.object.is_none() {
                return Err(FsError::NotFound);
            }
            let (dst_bucket, dst_key) = match Node::from_path(dst) {
                Node::Key { bucket, key } => (bucket, key),
                _ => return Err(FsError::Forbidden),
            };
            self.backend
                .store
                .copy_key(src_bucket, src_key, &dst_bucket, &dst_key)
                .await?;
            self.backend.cache.invalidate(&dst_bucket, &dst_key).await;
            Ok(())
        }
        .boxed()
    }
}

/// A new version of an object, written to the cache and uploaded on flush.
#[derive(Debug)]
struct UploadFile {
    backend: ObjectStoreBackend,
    bucket: String,
    key: String,
    tmp: PathBuf,
    file: Option<tokio::fs::File>,
}

impl DavFile for UploadFile {
    fn read_bytes(&mut self, _count: usize) -> FsFuture<'_, Bytes> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        async move {
            use tokio::io::AsyncWriteExt;
            let file = self.file.as_mut().ok_or(FsError::Forbidden)?;
            Ok(file.write_all(&buf).await?)
        }
        .boxed()
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        async move {
            use tokio::io::AsyncWriteExt;
            let mut file = self.file.take().ok_or(FsError::Forbidden)?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            let store = &self.backend.store;
            let info = store.put_from_file(&self.bucket, &self.key, &self.tmp).await?;
            let cache = &self.backend.cache;
            if let Err(e) = cache
                .install(&self.tmp, &self.bucket, &self.key, info.last_modified)
                .await
            {
                warn!("cannot cache {}/{}: {}", self.bucket, self.key, e);
                cache.invalidate(&self.bucket, &self.key).await;
            }
            Ok(())
        }
        .boxed()
    }
}

impl Drop for UploadFile {
    fn drop(&mut self) {
        // the temp file is renamed away after a successful flush.
        if self.tmp.exists() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memstore::MemStore;

    fn setup() -> (tempfile::TempDir, Arc<MemStore>, ObjectStoreBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::new();
        let backend = ObjectStoreBackend::new(store.clone(), CacheDir::new(dir.path()));
        (dir, store, backend)
    }

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn namespace() {
        let (_dir, store, backend) = setup();
        store.insert("b", "top.txt", "1");
        store.insert("b", "marked/", "");
        store.insert("b", "implicit/deep/file", "22");

        let root = backend.resolve(&DavPath::root()).await.unwrap();
        assert!(root.is_collection());
        let buckets = root.children().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].path().as_str(), "/b");

        let b = backend.resolve(&p("/b")).await.unwrap();
        let names: Vec<_> = b
            .children()
            .await
            .unwrap()
            .iter()
            .map(|c| (c.name().to_string(), c.is_collection()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("implicit".to_string(), true),
                ("marked".to_string(), true),
                ("top.txt".to_string(), false),
            ]
        );

        assert!(backend.resolve(&p("/b/implicit")).await.unwrap().is_collection());
        assert!(backend.resolve(&p("/b/implicit/deep")).await.unwrap().is_collection());
        assert!(backend.resolve(&p("/b/marked")).await.unwrap().is_collection());
        let leaf = backend.resolve(&p("/b/implicit/deep/file")).await.unwrap();
        assert!(leaf.is_leaf());
        assert_eq!(leaf.size(), 2);
        assert!(!backend.resolve(&p("/b/nope")).await.unwrap().exists());
        assert!(!backend.resolve(&p("/nobucket/x")).await.unwrap().exists());
        assert!(!backend.resolve(&p("/nobucket")).await.unwrap().exists());
    }

    #[tokio::test]
    async fn write_then_read_through_cache() {
        let (dir, store, backend) = setup();
        store.add_bucket("b");
        let path = p("/b/new.txt");
        let res = backend.resolve(&path).await.unwrap();
        let mut f = res.open(OpenMode::Write).await.unwrap();
        f.write_bytes(Bytes::from("payload")).await.unwrap();
        f.flush().await.unwrap();
        drop(f);
        assert_eq!(store.contents("b", "new.txt").unwrap(), Bytes::from("payload"));
        assert!(dir.path().join("b/new.txt").exists());

        // change the object behind the back of the cache.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.insert("b", "new.txt", "changed");
        let res = backend.resolve(&path).await.unwrap();
        let mut f = res.open(OpenMode::ReadThroughCache).await.unwrap();
        let data = f.read_bytes(1024).await.unwrap();
        assert_eq!(data, Bytes::from("changed"));
    }

    #[tokio::test]
    async fn mkcol_and_remove() {
        let (_dir, store, backend) = setup();
        let bucket = backend.resolve(&p("/fresh")).await.unwrap();
        bucket.create_collection().await.unwrap();
        assert!(store.get_bucket("fresh").await.unwrap().is_some());

        let dir = backend.resolve(&p("/fresh/sub")).await.unwrap();
        dir.create_collection().await.unwrap();
        assert_eq!(store.keys("fresh"), vec!["sub/"]);
        let dir = backend.resolve(&p("/fresh/sub")).await.unwrap();
        assert!(matches!(dir.create_collection().await, Err(FsError::Exists)));

        dir.remove().await.unwrap();
        assert!(store.keys("fresh").is_empty());
        let bucket = backend.resolve(&p("/fresh")).await.unwrap();
        bucket.remove().await.unwrap();
        assert!(store.get_bucket("fresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leaf_wins_over_directory() {
        let (_dir, store, backend) = setup();
        store.insert("b", "x", "leaf");
        store.insert("b", "x/y", "below");
        let b = backend.resolve(&p("/b")).await.unwrap();
        let children = b.children().await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_leaf());
        assert!(backend.resolve(&p("/b/x")).await.unwrap().is_leaf());
    }

    #[tokio::test]
    async fn remove_takes_hidden_keys_along() {
        let (_dir, store, backend) = setup();
        store.insert("b", "d/", "");
        store.insert("b", "d/x", "leaf");
        store.insert("b", "d/x/y", "hidden");
        let d = backend.resolve(&p("/b/d")).await.unwrap();
        let x = backend.resolve(&p("/b/d/x")).await.unwrap();
        x.remove().await.unwrap();
        d.remove().await.unwrap();
        assert!(store.keys("b").is_empty());
        assert!(!backend.resolve(&p("/b/d")).await.unwrap().exists());
    }
}
