//! Ephemeral in-memory object store.
//!
//! Behaves like a (very) small S3: buckets hold a flat sorted key space,
//! etags are content hashes, every write bumps the modification time.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use super::*;

#[derive(Debug, Clone)]
struct MemObject {
    data: Bytes,
    modified: SystemTime,
    etag: String,
}

#[derive(Debug, Default)]
struct MemBucket {
    created: Option<SystemTime>,
    objects: BTreeMap<String, MemObject>,
}

/// In-memory `ObjectStore`.
#[derive(Debug, Default)]
pub struct MemStore {
    buckets: RwLock<BTreeMap<String, MemBucket>>,
}

fn content_etag(data: &[u8]) -> String {
    let hash = format!("{:x}", Sha256::digest(data));
    hash[..32].to_string()
}

impl MemObject {
    fn new(data: Bytes) -> MemObject {
        MemObject {
            etag: content_etag(&data),
            data,
            modified: SystemTime::now(),
        }
    }

    fn info(&self, key: &str) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: self.data.len() as u64,
            last_modified: self.modified,
            etag: self.etag.clone(),
        }
    }
}

impl MemStore {
    pub fn new() -> Arc<MemStore> {
        Arc::new(MemStore::default())
    }

    /// Create a bucket if it does not exist yet.
    pub fn add_bucket(&self, bucket: &str) {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_insert_with(|| MemBucket {
                created: Some(SystemTime::now()),
                objects: BTreeMap::new(),
            });
    }

    /// Store an object directly, creating the bucket if needed.
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> ObjectInfo {
        self.add_bucket(bucket);
        self.store(bucket, key, data.into())
            .unwrap_or_else(|_| MemObject::new(Bytes::new()).info(key))
    }

    /// Contents of an object.
    pub fn contents(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let buckets = self.buckets.read();
        buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    /// All keys in a bucket.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let buckets = self.buckets.read();
        buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn store(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<ObjectInfo> {
        let mut buckets = self.buckets.write();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        let obj = MemObject::new(data);
        let info = obj.info(key);
        b.objects.insert(key.to_string(), obj);
        Ok(info)
    }

    fn object(&self, bucket: &str, key: &str) -> StoreResult<MemObject> {
        let buckets = self.buckets.read();
        let b = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        b.objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))
    }
}

impl ObjectStore for MemStore {
    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketInfo>> {
        async move {
            let buckets = self.buckets.read();
            Ok(buckets
                .iter()
                .map(|(name, b)| BucketInfo {
                    name: name.clone(),
                    created: b.created.unwrap_or(SystemTime::UNIX_EPOCH),
                })
                .collect())
        }
        .boxed()
    }

    fn get_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, Option<BucketInfo>> {
        async move {
            let buckets = self.buckets.read();
            Ok(buckets.get(bucket).map(|b| BucketInfo {
                name: bucket.to_string(),
                created: b.created.unwrap_or(SystemTime::UNIX_EPOCH),
            }))
        }
        .boxed()
    }

    fn create_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: create_bucket {bucket}");
            self.add_bucket(bucket);
            Ok(())
        }
        .boxed()
    }

    fn delete_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: delete_bucket {bucket}");
            let mut buckets = self.buckets.write();
            match buckets.get(bucket) {
                None => Err(StoreError::NoSuchBucket(bucket.to_string())),
                Some(b) if !b.objects.is_empty() => {
                    Err(StoreError::Other(format!("bucket {bucket} is not empty")))
                }
                Some(_) => {
                    buckets.remove(bucket);
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn list_keys<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<ObjectInfo>> {
        async move {
            let buckets = self.buckets.read();
            let b = buckets
                .get(bucket)
                .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
            Ok(b.objects
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, o)| o.info(k))
                .collect())
        }
        .boxed()
    }

    fn get_key<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, Option<ObjectInfo>> {
        async move {
            match self.object(bucket, key) {
                Ok(o) => Ok(Some(o.info(key))),
                Err(StoreError::NoSuchKey(_)) => Ok(None),
                Err(e) => Err(e),
            }
        }
        .boxed()
    }

    fn fetch_to_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local: &'a Path,
    ) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: fetch {bucket}/{key} -> {local:?}");
            let obj = self.object(bucket, key)?;
            tokio::fs::write(local, &obj.data).await?;
            Ok(())
        }
        .boxed()
    }

    fn put_from_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local: &'a Path,
    ) -> StoreFuture<'a, ObjectInfo> {
        async move {
            trace!("STORE: put {local:?} -> {bucket}/{key}");
            let data = tokio::fs::read(local).await?;
            self.store(bucket, key, Bytes::from(data))
        }
        .boxed()
    }

    fn put_bytes<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: Bytes,
    ) -> StoreFuture<'a, ObjectInfo> {
        async move {
            trace!("STORE: put {} bytes -> {bucket}/{key}", data.len());
            self.store(bucket, key, data)
        }
        .boxed()
    }

    fn copy_key<'a>(
        &'a self,
        src_bucket: &'a str,
        src_key: &'a str,
        dst_bucket: &'a str,
        dst_key: &'a str,
    ) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: copy {src_bucket}/{src_key} -> {dst_bucket}/{dst_key}");
            let obj = self.object(src_bucket, src_key)?;
            self.store(dst_bucket, dst_key, obj.data)?;
            Ok(())
        }
        .boxed()
    }

    fn delete_key<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: delete {bucket}/{key}");
            let mut buckets = self.buckets.write();
            let b = buckets
                .get_mut(bucket)
                .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
            // like S3, deleting a missing key is not an error.
            b.objects.remove(key);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_keys_is_prefix_scoped() {
        let store = MemStore::new();
        store.insert("b", "a/1", "x");
        store.insert("b", "a/2/3", "y");
        store.insert("b", "ab", "z");
        let keys: Vec<_> = store
            .list_keys("b", "a/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2/3"]);
        assert!(store.list_keys("nope", "").await.is_err());
    }

    #[tokio::test]
    async fn etag_follows_content() {
        let store = MemStore::new();
        let a = store.insert("b", "k", "one");
        let b = store.get_key("b", "k").await.unwrap().unwrap();
        assert_eq!(a.etag, b.etag);
        let c = store.insert("b", "k", "two");
        assert_ne!(a.etag, c.etag);
        assert_eq!(c.size, 3);
    }

    #[tokio::test]
    async fn copy_and_delete() {
        let store = MemStore::new();
        store.insert("b", "src", "data");
        store.add_bucket("c");
        store.copy_key("b", "src", "c", "dst").await.unwrap();
        assert_eq!(store.contents("c", "dst").unwrap(), Bytes::from("data"));
        store.delete_key("b", "src").await.unwrap();
        assert!(store.get_key("b", "src").await.unwrap().is_none());
        assert!(store.delete_bucket("c").await.is_err());
        store.delete_key("c", "dst").await.unwrap();
        store.delete_bucket("c").await.unwrap();
        assert!(store.get_bucket("c").await.unwrap().is_none());
    }
}
