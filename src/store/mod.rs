//! Object store interface.
//!
//! The WebDAV side never talks to a storage wire protocol directly. It
//! consumes the small set of operations in [`ObjectStore`]: list buckets,
//! list keys under a prefix, stat a key, fetch a key into a local file,
//! store a local file at a key, copy and delete keys.
//!
//! Store clients are created lazily per credential by a [`ConnectionPool`]
//! and reused for the lifetime of the pool.
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::auth::Credentials;

pub mod memstore;
#[cfg(any(docsrs, feature = "s3"))]
#[cfg_attr(docsrs, doc(cfg(feature = "s3")))]
pub mod s3;

/// Errors reported by an object store client.
#[derive(Debug)]
pub enum StoreError {
    NoSuchBucket(String),
    NoSuchKey(String),
    AccessDenied,
    Io(io::Error),
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Future returned by the `ObjectStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

impl Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NoSuchBucket(b) => write!(f, "no such bucket: {b}"),
            StoreError::NoSuchKey(k) => write!(f, "no such key: {k}"),
            StoreError::AccessDenied => write!(f, "access denied"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// A bucket (top level container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub name: String,
    pub created: SystemTime,
}

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    /// Content fingerprint, without surrounding quotes.
    pub etag: String,
}

impl ObjectInfo {
    /// Keys ending in a slash are directory markers.
    pub fn is_dir_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Client interface of an S3-like object store.
pub trait ObjectStore: Send + Sync {
    /// All buckets visible to this client.
    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketInfo>>;

    /// Look up a single bucket.
    fn get_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, Option<BucketInfo>>;

    fn create_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, ()>;

    fn delete_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, ()>;

    /// All keys that start with `prefix`, at any depth, sorted.
    fn list_keys<'a>(&'a self, bucket: &'a str, prefix: &'a str)
        -> StoreFuture<'a, Vec<ObjectInfo>>;

    /// Stat one key.
    fn get_key<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, Option<ObjectInfo>>;

    /// Download the object into `local`, replacing its contents.
    fn fetch_to_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local: &'a Path,
    ) -> StoreFuture<'a, ()>;

    /// Upload the contents of `local` to `key`.
    fn put_from_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local: &'a Path,
    ) -> StoreFuture<'a, ObjectInfo>;

    /// Store a small in-memory object (directory markers).
    fn put_bytes<'a>(&'a self, bucket: &'a str, key: &'a str, data: Bytes)
        -> StoreFuture<'a, ObjectInfo>;

    /// Server side copy.
    fn copy_key<'a>(
        &'a self,
        src_bucket: &'a str,
        src_key: &'a str,
        dst_bucket: &'a str,
        dst_key: &'a str,
    ) -> StoreFuture<'a, ()>;

    fn delete_key<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ()>;
}

type Connector = dyn Fn(&Credentials) -> StoreResult<Arc<dyn ObjectStore>> + Send + Sync;

/// Store clients, one per set of credentials.
///
/// Clients are created on first use and kept forever. There is no
/// eviction, so the pool grows with the number of distinct credentials
/// that ever authenticated.
pub struct ConnectionPool {
    connector: Box<Connector>,
    conns: RwLock<HashMap<(String, String), Arc<dyn ObjectStore>>>,
}

impl ConnectionPool {
    /// Create a pool that uses `connector` to build a new client.
    pub fn new<F>(connector: F) -> Arc<ConnectionPool>
    where
        F: Fn(&Credentials) -> StoreResult<Arc<dyn ObjectStore>> + Send + Sync + 'static,
    {
        Arc::new(ConnectionPool {
            connector: Box::new(connector),
            conns: RwLock::new(HashMap::new()),
        })
    }

    /// A pool that hands out the same client to every credential.
    pub fn single(store: Arc<dyn ObjectStore>) -> Arc<ConnectionPool> {
        ConnectionPool::new(move |_| Ok(store.clone()))
    }

    /// Get the client for these credentials, connecting if needed.
    pub fn get(&self, creds: &Credentials) -> StoreResult<Arc<dyn ObjectStore>> {
        let id = (creds.access_key.clone(), creds.secret.clone());
        if let Some(conn) = self.conns.read().get(&id) {
            return Ok(conn.clone());
        }
        let mut conns = self.conns.write();
        // somebody else might have connected in the meantime.
        if let Some(conn) = conns.get(&id) {
            return Ok(conn.clone());
        }
        debug!("STORE: new connection for {}", creds.access_key);
        let conn = (self.connector)(creds)?;
        conns.insert(id, conn.clone());
        Ok(conn)
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::memstore::MemStore;
    use super::*;

    #[test]
    fn pool_connects_once_per_key() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let pool = ConnectionPool::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(MemStore::new() as Arc<dyn ObjectStore>)
        });
        let alice = Credentials::new("alice", "s1");
        let bob = Credentials::new("bob", "s2");
        let a1 = pool.get(&alice).unwrap();
        let a2 = pool.get(&alice).unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        pool.get(&bob).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        // a wrong secret never reuses the client of the right one.
        let a3 = pool.get(&Credentials::new("alice", "guess")).unwrap();
        assert!(!Arc::ptr_eq(&a1, &a3));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn pool_does_not_cache_failures() {
        let pool = ConnectionPool::new(|_| Err(StoreError::AccessDenied));
        assert!(pool.get(&Credentials::new("k", "s")).is_err());
        assert!(pool.is_empty());
    }
}
