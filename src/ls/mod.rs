//! Locksystems.
//!
//! A locksystem keeps track of the WebDAV write locks. Two are included:
//!
//! - [`MemLs`](memls::MemLs): a real, in-memory lock table.
//! - [`FakeLs`](fakels::FakeLs): every LOCK succeeds, nothing is
//!   recorded. Just enough for clients that refuse to write without
//!   locking support.
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use xmltree::Element;

use crate::davpath::DavPath;

pub mod fakels;
pub mod memls;

/// Upper limit of a lock timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Type of the locks returned by DavLockSystem methods.
#[derive(Debug, Clone)]
pub struct DavLock {
    /// Token.
    pub token: String,
    /// Path of the locked resource.
    pub path: DavPath,
    /// Principal that owns this lock, if any.
    pub principal: Option<String>,
    /// Owner element as sent by the client.
    pub owner: Option<Element>,
    /// When the lock turns stale (absolute).
    pub timeout_at: Option<SystemTime>,
    /// When the lock turns stale (relative).
    pub timeout: Option<Duration>,
    /// Shared.
    pub shared: bool,
    /// Deep.
    pub deep: bool,
}

impl DavLock {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.timeout_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Does this lock cover `path` (with `deep`, anything below it too)?
    pub fn covers(&self, path: &DavPath, deep: bool) -> bool {
        self.path.as_str() == path.as_str()
            || (self.deep && path.starts_with(&self.path))
            || (deep && self.path.starts_with(path))
    }
}

/// The trait that defines a locksystem.
pub trait DavLockSystem: Debug + Send + Sync {
    /// Lock a node. Returns `Ok(new_lock)` if it succeeded,
    /// or `Err(conflicting_lock)` if it failed.
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock>;

    /// Unlock a node. Returns `Ok(())` if it succeeded, `Err(())` if the
    /// token is not held on this path.
    fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()>;

    /// Refresh a lock. Returns `Ok(refreshed_lock)` if it succeeded.
    fn refresh(
        &self,
        path: &DavPath,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<DavLock, ()>;

    /// Check if the node is locked and if so, whether one of the
    /// submitted lock tokens opens it. Returns `Err(lock)` for the first
    /// lock that is not opened.
    fn check(&self, path: &DavPath, deep: bool, submitted_tokens: &[String]) -> Result<(), DavLock>;

    /// Find the locks that apply to this node.
    fn discover(&self, path: &DavPath) -> Vec<DavLock>;

    /// Delete all locks at this node and below, regardless of owner.
    fn delete(&self, path: &DavPath) -> Result<(), ()>;
}

pub(crate) fn new_token() -> String {
    format!("urn:uuid:{}", uuid::Uuid::new_v4())
}

pub(crate) fn limit_timeout(t: Option<Duration>) -> Duration {
    t.unwrap_or(MAX_TIMEOUT).min(MAX_TIMEOUT)
}
