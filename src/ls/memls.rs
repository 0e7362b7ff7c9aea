//! Ephemeral in-memory locksystem.
//!
//! Locks are kept in a flat table. Expired locks are ignored by the
//! readers and pruned by the writers.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use xmltree::Element;

use crate::davpath::DavPath;
use crate::ls::*;

#[derive(Debug, Default)]
pub struct MemLs {
    locks: RwLock<Vec<DavLock>>,
}

impl MemLs {
    /// Create a new "memls" locksystem.
    pub fn new() -> Arc<MemLs> {
        Arc::new(MemLs::default())
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        self.locks.read().iter().filter(|l| !l.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DavLockSystem for MemLs {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock> {
        let now = SystemTime::now();
        let mut locks = self.locks.write();
        locks.retain(|l| !l.is_expired(now));

        // an exclusive lock conflicts with everything, shared locks
        // only with exclusive ones.
        if let Some(l) = locks
            .iter()
            .find(|l| l.covers(path, deep) && (!shared || !l.shared))
        {
            debug!("lock {} conflicts with {}", path, l.token);
            return Err(l.clone());
        }

        let timeout = limit_timeout(timeout);
        let lock = DavLock {
            token: new_token(),
            path: path.clone(),
            principal: principal.map(|s| s.to_string()),
            owner: owner.cloned(),
            timeout_at: Some(now + timeout),
            timeout: Some(timeout),
            shared,
            deep,
        };
        debug!("lock {} created on {}", lock.token, path);
        locks.push(lock.clone());
        Ok(lock)
    }

    fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()> {
        let now = SystemTime::now();
        let mut locks = self.locks.write();
        locks.retain(|l| !l.is_expired(now));
        let idx = locks
            .iter()
            .position(|l| l.token == token && l.covers(path, false))
            .ok_or(())?;
        let lock = locks.remove(idx);
        debug!("lock {} removed", lock.token);
        Ok(())
    }

    fn refresh(
        &self,
        path: &DavPath,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<DavLock, ()> {
        let now = SystemTime::now();
        let mut locks = self.locks.write();
        locks.retain(|l| !l.is_expired(now));
        let lock = locks
            .iter_mut()
            .find(|l| l.token == token && l.covers(path, false))
            .ok_or(())?;
        let timeout = limit_timeout(timeout);
        lock.timeout = Some(timeout);
        lock.timeout_at = Some(now + timeout);
        Ok(lock.clone())
    }

    fn check(&self, path: &DavPath, deep: bool, submitted_tokens: &[String]) -> Result<(), DavLock> {
        let now = SystemTime::now();
        let locks = self.locks.read();
        let held = |l: &DavLock| submitted_tokens.iter().any(|t| *t == l.token);
        let relevant: Vec<&DavLock> = locks
            .iter()
            .filter(|l| !l.is_expired(now) && l.covers(path, deep))
            .collect();
        for l in &relevant {
            if held(l) {
                continue;
            }
            // one token opens all shared locks on the same node.
            let opened = l.shared
                && relevant
                    .iter()
                    .any(|o| o.shared && o.path.as_str() == l.path.as_str() && held(o));
            if !opened {
                return Err((*l).clone());
            }
        }
        Ok(())
    }

    fn discover(&self, path: &DavPath) -> Vec<DavLock> {
        let now = SystemTime::now();
        self.locks
            .read()
            .iter()
            .filter(|l| !l.is_expired(now) && l.covers(path, false))
            .cloned()
            .collect()
    }

    fn delete(&self, path: &DavPath) -> Result<(), ()> {
        let now = SystemTime::now();
        let mut locks = self.locks.write();
        locks.retain(|l| !l.is_expired(now) && !l.path.starts_with(path));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[test]
    fn exclusive_and_shared() {
        let ls = MemLs::new();
        let a = ls.lock(&p("/b/a"), None, None, None, false, false).unwrap();
        // exclusive conflicts with everything.
        assert!(ls.lock(&p("/b/a"), None, None, None, true, false).is_err());
        // a deep lock on the parent covers /b/a.
        assert!(ls.lock(&p("/b"), None, None, None, false, true).is_err());
        // but a shallow one does not.
        assert!(ls.lock(&p("/b"), None, None, None, false, false).is_ok());

        let s1 = ls.lock(&p("/b/s"), None, None, None, true, false).unwrap();
        let s2 = ls.lock(&p("/b/s"), None, None, None, true, false).unwrap();
        assert_ne!(s1.token, s2.token);
        assert!(ls.lock(&p("/b/s"), None, None, None, false, false).is_err());

        assert!(ls.unlock(&p("/b/a"), "urn:uuid:nope").is_err());
        ls.unlock(&p("/b/a"), &a.token).unwrap();
        assert!(ls.lock(&p("/b/a"), None, None, None, true, false).is_ok());
    }

    #[test]
    fn check_needs_token() {
        let ls = MemLs::new();
        let l = ls.lock(&p("/b/dir"), None, None, None, false, true).unwrap();
        assert!(ls.check(&p("/b/dir/file"), false, &[]).is_err());
        assert!(ls.check(&p("/b/dir/file"), false, &[l.token.clone()]).is_ok());
        // deep operation on the parent touches the locked subtree.
        assert!(ls.check(&p("/b"), true, &[]).is_err());
        assert!(ls.check(&p("/b"), false, &[]).is_ok());
        assert!(ls.check(&p("/b/other"), true, &[]).is_ok());
        assert_eq!(ls.discover(&p("/b/dir/x")).len(), 1);
    }

    #[test]
    fn delete_clears_subtree_and_expiry() {
        let ls = MemLs::new();
        ls.lock(&p("/b/dir/x"), None, None, None, false, false).unwrap();
        ls.lock(&p("/b/dir/y"), None, None, None, false, false).unwrap();
        ls.lock(&p("/b/keep"), None, None, None, false, false).unwrap();
        ls.delete(&p("/b/dir")).unwrap();
        assert_eq!(ls.len(), 1);

        let empty = MemLs::new();
        empty.delete(&p("/anything")).unwrap();
        assert!(empty.is_empty());

        let short = ls
            .lock(&p("/b/t"), None, None, Some(Duration::from_millis(1)), false, false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(ls.check(&p("/b/t"), false, &[]).is_ok());
        assert!(ls.refresh(&p("/b/t"), &short.token, None).is_err());
    }
}
