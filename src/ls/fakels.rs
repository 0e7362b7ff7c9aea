//! Fake locksystem.
//!
//! LOCK/UNLOCK always succeed, checking for locktokens in
//! If: headers always succeeds, nothing is ever really locked.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use xmltree::Element;

use crate::davpath::DavPath;
use crate::ls::*;

#[derive(Debug, Clone, Default)]
pub struct FakeLs {}

impl FakeLs {
    /// Create a new "fakels" locksystem.
    pub fn new() -> Arc<FakeLs> {
        Arc::new(FakeLs {})
    }
}

impl DavLockSystem for FakeLs {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock> {
        let timeout = limit_timeout(timeout);
        let lock = DavLock {
            token: new_token(),
            path: path.clone(),
            principal: principal.map(|s| s.to_string()),
            owner: owner.cloned(),
            timeout_at: Some(SystemTime::now() + timeout),
            timeout: Some(timeout),
            shared,
            deep,
        };
        debug!("fake lock {} created", &lock.token);
        Ok(lock)
    }

    fn unlock(&self, _path: &DavPath, _token: &str) -> Result<(), ()> {
        Ok(())
    }

    fn refresh(
        &self,
        path: &DavPath,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<DavLock, ()> {
        debug!("refresh fake lock {token}");
        let timeout = limit_timeout(timeout);
        Ok(DavLock {
            token: token.to_string(),
            path: path.clone(),
            principal: None,
            owner: None,
            timeout_at: Some(SystemTime::now() + timeout),
            timeout: Some(timeout),
            shared: false,
            deep: false,
        })
    }

    fn check(&self, _path: &DavPath, _deep: bool, _tokens: &[String]) -> Result<(), DavLock> {
        Ok(())
    }

    fn discover(&self, _path: &DavPath) -> Vec<DavLock> {
        Vec::new()
    }

    fn delete(&self, _path: &DavPath) -> Result<(), ()> {
        Ok(())
    }
}
