//! Access control.
//!
//! Permissions are not stored anywhere. They are computed for every
//! request from the path by an [`AccessPolicy`].
use bitflags::bitflags;

use crate::davpath::DavPath;

bitflags! {
    /// Set of capabilities a request has on a path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DavAcl: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const DELETE = 0x04;
        const CREATE = 0x08;
        const RELOCATE = 0x10;
        const LIST = 0x20;

        const READ_ONLY = Self::READ.bits() | Self::LIST.bits();
    }
}

/// Computes the permissions for a path.
pub trait AccessPolicy: Send + Sync {
    fn access(&self, path: &DavPath) -> DavAcl;
}

/// Everything is allowed everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullAccess;

impl AccessPolicy for FullAccess {
    fn access(&self, _path: &DavPath) -> DavAcl {
        DavAcl::all()
    }
}

/// Read and list everywhere, nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

impl AccessPolicy for ReadOnly {
    fn access(&self, _path: &DavPath) -> DavAcl {
        DavAcl::READ_ONLY
    }
}

/// Read-only at the root, full access below it.
///
/// This is the default for object stores: the root lists the buckets,
/// and must not be deleted, moved or written to.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootReadOnly;

impl AccessPolicy for RootReadOnly {
    fn access(&self, path: &DavPath) -> DavAcl {
        if path.is_root() || path.is_star() {
            DavAcl::READ_ONLY
        } else {
            DavAcl::all()
        }
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&DavPath) -> DavAcl + Send + Sync,
{
    fn access(&self, path: &DavPath) -> DavAcl {
        self(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_read_only() {
        let root = DavPath::root();
        let bucket = DavPath::new("/bucket").unwrap();
        assert_eq!(RootReadOnly.access(&root), DavAcl::READ_ONLY);
        assert!(!RootReadOnly.access(&root).contains(DavAcl::DELETE));
        assert!(RootReadOnly.access(&bucket).contains(DavAcl::CREATE | DavAcl::RELOCATE));
        assert!(!ReadOnly.access(&bucket).contains(DavAcl::WRITE));
        let custom = |p: &DavPath| {
            if p.as_str().starts_with("/public") {
                DavAcl::READ_ONLY
            } else {
                DavAcl::empty()
            }
        };
        assert!(custom.access(&DavPath::new("/public/x").unwrap()).contains(DavAcl::READ));
        assert!(custom.access(&bucket).is_empty());
    }
}
