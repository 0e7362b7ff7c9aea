//! Utility module to handle the path part of an URL as a filesystem path.
//!
use std::fmt;
use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::DavError;

// Encode all non-unreserved characters, except '/'.
// See RFC3986, and https://en.wikipedia.org/wiki/Percent-encoding .
pub(crate) const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// URL path, with hidden prefix.
///
/// The path is stored decoded and normalized: it always starts with `/`,
/// never has empty, `.` or `..` segments and never ends with a `/`
/// (except for the root itself). Whether a node is a collection is not
/// encoded in the path; that is decided by the backing store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DavPath {
    path: String,
    prefix: String,
    star: bool,
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_url_string_with_prefix())
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_url_string_with_prefix())
    }
}

// collapse slashes, resolve "." and "..", strip the trailing slash.
fn normalize_path(path: &str) -> Result<String, DavError> {
    if path.contains('\0') {
        return Err(DavError::InvalidPath);
    }
    let mut segs: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segs.pop().is_none() {
                    return Err(DavError::InvalidPath);
                }
            }
            s => segs.push(s),
        }
    }
    Ok(format!("/{}", segs.join("/")))
}

impl DavPath {
    /// Create a path from a decoded string, without a prefix.
    pub fn new(path: &str) -> Result<DavPath, DavError> {
        Ok(DavPath {
            path: normalize_path(path)?,
            prefix: String::new(),
            star: false,
        })
    }

    /// The root path ("/").
    pub fn root() -> DavPath {
        DavPath {
            path: "/".to_string(),
            prefix: String::new(),
            star: false,
        }
    }

    /// Create from the (still percent-encoded) path of an URL, stripping `prefix`.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, DavError> {
        if src == "*" {
            return Ok(DavPath {
                path: "*".to_string(),
                prefix: String::new(),
                star: true,
            });
        }
        if !src.starts_with('/') {
            return Err(DavError::InvalidPath);
        }
        let decoded = percent_decode_str(src)
            .decode_utf8()
            .map_err(|_| DavError::InvalidPath)?;
        let prefix = prefix.trim_end_matches('/');
        let rest = match decoded.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return Err(DavError::InvalidPath),
        };
        Ok(DavPath {
            path: normalize_path(rest)?,
            prefix: prefix.to_string(),
            star: false,
        })
    }

    /// Create from an `http::Uri`, stripping `prefix`.
    pub fn from_uri_and_prefix(uri: &http::uri::Uri, prefix: &str) -> Result<DavPath, DavError> {
        match uri.path() {
            "*" => Self::from_str_and_prefix("*", prefix),
            path if path.starts_with('/') => Self::from_str_and_prefix(path, prefix),
            _ => Err(DavError::InvalidPath),
        }
    }

    /// Is this the `*` of `OPTIONS * HTTP/1.1`?
    pub fn is_star(&self) -> bool {
        self.star
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// The prefix that was stripped from the request path.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The decoded path, without prefix.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Path segments, root has none.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Percent-encoded path, without prefix.
    pub fn as_url_string(&self) -> String {
        utf8_percent_encode(&self.path, PATH_ENCODE_SET).to_string()
    }

    /// Percent-encoded path, with prefix.
    pub fn as_url_string_with_prefix(&self) -> String {
        let p = format!("{}{}", self.prefix, self.path);
        utf8_percent_encode(&p, PATH_ENCODE_SET).to_string()
    }

    /// Like `as_url_string_with_prefix`, with a trailing slash for collections.
    pub fn as_href(&self, is_collection: bool) -> String {
        let mut s = self.as_url_string_with_prefix();
        if is_collection && !s.ends_with('/') {
            s.push('/');
        }
        s
    }

    /// Relative filesystem path (no leading slash).
    pub fn as_rel_ospath(&self) -> &Path {
        Path::new(self.path.trim_start_matches('/'))
    }

    /// Filesystem path below `base`.
    pub fn as_pathbuf_under(&self, base: &Path) -> PathBuf {
        base.join(self.as_rel_ospath())
    }

    /// The parent path. The parent of the root is the root.
    pub fn parent(&self) -> DavPath {
        let path = match self.path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => self.path[..idx].to_string(),
        };
        DavPath {
            path,
            prefix: self.prefix.clone(),
            star: false,
        }
    }

    /// Add a segment.
    pub fn join(&self, name: &str) -> DavPath {
        let name = name.trim_matches('/');
        let path = if self.path == "/" {
            format!("/{name}")
        } else if name.is_empty() {
            self.path.clone()
        } else {
            format!("{}/{}", self.path, name)
        };
        DavPath {
            path,
            prefix: self.prefix.clone(),
            star: false,
        }
    }

    /// Last segment of the path, empty for the root.
    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[idx + 1..],
            None => "",
        }
    }

    /// Is `self` equal to `other`, or below it?
    pub fn starts_with(&self, other: &DavPath) -> bool {
        other.path == "/"
            || self.path == other.path
            || (self.path.starts_with(&other.path)
                && self.path.as_bytes().get(other.path.len()) == Some(&b'/'))
    }

    /// Replace the leading `from` part of this path by `to`.
    pub fn rebase(&self, from: &DavPath, to: &DavPath) -> Option<DavPath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.path == "/" {
            &self.path[..]
        } else {
            &self.path[from.path.len()..]
        };
        let mut p = to.clone();
        for seg in rest.split('/').filter(|s| !s.is_empty()) {
            p = p.join(seg);
        }
        Some(p)
    }

    /// Get the mime type of this path, based on its extension.
    pub fn get_mime_type_str(&self) -> &'static str {
        let name = self.file_name();
        let d = name.rfind('.').map(|d| &name[d + 1..]).unwrap_or("");
        mime_guess::from_ext(d)
            .first_raw()
            .unwrap_or("application/octet-stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes() {
        let p = DavPath::from_str_and_prefix("/a//b/./c/", "").unwrap();
        assert_eq!(p.as_str(), "/a/b/c");
        let p = DavPath::from_str_and_prefix("/a/b/../c", "").unwrap();
        assert_eq!(p.as_str(), "/a/c");
        assert!(DavPath::from_str_and_prefix("/../etc", "").is_err());
        assert!(DavPath::from_str_and_prefix("relative", "").is_err());
    }

    #[test]
    fn strips_prefix() {
        let p = DavPath::from_str_and_prefix("/dav/bucket/my%20file.txt", "/dav").unwrap();
        assert_eq!(p.as_str(), "/bucket/my file.txt");
        assert_eq!(p.as_url_string(), "/bucket/my%20file.txt");
        assert_eq!(p.as_url_string_with_prefix(), "/dav/bucket/my%20file.txt");
        assert!(DavPath::from_str_and_prefix("/davx/bucket", "/dav").is_err());
        let p = DavPath::from_str_and_prefix("/dav", "/dav/").unwrap();
        assert!(p.is_root());
    }

    #[test]
    fn parent_of_child_round_trips() {
        for p in ["/", "/bucket", "/bucket/dir", "/bucket/dir/sub dir"] {
            let path = DavPath::new(p).unwrap();
            for name in ["x", "file.txt", "with space"] {
                assert_eq!(path.join(name).parent(), path);
                assert_eq!(path.join(name).file_name(), name);
            }
        }
        assert_eq!(DavPath::root().parent(), DavPath::root());
    }

    #[test]
    fn subtree_checks() {
        let a = DavPath::new("/b/dir").unwrap();
        assert!(DavPath::new("/b/dir/x").unwrap().starts_with(&a));
        assert!(a.starts_with(&a));
        assert!(!DavPath::new("/b/dirx").unwrap().starts_with(&a));
        let moved = DavPath::new("/b/dir/x/y")
            .unwrap()
            .rebase(&a, &DavPath::new("/c/new").unwrap())
            .unwrap();
        assert_eq!(moved.as_str(), "/c/new/x/y");
    }

    #[test]
    fn hrefs_and_mime() {
        let p = DavPath::new("/b/dir").unwrap();
        assert_eq!(p.as_href(true), "/b/dir/");
        assert_eq!(p.as_href(false), "/b/dir");
        assert_eq!(DavPath::root().as_href(true), "/");
        assert_eq!(DavPath::new("/b/x.txt").unwrap().get_mime_type_str(), "text/plain");
        assert!(DavPath::from_str_and_prefix("*", "").unwrap().is_star());
    }
}
