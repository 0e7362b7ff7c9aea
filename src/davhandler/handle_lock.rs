use std::io::Write;
use std::time::SystemTime;

use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xml::EmitterConfig;
use xmltree::Element;

use crate::acl::DavAcl;
use crate::body::Body;
use crate::conditional;
use crate::davheaders::{self, LockToken, Timeout};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::ls::{DavLock, MAX_TIMEOUT};
use crate::props::{child_elements, is_dav, parse_xml, write_children, write_text_element};
use crate::resource::OpenMode;
use crate::util::{DavMethod, MemBuffer};
use crate::DavResult;

use super::DavServer;

/// The interesting parts of a `<D:lockinfo>` body.
#[derive(Debug)]
pub(crate) struct LockInfo {
    pub shared: bool,
    pub owner: Option<Element>,
}

impl LockInfo {
    pub(crate) fn parse(body: &[u8]) -> DavResult<LockInfo> {
        let root = parse_xml(body, "lockinfo")?;
        let mut shared = None;
        let mut write = false;
        let mut owner = None;
        for e in child_elements(&root) {
            if is_dav(e, "lockscope") {
                for s in child_elements(e) {
                    if is_dav(s, "exclusive") {
                        shared = Some(false);
                    } else if is_dav(s, "shared") {
                        shared = Some(true);
                    }
                }
            } else if is_dav(e, "locktype") {
                write = child_elements(e).any(|t| is_dav(t, "write"));
            } else if is_dav(e, "owner") {
                owner = Some(e.clone());
            }
        }
        if !write {
            return Err(DavError::BadRequest(Some("lock: only write locks".to_string())));
        }
        match shared {
            Some(shared) => Ok(LockInfo { shared, owner }),
            None => Err(DavError::BadRequest(Some("lock: missing lockscope".to_string()))),
        }
    }
}

impl DavServer {
    pub(crate) async fn handle_lock(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let deep = match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(None) | Ok(Some(davheaders::Depth::Infinity)) => true,
            Ok(Some(davheaders::Depth::Zero)) => false,
            _ => return Err(DavError::BadRequest(Some("invalid Depth".into()))),
        };
        let timeout = req
            .headers()
            .typed_get::<Timeout>()
            .map(|t| t.duration(MAX_TIMEOUT));
        self.require(path, DavAcl::WRITE)?;

        let node = self.resolve(path).await?;
        conditional::evaluate(DavMethod::Lock, req.headers(), node.meta())?;

        // no body: refresh the lock named in the If: header.
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            let tokens = conditional::if_state_tokens(req.headers())?;
            let token = match tokens.first() {
                Some(t) => t,
                None => return Err(DavError::BadRequest(Some("lock refresh: no token".into()))),
            };
            let lock = match self.cfg.ls.refresh(path, token, timeout) {
                Ok(lock) => lock,
                Err(()) => {
                    debug!("LOCK {path}: refresh of {token} failed");
                    return Err(DavError::PreconditionFailed(None));
                }
            };
            return lock_response(&lock, StatusCode::OK);
        }

        let info = LockInfo::parse(body)?;
        let principal = self.principal.as_deref();
        let lock = match self.cfg.ls.lock(
            path,
            principal,
            info.owner.as_ref(),
            timeout,
            info.shared,
            deep,
        ) {
            Ok(lock) => lock,
            Err(conflict) => {
                debug!("LOCK {path}: conflicts with {}", conflict.token);
                return Err(DavError::Status(StatusCode::LOCKED));
            }
        };

        // locking an unmapped url creates an empty resource.
        let mut status = StatusCode::OK;
        if !node.exists() {
            let created = async {
                if !self.has_parent(path).await? {
                    return Err(DavError::Conflict(None));
                }
                let mut file = node.open(OpenMode::Write).await?;
                file.flush().await?;
                Ok::<(), DavError>(())
            }
            .await;
            if let Err(e) = created {
                let _ = self.cfg.ls.unlock(path, &lock.token);
                return Err(e);
            }
            status = StatusCode::CREATED;
        }

        let mut res = lock_response(&lock, status)?;
        res.headers_mut()
            .typed_insert(LockToken(lock.token.clone()));
        Ok(res)
    }

    pub(crate) async fn handle_unlock(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let token = match req.headers().typed_try_get::<LockToken>() {
            Ok(Some(LockToken(t))) => t,
            _ => return Err(DavError::BadRequest(Some("missing Lock-Token".into()))),
        };
        match self.cfg.ls.unlock(path, &token) {
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::NO_CONTENT;
                res.headers_mut()
                    .typed_insert(headers::Date::from(SystemTime::now()));
                Ok(res)
            }
            Err(()) => {
                debug!("UNLOCK {path}: {token} not held");
                Err(DavError::Conflict(None))
            }
        }
    }
}

fn lock_response(lock: &DavLock, status: StatusCode) -> DavResult<Response<Body>> {
    let mut buffer = MemBuffer::new();
    {
        let mut xw = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(&mut buffer);
        xw.write(XmlWEvent::StartDocument {
            version: xml::common::XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: None,
        })?;
        xw.write(XmlWEvent::start_element("D:prop").ns("D", "DAV:"))?;
        xw.write(XmlWEvent::start_element("D:lockdiscovery"))?;
        write_activelock(&mut xw, lock)?;
        xw.write(XmlWEvent::end_element())?;
        xw.write(XmlWEvent::end_element())?;
    }
    let mut res = Response::new(Body::from(buffer.take()));
    *res.status_mut() = status;
    res.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    Ok(res)
}

fn write_empty<W: Write>(xw: &mut EventWriter<W>, parent: &str, child: &str) -> DavResult<()> {
    xw.write(XmlWEvent::start_element(parent))?;
    xw.write(XmlWEvent::start_element(child))?;
    xw.write(XmlWEvent::end_element())?;
    xw.write(XmlWEvent::end_element())?;
    Ok(())
}

fn write_activelock<W: Write>(xw: &mut EventWriter<W>, lock: &DavLock) -> DavResult<()> {
    xw.write(XmlWEvent::start_element("D:activelock"))?;
    write_empty(xw, "D:locktype", "D:write")?;
    let scope = if lock.shared { "D:shared" } else { "D:exclusive" };
    write_empty(xw, "D:lockscope", scope)?;
    write_text_element(xw, "D:depth", if lock.deep { "infinity" } else { "0" })?;
    if let Some(owner) = &lock.owner {
        xw.write(XmlWEvent::start_element("D:owner"))?;
        write_children(xw, owner, None)?;
        xw.write(XmlWEvent::end_element())?;
    }
    let timeout = match lock.timeout {
        Some(d) => format!("Second-{}", d.as_secs()),
        None => "Infinite".to_string(),
    };
    write_text_element(xw, "D:timeout", &timeout)?;
    xw.write(XmlWEvent::start_element("D:locktoken"))?;
    write_text_element(xw, "D:href", &lock.token)?;
    xw.write(XmlWEvent::end_element())?;
    xw.write(XmlWEvent::start_element("D:lockroot"))?;
    write_text_element(xw, "D:href", &lock.path.as_url_string_with_prefix())?;
    xw.write(XmlWEvent::end_element())?;
    xw.write(XmlWEvent::end_element())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lockinfo() {
        let body = br#"<?xml version="1.0"?>
            <D:lockinfo xmlns:D="DAV:">
              <D:lockscope><D:shared/></D:lockscope>
              <D:locktype><D:write/></D:locktype>
              <D:owner><D:href>mailto:someone@example.org</D:href></D:owner>
            </D:lockinfo>"#;
        let info = LockInfo::parse(body).unwrap();
        assert!(info.shared);
        assert_eq!(info.owner.unwrap().name, "owner");

        let no_scope = br#"<D:lockinfo xmlns:D="DAV:"><D:locktype><D:write/></D:locktype></D:lockinfo>"#;
        assert!(LockInfo::parse(no_scope).is_err());
        assert!(LockInfo::parse(b"<D:propfind xmlns:D=\"DAV:\"/>").is_err());
    }

    #[tokio::test]
    async fn activelock_xml() {
        use futures_util::StreamExt;

        let lock = DavLock {
            token: "urn:uuid:42".to_string(),
            path: DavPath::new("/b/file").unwrap(),
            principal: None,
            owner: None,
            timeout_at: None,
            timeout: Some(std::time::Duration::from_secs(60)),
            shared: false,
            deep: true,
        };
        let res = lock_response(&lock, StatusCode::OK).unwrap();
        let bytes = res.into_body().next().await.unwrap().unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("<D:exclusive />") || text.contains("<D:exclusive/>"));
        assert!(text.contains("<D:timeout>Second-60</D:timeout>"));
        assert!(text.contains("<D:href>urn:uuid:42</D:href>"));
        assert!(text.contains("<D:depth>infinity</D:depth>"));
    }
}
