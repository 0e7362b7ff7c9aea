use std::time::SystemTime;

use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response};

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::util::DavMethod;
use crate::DavResult;

use super::{header_value, DavServer};

// What can be done to a path that does not exist yet.
const ALLOW_UNMAPPED: &[(DavMethod, &str)] = &[
    (DavMethod::Options, "OPTIONS"),
    (DavMethod::Put, "PUT"),
    (DavMethod::MkCol, "MKCOL"),
];

const ALLOW_COLLECTION: &[(DavMethod, &str)] = &[
    (DavMethod::Options, "OPTIONS"),
    (DavMethod::Head, "HEAD"),
    (DavMethod::Get, "GET"),
    (DavMethod::Delete, "DELETE"),
    (DavMethod::PropFind, "PROPFIND"),
    (DavMethod::PropPatch, "PROPPATCH"),
    (DavMethod::Copy, "COPY"),
    (DavMethod::Move, "MOVE"),
    (DavMethod::Lock, "LOCK"),
    (DavMethod::Unlock, "UNLOCK"),
];

const ALLOW_LEAF: &[(DavMethod, &str)] = &[
    (DavMethod::Options, "OPTIONS"),
    (DavMethod::Head, "HEAD"),
    (DavMethod::Get, "GET"),
    (DavMethod::Put, "PUT"),
    (DavMethod::Delete, "DELETE"),
    (DavMethod::PropFind, "PROPFIND"),
    (DavMethod::PropPatch, "PROPPATCH"),
    (DavMethod::Copy, "COPY"),
    (DavMethod::Move, "MOVE"),
    (DavMethod::Lock, "LOCK"),
    (DavMethod::Unlock, "UNLOCK"),
];

impl DavServer {
    pub(crate) async fn handle_options(
        &self,
        _req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        let h = res.headers_mut();
        // Level 2 is advertised even with the fake locksystem, some
        // clients refuse to write without it.
        h.insert("DAV", HeaderValue::from_static("1,2"));
        h.insert("MS-Author-Via", HeaderValue::from_static("DAV"));
        h.typed_insert(headers::Date::from(SystemTime::now()));
        h.typed_insert(headers::ContentLength(0));

        if path.is_root() || path.is_star() {
            return Ok(res);
        }
        if self.is_appledouble(path) {
            return Err(DavError::NotFound);
        }

        let node = self.resolve(path).await?;
        let list = if !node.exists() {
            if !self.has_parent(path).await? {
                return Err(DavError::NotFound);
            }
            ALLOW_UNMAPPED
        } else if node.is_collection() {
            ALLOW_COLLECTION
        } else {
            res.headers_mut()
                .insert("Allow-Ranges", HeaderValue::from_static("bytes"));
            ALLOW_LEAF
        };

        let allow = list
            .iter()
            .filter(|(m, _)| self.cfg.allow.allows(*m))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(", ");
        res.headers_mut().insert("Allow", header_value(&allow)?);

        Ok(res)
    }
}
