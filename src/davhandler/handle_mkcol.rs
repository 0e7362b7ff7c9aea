use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::acl::DavAcl;
use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::DavResult;

use super::DavServer;

impl DavServer {
    pub(crate) async fn handle_mkcol(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let node = self.resolve(path).await?;
        if node.exists() {
            return Err(DavError::NotAllowed);
        }
        if !self.has_parent(path).await? {
            return Err(DavError::Conflict(None));
        }
        if !body.is_empty() {
            return Err(DavError::UnsupportedMediaType);
        }
        self.require(path, DavAcl::CREATE)?;
        self.check_locks(req, &path.parent(), false)?;

        node.create_collection().await?;
        debug!("MKCOL {path}: created");

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::CREATED;
        res.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(res)
    }
}
