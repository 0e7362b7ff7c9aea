use std::time::SystemTime;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::acl::DavAcl;
use crate::body::Body;
use crate::conditional;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::multierror::MultiError;
use crate::resource::delete_tree;
use crate::util::DavMethod;
use crate::DavResult;

use super::DavServer;

impl DavServer {
    pub(crate) async fn handle_delete(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let node = self.resolve(path).await?;
        if !node.exists() {
            return Err(DavError::NotFound);
        }
        if path.is_root() {
            return Err(DavError::Forbidden(None));
        }
        self.require(path, DavAcl::DELETE)?;
        conditional::evaluate(DavMethod::Delete, req.headers(), node.meta())?;
        self.check_locks(req, path, true)?;

        // locks and properties go first, whatever happens to the data.
        let _ = self.cfg.ls.delete(path);
        self.cfg.props.delete_tree(path);

        let mut errors = MultiError::new();
        if !delete_tree(node.as_ref(), &mut errors).await {
            // a single failure on the target itself is a plain error.
            if errors.len() == 1 {
                if let Some((p, status)) = errors.iter().next() {
                    if p.as_str() == path.as_str() {
                        return Err(DavError::Status(*status));
                    }
                }
            }
            return errors.into_response();
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NO_CONTENT;
        res.headers_mut()
            .typed_insert(headers::Date::from(SystemTime::now()));
        Ok(res)
    }
}
