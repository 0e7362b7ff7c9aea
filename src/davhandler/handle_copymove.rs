use headers::HeaderMapExt;
use http::{Request, Response, StatusCode, Uri};

use crate::acl::DavAcl;
use crate::body::Body;
use crate::conditional;
use crate::davheaders::{self, Destination, Overwrite};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::multierror::MultiError;
use crate::resource::{copy_tree, delete_tree, move_tree, Depth};
use crate::util::DavMethod;
use crate::{DavResult, FileSystem};

use super::DavServer;

// The destination must be on this server: same host[:port], and the same
// scheme if we know ours.
fn same_origin(req: &Request<()>, dest: &Uri) -> bool {
    let dest_host = match dest.authority() {
        Some(a) => a.as_str(),
        None => return true,
    };
    if let (Some(ours), Some(theirs)) = (req.uri().scheme_str(), dest.scheme_str()) {
        if !ours.eq_ignore_ascii_case(theirs) {
            return false;
        }
    }
    let our_host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()));
    match our_host {
        Some(h) => h.eq_ignore_ascii_case(dest_host),
        None => true,
    }
}

impl DavServer {
    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        path: &DavPath,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let is_move = method == DavMethod::Move;
        let node = self.resolve(path).await?;
        if !node.exists() {
            return Err(DavError::NotFound);
        }
        self.require(path, DavAcl::RELOCATE)?;

        let dest = match req.headers().typed_try_get::<Destination>() {
            Ok(Some(Destination(d))) => d,
            Ok(None) => return Err(DavError::BadRequest(Some("missing Destination".into()))),
            Err(_) => return Err(DavError::BadRequest(Some("invalid Destination".into()))),
        };
        let dest_uri: Uri = dest
            .parse()
            .map_err(|_| DavError::BadRequest(Some("invalid Destination".into())))?;
        if !same_origin(req, &dest_uri) {
            debug!("{method:?} {path}: destination {dest} is on another server");
            return Err(DavError::BadGateway(None));
        }
        let dst = DavPath::from_uri_and_prefix(&dest_uri, &self.cfg.prefix)?;

        if !self.has_parent(&dst).await? {
            return Err(DavError::Conflict(None));
        }

        let overwrite = match req.headers().typed_try_get::<Overwrite>() {
            Ok(Some(Overwrite(o))) => o,
            Ok(None) => true,
            Err(_) => return Err(DavError::BadRequest(Some("invalid Overwrite".into()))),
        };
        let dnode = self.resolve(&dst).await?;
        let existed = dnode.exists();
        if existed && !overwrite {
            return Err(DavError::PreconditionFailed(None));
        }

        let depth = match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(None) | Ok(Some(davheaders::Depth::Infinity)) => Depth::Infinity,
            Ok(Some(davheaders::Depth::Zero)) if !is_move => Depth::Finite(0),
            _ => return Err(DavError::BadRequest(Some("invalid Depth".into()))),
        };

        // into itself, its own subtree, or over one of its ancestors.
        if dst.starts_with(path) || path.starts_with(&dst) {
            debug!("{method:?} {path} -> {dst}: overlapping source and destination");
            return Err(DavError::Forbidden(None));
        }
        // the top level of an object store holds buckets only.
        if !node.is_collection()
            && dst.parent().is_root()
            && matches!(self.cfg.fs, FileSystem::ObjectStore { .. })
        {
            debug!("{method:?} {path} -> {dst}: a file cannot become a bucket");
            return Err(DavError::Forbidden(None));
        }
        self.require(&dst, DavAcl::CREATE)?;
        conditional::evaluate(method, req.headers(), node.meta())?;
        self.check_locks(req, &dst, true)?;
        if is_move {
            self.check_locks(req, path, true)?;
        }

        let mut errors = MultiError::new();
        if existed {
            let _ = self.cfg.ls.delete(&dst);
            self.cfg.props.delete_tree(&dst);
            if !delete_tree(dnode.as_ref(), &mut errors).await {
                return errors.into_response();
            }
        }
        drop(dnode);

        let backend = self.backend.as_ref();
        let ok = if is_move {
            move_tree(backend, node.as_ref(), dst.clone(), &mut errors).await
        } else {
            copy_tree(backend, node.as_ref(), dst.clone(), depth, &mut errors).await
        };
        self.cfg.props.copy_tree_properties(path, &dst, is_move && ok);
        if is_move && ok {
            let _ = self.cfg.ls.delete(path);
        }
        debug!("{method:?} {path} -> {dst}: {} failures", errors.len());

        if !errors.is_empty() {
            return errors.into_response();
        }
        let mut res = Response::new(Body::empty());
        *res.status_mut() = if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        res.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(res)
    }
}
