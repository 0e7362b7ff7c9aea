use std::error::Error as StdError;
use std::io;

use bytes::Buf;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::acl::DavAcl;
use crate::body::Body;
use crate::conditional;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::resource::OpenMode;
use crate::util::DavMethod;
use crate::DavResult;

use super::{header_value, DavServer};

impl DavServer {
    pub(crate) async fn handle_put<ReqBody, ReqData, ReqError>(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: ReqBody,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let node = self.resolve(path).await?;
        if node.is_collection() {
            return Err(DavError::NotAllowed);
        }
        if !self.has_parent(path).await? {
            return Err(DavError::NotFound);
        }
        self.require(path, DavAcl::WRITE)?;
        conditional::evaluate(DavMethod::Put, req.headers(), node.meta())?;
        self.check_locks(req, path, false)?;

        let existed = node.exists();
        let mut file = node.open(OpenMode::Write).await?;

        pin_utils::pin_mut!(body);
        let mut total = 0u64;
        while let Some(data) = body.data().await {
            let mut buf = data.map_err(|e| {
                debug!("PUT {path}: reading body: {e}");
                DavError::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, "UnexpectedEof"))
            })?;
            while buf.has_remaining() {
                let chunk = buf.copy_to_bytes(buf.remaining());
                total += chunk.len() as u64;
                file.write_bytes(chunk).await?;
            }
        }
        file.flush().await?;
        drop(file);
        debug!("PUT {path}: {total} bytes");

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        let h = res.headers_mut();
        if let Some(etag) = self.resolve(path).await?.etag() {
            h.insert("etag", header_value(&format!("\"{etag}\""))?);
        }
        h.typed_insert(headers::ContentLength(0));
        Ok(res)
    }
}
