use std::io::Write;
use std::time::SystemTime;

use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xml::EmitterConfig;

use crate::acl::DavAcl;
use crate::body::Body;
use crate::conditional;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::props::{parse_propertyupdate, write_propstat, write_text_element, PropRequest, PropValue};
use crate::resource::{descendants, Depth};
use crate::util::{DavMethod, MemBuffer};
use crate::DavResult;

use super::DavServer;

fn start_multistatus<W: Write>(xw: &mut EventWriter<W>) -> DavResult<()> {
    xw.write(XmlWEvent::StartDocument {
        version: xml::common::XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    xw.write(XmlWEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
    Ok(())
}

fn multistatus_response(body: bytes::Bytes) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = StatusCode::MULTI_STATUS;
    let h = res.headers_mut();
    h.insert(
        "content-type",
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    h.typed_insert(headers::Date::from(SystemTime::now()));
    res
}

impl DavServer {
    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        if self.is_appledouble(path) {
            return Err(DavError::NotFound);
        }
        let node = self.resolve(path).await?;
        if !node.exists() {
            return Err(DavError::NotFound);
        }
        self.require(path, DavAcl::LIST)?;

        let depth = match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(None) | Ok(Some(davheaders::Depth::Infinity)) => Depth::Infinity,
            Ok(Some(davheaders::Depth::One)) => Depth::Finite(1),
            Ok(Some(davheaders::Depth::Zero)) => Depth::Finite(0),
            Err(_) => return Err(DavError::BadRequest(Some("invalid Depth".into()))),
        };
        let request = PropRequest::parse(body)?;
        debug!("PROPFIND {path}: {request:?} depth {depth:?}");

        let mut buffer = MemBuffer::new();
        {
            let mut xw = EmitterConfig::new()
                .perform_indent(true)
                .create_writer(&mut buffer);
            start_multistatus(&mut xw)?;

            let mut walk = descendants(node, depth);
            while let Some(item) = walk.next().await {
                match item {
                    Ok(res) => {
                        if self.is_appledouble(res.path()) {
                            continue;
                        }
                        self.cfg.props.write_response(&mut xw, res.as_ref(), &request)?;
                    }
                    Err(e) => warn!("PROPFIND {path}: {e}"),
                }
            }
            xw.write(XmlWEvent::end_element())?;
        }
        Ok(multistatus_response(buffer.take()))
    }

    pub(crate) async fn handle_proppatch(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let node = self.resolve(path).await?;
        if !node.exists() {
            return Err(DavError::NotFound);
        }
        match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(None) | Ok(Some(davheaders::Depth::Zero)) => {}
            _ => return Err(DavError::BadRequest(Some("invalid Depth".into()))),
        }
        self.require(path, DavAcl::WRITE)?;
        conditional::evaluate(DavMethod::PropPatch, req.headers(), node.meta())?;
        self.check_locks(req, path, false)?;

        let ops = parse_propertyupdate(body)?;
        let results = self.cfg.props.patch(path, &ops);

        // one propstat per distinct status, in order of appearance.
        let mut groups: Vec<(StatusCode, Vec<(String, Option<PropValue>)>)> = Vec::new();
        for (name, status) in results {
            match groups.iter_mut().find(|(s, _)| *s == status) {
                Some((_, names)) => names.push((name, None)),
                None => groups.push((status, vec![(name, None)])),
            }
        }

        let mut buffer = MemBuffer::new();
        {
            let mut xw = EmitterConfig::new()
                .perform_indent(true)
                .create_writer(&mut buffer);
            start_multistatus(&mut xw)?;
            xw.write(XmlWEvent::start_element("D:response"))?;
            write_text_element(&mut xw, "D:href", &path.as_href(node.is_collection()))?;
            for (status, names) in &groups {
                write_propstat(&mut xw, *status, names)?;
            }
            xw.write(XmlWEvent::end_element())?;
            xw.write(XmlWEvent::end_element())?;
        }
        Ok(multistatus_response(buffer.take()))
    }
}
