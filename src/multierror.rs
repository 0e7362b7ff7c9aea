use http::{Response, StatusCode};
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::util::MemBuffer;
use crate::DavResult;

/// Per-item failures of a recursive operation.
///
/// Recursive delete / copy / move keep going when one item fails. The
/// failures are gathered here and turned into a 207 Multi-Status reply.
#[derive(Debug, Default)]
pub(crate) struct MultiError {
    errors: Vec<(DavPath, StatusCode)>,
}

impl MultiError {
    pub fn new() -> MultiError {
        MultiError { errors: Vec::new() }
    }

    pub fn add(&mut self, path: DavPath, status: StatusCode) {
        self.errors.push((path, status));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DavPath, StatusCode)> {
        self.errors.iter()
    }

    /// Does any error concern `path`?
    pub fn contains(&self, path: &DavPath) -> bool {
        self.errors.iter().any(|(p, _)| p.as_str() == path.as_str())
    }

    /// Render a `207 Multi-Status` response listing every failed item.
    pub fn into_response(self) -> DavResult<Response<Body>> {
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
            xw.write(XmlWEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
            for (path, status) in &self.errors {
                let href = path.as_url_string_with_prefix();
                let status = format!("HTTP/1.1 {status}");
                xw.write(XmlWEvent::start_element("D:response"))?;
                xw.write(XmlWEvent::start_element("D:href"))?;
                xw.write(XmlWEvent::characters(&href))?;
                xw.write(XmlWEvent::end_element())?;
                xw.write(XmlWEvent::start_element("D:status"))?;
                xw.write(XmlWEvent::characters(&status))?;
                xw.write(XmlWEvent::end_element())?;
                xw.write(XmlWEvent::end_element())?;
            }
            xw.write(XmlWEvent::end_element())?;
        }
        let mut resp = Response::new(Body::from(buffer.take()));
        *resp.status_mut() = StatusCode::MULTI_STATUS;
        resp.headers_mut().insert(
            "content-type",
            http::HeaderValue::from_static("application/xml; charset=utf-8"),
        );
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn renders_multistatus() {
        let mut me = MultiError::new();
        me.add(DavPath::new("/b/a file").unwrap(), StatusCode::FORBIDDEN);
        assert_eq!(me.len(), 1);
        assert!(me.contains(&DavPath::new("/b/a file").unwrap()));
        let resp = me.into_response().unwrap();
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
        let mut body = resp.into_body();
        let bytes = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("<D:href>/b/a%20file</D:href>"));
        assert!(text.contains("HTTP/1.1 403 Forbidden"));
    }
}
