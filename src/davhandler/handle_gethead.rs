use std::io;
use std::time::SystemTime;

use async_stream::stream;
use headers::HeaderMapExt;
use htmlescape::encode_minimal;
use http::{HeaderValue, Request, Response};
use percent_encoding::utf8_percent_encode;

use crate::acl::DavAcl;
use crate::body::Body;
use crate::conditional;
use crate::davheaders;
use crate::davpath::{DavPath, PATH_ENCODE_SET};
use crate::errors::DavError;
use crate::resource::{DavResource, OpenMode};
use crate::util::{systemtime_to_httpdate, url_join, DavMethod};
use crate::DavResult;

use super::{header_value, DavServer, Sendfile};

/// Default size of the chunks a leaf is streamed in.
pub(crate) const READ_BUF_SIZE: usize = 65536;

impl DavServer {
    pub(crate) async fn handle_get(
        &self,
        req: &Request<()>,
        path: &DavPath,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let head = method == DavMethod::Head;
        let node = self.resolve(path).await?;
        if !node.exists() {
            return Err(DavError::NotFound);
        }

        if node.is_collection() {
            if !self.cfg.autoindex {
                return Err(DavError::NotAllowed);
            }
            self.require(path, DavAcl::LIST)?;
            conditional::evaluate(method, req.headers(), node.meta())?;
            return self.handle_autoindex(node.as_ref(), head).await;
        }

        self.require(path, DavAcl::READ)?;
        conditional::evaluate(method, req.headers(), node.meta())?;

        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();
        h.insert("content-type", HeaderValue::from_static(path.get_mime_type_str()));
        if let Some(modified) = node.modified() {
            h.typed_insert(headers::LastModified::from(modified));
        }
        if let Some(etag) = node.etag() {
            h.insert("etag", header_value(&format!("\"{etag}\""))?);
        }
        h.typed_insert(headers::Date::from(SystemTime::now()));
        h.typed_insert(headers::ContentLength(node.size()));
        if head {
            return Ok(res);
        }

        if self.cfg.sendfile != Sendfile::None {
            // the proxy fills in the body.
            if let Some(abs) = node.local_path().await? {
                let abs = abs.to_string_lossy();
                match &self.cfg.sendfile {
                    Sendfile::XSendfile { escape } => {
                        let v = if *escape {
                            utf8_percent_encode(&abs, PATH_ENCODE_SET).to_string()
                        } else {
                            abs.to_string()
                        };
                        debug!("GET {path}: x-sendfile {v}");
                        h.typed_insert(davheaders::XSendfile(v));
                    }
                    Sendfile::XAccelRedirect { prefix } => {
                        let v = url_join(prefix, &[&abs]);
                        debug!("GET {path}: x-accel-redirect {v}");
                        h.typed_insert(davheaders::XAccelRedirect(v));
                        h.insert("x-accel-charset", HeaderValue::from_static("utf-8"));
                    }
                    Sendfile::None => {}
                }
                return Ok(res);
            }
        }

        let mut file = node.open(OpenMode::ReadThroughCache).await?;
        let bufsize = self.cfg.read_buf_size;
        *res.body_mut() = Body::stream(stream! {
            loop {
                match file.read_bytes(bufsize).await {
                    Ok(buf) if buf.is_empty() => break,
                    Ok(buf) => yield Ok(buf),
                    Err(e) => {
                        error!("read failed: {e}");
                        yield Err(io::Error::new(io::ErrorKind::Other, e));
                        break;
                    }
                }
            }
        });
        Ok(res)
    }

    // HTML listing of a collection.
    async fn handle_autoindex(
        &self,
        node: &dyn DavResource,
        head: bool,
    ) -> DavResult<Response<Body>> {
        let mut children = node.children().await?;
        children.retain(|c| !self.is_appledouble(c.path()));
        children.sort_by(|a, b| {
            b.is_collection()
                .cmp(&a.is_collection())
                .then_with(|| a.name().cmp(b.name()))
        });

        let path = node.path();
        let title = encode_minimal(&path.as_href(true));
        let mut w = String::new();
        w.push_str("<!DOCTYPE html>\n<html><head>\n");
        w.push_str("<meta charset=\"utf-8\">\n");
        w.push_str(&format!("<title>Index of {title}</title>\n"));
        w.push_str("</head><body>\n");
        w.push_str(&format!("<h1>Index of {title}</h1>\n"));
        w.push_str("<table>\n");
        w.push_str("<tr><th>Name</th><th>Last modified</th><th>Size</th></tr>\n");
        if !path.is_root() {
            let up = path.parent().as_href(true);
            w.push_str(&format!(
                "<tr><td><a href=\"{}\">Parent Directory</a></td><td></td><td></td></tr>\n",
                encode_minimal(&up)
            ));
        }
        for child in &children {
            let href = child.path().as_href(child.is_collection());
            let mut name = child.name().to_string();
            let size = if child.is_collection() {
                name.push('/');
                "-".to_string()
            } else {
                child.size().to_string()
            };
            let modified = child
                .modified()
                .map(systemtime_to_httpdate)
                .unwrap_or_default();
            w.push_str(&format!(
                "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>\n",
                encode_minimal(&href),
                encode_minimal(&name),
                modified,
                size
            ));
        }
        w.push_str("</table>\n</body></html>\n");

        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();
        h.insert(
            "content-type",
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        h.typed_insert(headers::ContentLength(w.len() as u64));
        h.typed_insert(headers::Date::from(SystemTime::now()));
        if !head {
            *res.body_mut() = Body::from(w);
        }
        Ok(res)
    }
}
