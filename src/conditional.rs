//! Conditional request evaluation.
//!
//! Checked in this order against the current ETag and modification time:
//! If-Match, If-Modified-Since, If-None-Match, If-Unmodified-Since. A
//! resource that does not exist passes every condition.
//!
//! Dates are compared at one second granularity, the resolution of an
//! HTTP date.
use headers::{HeaderMapExt, IfModifiedSince, IfUnmodifiedSince};
use http::HeaderMap;

use crate::davheaders::{If, IfMatch, IfNoneMatch};
use crate::errors::DavError;
use crate::resource::ResourceMeta;
use crate::util::DavMethod;
use crate::DavResult;

/// Evaluate the conditional headers of a request.
///
/// Fails with `PreconditionFailed` or, for GET and HEAD, `NotModified`.
pub(crate) fn evaluate(
    method: DavMethod,
    headers: &HeaderMap,
    meta: Option<&ResourceMeta>,
) -> DavResult<()> {
    let meta = match meta {
        Some(m) => m,
        None => return Ok(()),
    };
    let is_get = matches!(method, DavMethod::Get | DavMethod::Head);

    if let Some(IfMatch(list)) = headers.typed_get::<IfMatch>() {
        if !list.matches(&meta.etag) {
            trace!("if-match {:?} fails for {}", list, meta.etag);
            return Err(DavError::PreconditionFailed(None));
        }
    }

    let mut not_modified = false;
    if is_get {
        if let Some(ims) = headers.typed_get::<IfModifiedSince>() {
            not_modified = !ims.is_modified(meta.modified);
        }
    }

    if let Some(IfNoneMatch(list)) = headers.typed_get::<IfNoneMatch>() {
        // If-None-Match takes precedence over If-Modified-Since.
        not_modified = false;
        if list.matches(&meta.etag) {
            return Err(if is_get {
                DavError::NotModified
            } else {
                DavError::PreconditionFailed(None)
            });
        }
    }

    if let Some(ius) = headers.typed_get::<IfUnmodifiedSince>() {
        if !ius.precondition_passes(meta.modified) {
            return Err(DavError::PreconditionFailed(None));
        }
    }

    if not_modified {
        return Err(DavError::NotModified);
    }
    Ok(())
}

/// Lock tokens submitted in the `If:` header.
pub(crate) fn if_state_tokens(headers: &HeaderMap) -> DavResult<Vec<String>> {
    match headers.typed_try_get::<If>() {
        Ok(Some(h)) => Ok(h.state_tokens()),
        Ok(None) => Ok(Vec::new()),
        Err(_) => Err(DavError::BadRequest(Some("malformed If: header".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    use http::StatusCode;

    use crate::util::systemtime_to_httpdate;

    fn meta() -> ResourceMeta {
        let t = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        ResourceMeta {
            is_collection: false,
            size: 3,
            created: t,
            modified: t,
            etag: "abc".to_string(),
        }
    }

    fn headers(list: &[(&'static str, String)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in list {
            h.insert(*k, v.parse().unwrap());
        }
        h
    }

    fn status(method: DavMethod, h: &HeaderMap) -> Option<StatusCode> {
        evaluate(method, h, Some(&meta())).err().map(|e| e.statuscode())
    }

    #[test]
    fn if_match() {
        let h = headers(&[("if-match", "\"abc\"".into())]);
        assert_eq!(status(DavMethod::Put, &h), None);
        let h = headers(&[("if-match", "\"other\"".into())]);
        assert_eq!(status(DavMethod::Put, &h), Some(StatusCode::PRECONDITION_FAILED));
        let h = headers(&[("if-match", "*".into())]);
        assert_eq!(status(DavMethod::Delete, &h), None);
    }

    #[test]
    fn if_none_match() {
        let h = headers(&[("if-none-match", "\"abc\"".into())]);
        assert_eq!(status(DavMethod::Get, &h), Some(StatusCode::NOT_MODIFIED));
        assert_eq!(status(DavMethod::Put, &h), Some(StatusCode::PRECONDITION_FAILED));
        let h = headers(&[("if-none-match", "\"xyz\"".into())]);
        assert_eq!(status(DavMethod::Get, &h), None);
    }

    #[test]
    fn dates() {
        let m = meta().modified;
        let same = systemtime_to_httpdate(m);
        let earlier = systemtime_to_httpdate(m - Duration::from_secs(60));

        let h = headers(&[("if-modified-since", same.clone())]);
        assert_eq!(status(DavMethod::Get, &h), Some(StatusCode::NOT_MODIFIED));
        assert_eq!(status(DavMethod::Put, &h), None);
        let h = headers(&[("if-modified-since", earlier.clone())]);
        assert_eq!(status(DavMethod::Get, &h), None);

        // a non-matching If-None-Match overrides If-Modified-Since.
        let h = headers(&[
            ("if-modified-since", same.clone()),
            ("if-none-match", "\"xyz\"".into()),
        ]);
        assert_eq!(status(DavMethod::Get, &h), None);

        let h = headers(&[("if-unmodified-since", earlier)]);
        assert_eq!(status(DavMethod::Put, &h), Some(StatusCode::PRECONDITION_FAILED));
        let h = headers(&[("if-unmodified-since", same)]);
        assert_eq!(status(DavMethod::Put, &h), None);
    }

    #[test]
    fn dates_at_second_granularity() {
        let mut m = meta();
        m.modified += Duration::from_millis(500);
        let status = |method, h: &HeaderMap| {
            evaluate(method, h, Some(&m)).err().map(|e| e.statuscode())
        };
        // what a client read from Last-Modified.
        let echoed = systemtime_to_httpdate(m.modified);
        let before = systemtime_to_httpdate(m.modified - Duration::from_secs(1));

        let h = headers(&[("if-unmodified-since", echoed.clone())]);
        assert_eq!(status(DavMethod::Put, &h), None);
        assert_eq!(status(DavMethod::Delete, &h), None);
        let h = headers(&[("if-unmodified-since", before.clone())]);
        assert_eq!(status(DavMethod::Delete, &h), Some(StatusCode::PRECONDITION_FAILED));

        // not a GET: If-Modified-Since has no say.
        for date in [echoed.clone(), before] {
            let h = headers(&[("if-modified-since", date)]);
            assert_eq!(status(DavMethod::Put, &h), None);
            assert_eq!(status(DavMethod::Move, &h), None);
        }
        let h = headers(&[("if-modified-since", echoed)]);
        assert_eq!(status(DavMethod::Head, &h), Some(StatusCode::NOT_MODIFIED));
    }

    #[test]
    fn missing_resource_passes() {
        let h = headers(&[("if-match", "\"abc\"".into())]);
        assert!(evaluate(DavMethod::Put, &h, None).is_ok());
    }

    #[test]
    fn state_tokens() {
        let h = headers(&[("if", "(<urn:uuid:1>) (Not <urn:uuid:2>)".into())]);
        assert_eq!(if_state_tokens(&h).unwrap(), vec!["urn:uuid:1".to_string()]);
        let h = headers(&[("if", "(<urn:uuid:1>".into())]);
        assert!(if_state_tokens(&h).is_err());
        assert!(if_state_tokens(&HeaderMap::new()).unwrap().is_empty());
    }
}
