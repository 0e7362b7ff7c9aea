//! Response body, and the adapter that lets request bodies be read as
//! an `http_body::Body`.
//!
//! Responses are either a single buffer (XML documents, error text,
//! directory listings) or a stream of file chunks.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::stream::{BoxStream, Stream};
use http::header::HeaderMap;
use http_body::{Body as HttpBody, SizeHint};

use pin_project::pin_project;

type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

/// What `DavHandler::handle` returns. Implements both `Stream` and
/// `http_body::Body`.
pub struct Body(Payload);

enum Payload {
    // `None` once sent, or when there never was anything.
    Full(Option<Bytes>),
    Chunks(ChunkStream),
}

impl Body {
    /// Return an empty body.
    pub fn empty() -> Body {
        Body(Payload::Full(None))
    }

    /// Create a body from a stream of chunks.
    pub fn stream(stream: impl Stream<Item = io::Result<Bytes>> + Send + 'static) -> Body {
        Body(Payload::Chunks(Box::pin(stream)))
    }

    fn full(data: Bytes) -> Body {
        if data.is_empty() {
            Body::empty()
        } else {
            Body(Payload::Full(Some(data)))
        }
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().0 {
            Payload::Full(data) => Poll::Ready(data.take().map(Ok)),
            Payload::Chunks(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.0, Payload::Full(None))
    }

    fn size_hint(&self) -> SizeHint {
        match &self.0 {
            Payload::Full(data) => {
                SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            Payload::Chunks(_) => SizeHint::default(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Body {
        Body::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Body {
        Body::full(Bytes::from(data))
    }
}

impl From<String> for Body {
    fn from(data: String) -> Body {
        Body::full(Bytes::from(data))
    }
}

impl From<&str> for Body {
    fn from(data: &str) -> Body {
        Body::full(Bytes::copy_from_slice(data.as_bytes()))
    }
}

/// Wraps the request body stream that `handle_stream` accepts, so the
/// method handlers only ever see an `http_body::Body`.
#[pin_project]
pub(crate) struct StreamBody<S> {
    #[pin]
    chunks: S,
}

impl<S> StreamBody<S> {
    pub(crate) fn new(chunks: S) -> StreamBody<S> {
        StreamBody { chunks }
    }
}

impl<S, D, E> HttpBody for StreamBody<S>
where
    D: Buf + Send,
    E: StdError + Send + Sync + 'static,
    S: Stream<Item = Result<D, E>>,
{
    type Data = D;
    type Error = E;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.project().chunks.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn full_body_yields_once() {
        let mut body = Body::from("hello");
        assert_eq!(HttpBody::size_hint(&body).exact(), Some(5));
        assert!(!body.is_end_stream());
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from("hello"));
        assert!(body.next().await.is_none());
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn empty_and_streamed() {
        let body = Body::from(String::new());
        assert!(body.is_end_stream());
        assert_eq!(HttpBody::size_hint(&body).exact(), Some(0));

        let chunks = futures_util::stream::iter(vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))]);
        let body = Body::stream(chunks);
        assert_eq!(HttpBody::size_hint(&body).exact(), None);
        let all: Vec<_> = body.map(|c| c.unwrap()).collect().await;
        assert_eq!(all, vec![Bytes::from("a"), Bytes::from("b")]);
    }
}
