//! Request body drain and replay
//!
//! The audit pipeline needs the full request body, and so does the handler it
//! wraps. [`drain_body`] reads the body into one reference-counted buffer once;
//! [`DrainedBody::split`] then hands out independent streams over that buffer,
//! so dropping one never affects the other. Trailers received after the body
//! are replayed too.

use std::convert::Infallible;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use http::HeaderMap;
use http_body::{Body as HttpBody, Frame, SizeHint};

use crate::error::{Error, Op, Result};
use crate::net::transfer_encodings;

const OP_DRAIN: Op = "audit/drain_body";

/// A request body held fully in memory
#[derive(Debug, Clone, Default)]
pub struct DrainedBody {
    // `None` is the "no body" sentinel: nothing was read or allocated
    content: Option<Bytes>,
    trailers: Option<HeaderMap>,
}

impl DrainedBody {
    /// The "no body" sentinel
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the original request had no body at all
    pub fn is_no_body(&self) -> bool {
        self.content.is_none()
    }

    /// The drained bytes (cheap, reference-counted)
    pub fn bytes(&self) -> Bytes {
        self.content.clone().unwrap_or_default()
    }

    /// Number of drained bytes
    pub fn len(&self) -> usize {
        self.content.as_ref().map_or(0, Bytes::len)
    }

    /// Whether no bytes were drained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trailer fields received after the body, if any
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// A fresh body stream over the drained content and trailers
    pub fn replay(&self) -> Body {
        match (&self.content, &self.trailers) {
            (None, None) => Body::empty(),
            (Some(bytes), None) => Body::from(bytes.clone()),
            (content, Some(trailers)) => Body::new(ReplayBody {
                data: content.clone(),
                trailers: Some(trailers.clone()),
            }),
        }
    }

    /// Two independent body streams yielding identical bytes
    pub fn split(&self) -> (Body, Body) {
        (self.replay(), self.replay())
    }
}

/// One data frame, then one trailers frame
struct ReplayBody {
    data: Option<Bytes>,
    trailers: Option<HeaderMap>,
}

impl HttpBody for ReplayBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(data) = self.data.take().filter(|d| !d.is_empty()) {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        Poll::Ready(self.trailers.take().map(|t| Ok(Frame::trailers(t))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.data.as_ref().map_or(0, |d| d.len() as u64))
    }
}

/// Read `body` fully into memory
///
/// Bodies that are already known to be empty short-circuit to
/// [`DrainedBody::empty`]. Reading more than `limit` bytes, or any error from
/// the underlying stream, fails with [`Error::Io`]; the partially read body is
/// dropped.
pub async fn drain_body(mut body: Body, limit: usize) -> Result<DrainedBody> {
    if body.is_end_stream() && body.size_hint().exact() == Some(0) {
        return Ok(DrainedBody::empty());
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut trailers: Option<HeaderMap> = None;

    while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let frame = frame.map_err(|e| Error::io(OP_DRAIN, io::Error::other(e)))?;

        match frame.into_data() {
            Ok(data) => {
                if buf.len() + data.len() > limit {
                    return Err(Error::io(
                        OP_DRAIN,
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("request body exceeds {} bytes", limit),
                        ),
                    ));
                }
                buf.extend_from_slice(&data);
            }
            Err(frame) => {
                if let Ok(fields) = frame.into_trailers() {
                    match trailers {
                        Some(ref mut existing) => existing.extend(fields),
                        None => trailers = Some(fields),
                    }
                }
            }
        }
    }

    Ok(DrainedBody {
        content: Some(Bytes::from(buf)),
        trailers,
    })
}

/// HTTP/1.1 chunked framing of `data` as a single chunk plus the terminator
///
/// An empty payload produces only the terminating zero-length chunk.
pub fn chunk_encode(data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + 16);
    if !data.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    Bytes::from(out)
}

/// The audit copy of a request body
#[derive(Debug, Clone)]
pub struct DumpedBody {
    /// Body as the audit trail records it (chunk-framed for chunked requests)
    pub content: Bytes,
    /// Number of payload bytes handed back to the request
    pub payload_len: usize,
    /// Trailer fields received after the body
    pub trailers: Option<HeaderMap>,
}

/// Drain the request body, restore it for downstream handlers and return the
/// audit copy
///
/// When the request's first transfer-coding is `chunked` the audit copy is
/// re-framed with chunked encoding so it reads like the bytes on the wire.
/// The body put back into the request always carries the plain payload.
pub async fn dump_body(request: &mut Request, limit: usize) -> Result<DumpedBody> {
    let chunked = transfer_encodings(request.headers())
        .first()
        .is_some_and(|coding| coding == "chunked");

    let body = std::mem::take(request.body_mut());
    let drained = drain_body(body, limit).await?;
    *request.body_mut() = drained.replay();

    let content = if chunked {
        chunk_encode(&drained.bytes())
    } else {
        drained.bytes()
    };

    Ok(DumpedBody {
        content,
        payload_len: drained.len(),
        trailers: drained.trailers().cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use futures::stream;
    use http::header;

    /// Decode HTTP/1.1 chunked framing, ignoring chunk extensions and trailers
    fn decode_chunked(mut input: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let line_end = input.windows(2).position(|w| w == b"\r\n")?;
            let size_line = std::str::from_utf8(&input[..line_end]).ok()?;
            let size_hex = size_line.split(';').next()?.trim();
            let size = usize::from_str_radix(size_hex, 16).ok()?;
            input = &input[line_end + 2..];
            if size == 0 {
                return input.starts_with(b"\r\n").then_some(out);
            }
            if input.len() < size + 2 || &input[size..size + 2] != b"\r\n" {
                return None;
            }
            out.extend_from_slice(&input[..size]);
            input = &input[size + 2..];
        }
    }

    #[tokio::test]
    async fn test_drain_empty_body_is_sentinel() {
        let drained = drain_body(Body::empty(), 1024).await.unwrap();
        assert!(drained.is_no_body());
        assert_eq!(drained.len(), 0);

        let (a, b) = drained.split();
        assert!(to_bytes(a, usize::MAX).await.unwrap().is_empty());
        assert!(to_bytes(b, usize::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_split_copies_are_independent() {
        let drained = drain_body(Body::from("hello audit"), 1024).await.unwrap();
        assert!(!drained.is_no_body());

        let (first, second) = drained.split();
        drop(first);
        let bytes = to_bytes(second, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello audit");

        // The drained buffer survives both views
        assert_eq!(&drained.bytes()[..], b"hello audit");
    }

    #[tokio::test]
    async fn test_drain_multi_frame_stream() {
        let chunks: Vec<std::result::Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"ghi")),
        ];
        let body = Body::from_stream(stream::iter(chunks));
        let drained = drain_body(body, 1024).await.unwrap();
        assert_eq!(&drained.bytes()[..], b"abcdefghi");
    }

    #[tokio::test]
    async fn test_drain_read_error_is_io() {
        let chunks: Vec<std::result::Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")),
        ];
        let body = Body::from_stream(stream::iter(chunks));
        match drain_body(body, 1024).await {
            Err(Error::Io { op, .. }) => assert_eq!(op, OP_DRAIN),
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drain_enforces_limit() {
        let result = drain_body(Body::from(vec![b'x'; 64]), 63).await;
        assert!(matches!(result, Err(Error::Io { .. })));

        let drained = drain_body(Body::from(vec![b'x'; 64]), 64).await.unwrap();
        assert_eq!(drained.len(), 64);
    }

    fn body_with_trailers(data: &'static [u8]) -> Body {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());
        Body::new(ReplayBody {
            data: Some(Bytes::from_static(data)),
            trailers: Some(trailers),
        })
    }

    #[tokio::test]
    async fn test_trailers_survive_replay() {
        let drained = drain_body(body_with_trailers(b"signed payload"), 1024)
            .await
            .unwrap();
        assert_eq!(drained.trailers().unwrap()["x-checksum"], "abc123");

        let (first, second) = drained.split();
        for copy in [first, second] {
            let replayed = drain_body(copy, 1024).await.unwrap();
            assert_eq!(&replayed.bytes()[..], b"signed payload");
            assert_eq!(replayed.trailers(), drained.trailers());
        }
    }

    #[tokio::test]
    async fn test_dump_body_restores_trailers() {
        let mut request = http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::TRANSFER_ENCODING, "chunked")
            .header(header::TRAILER, "x-checksum")
            .body(body_with_trailers(b"abc"))
            .unwrap();

        let dumped = dump_body(&mut request, 1024).await.unwrap();
        assert!(dumped.trailers.is_some());

        let restored = drain_body(request.into_body(), 1024).await.unwrap();
        assert_eq!(&restored.bytes()[..], b"abc");
        assert_eq!(restored.trailers().unwrap()["x-checksum"], "abc123");
    }

    #[test]
    fn test_chunk_encode_framing() {
        assert_eq!(&chunk_encode(b"hello")[..], b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(&chunk_encode(b"")[..], b"0\r\n\r\n");

        let payload = vec![b'z'; 300];
        let encoded = chunk_encode(&payload);
        assert!(encoded.starts_with(b"12c\r\n"));
        assert_eq!(decode_chunked(&encoded).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_dump_body_restores_request() {
        let payload = r#"{"title":"Repo Man","year":1984}"#;
        let mut request = http::Request::builder()
            .method("POST")
            .uri("/api/v1/movies")
            .body(Body::from(payload))
            .unwrap();

        let dumped = dump_body(&mut request, 1024).await.unwrap();
        assert_eq!(&dumped.content[..], payload.as_bytes());
        assert_eq!(dumped.payload_len, payload.len());

        let restored = to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&restored[..], payload.as_bytes());
    }

    #[tokio::test]
    async fn test_dump_body_chunked_audit_copy() {
        let payload = b"streamed payload".to_vec();
        let mut request = http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(Body::from(payload.clone()))
            .unwrap();

        let dumped = dump_body(&mut request, 1024).await.unwrap();
        assert_eq!(decode_chunked(&dumped.content).unwrap(), payload);

        // The handler gets the plain payload, not the framing
        let restored = to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&restored[..], &payload[..]);
    }
}
