use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, SizeHint};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::error;

use crate::cache::ResponseFile;
use crate::dispatch::{CacheResponse, ResponsePayload, BAD_GATEWAY_BODY};
use crate::metrics;

const CACHE_CHUNK_SIZE: usize = 32 * 1024;

pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Streams a cached data file, stopping exactly after `content_length` bytes
/// when the length is known. Extra bytes in the file are not sent; a file
/// that ends early surfaces as an `UnexpectedEof` error, which aborts the
/// transfer instead of handing the client a silently short body.
pub struct CacheFileBody {
    file: tokio::fs::File,
    remaining: Option<u64>,
}

impl CacheFileBody {
    pub fn new(file: tokio::fs::File, remaining: Option<u64>) -> Self {
        Self { file, remaining }
    }
}

impl Body for CacheFileBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        if this.remaining == Some(0) {
            return Poll::Ready(None);
        }

        let capacity = match this.remaining {
            Some(remaining) => CACHE_CHUNK_SIZE.min(remaining as usize),
            None => CACHE_CHUNK_SIZE,
        };
        let mut buf = vec![0u8; capacity];
        let mut read_buf = ReadBuf::new(&mut buf);

        match Pin::new(&mut this.file).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    return match this.remaining {
                        // a known length that was not reached is a truncated file
                        Some(_) => Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "cache file ended before content length",
                        )))),
                        None => Poll::Ready(None),
                    };
                }
                if let Some(remaining) = &mut this.remaining {
                    *remaining -= n as u64;
                }
                buf.truncate(n);
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(buf)))))
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.remaining {
            Some(remaining) => SizeHint::with_exact(remaining),
            None => SizeHint::default(),
        }
    }
}

/// Response body wrapper that keeps the connection gauges honest: the client
/// gauge drops when the body is released, the upstream gauge additionally for
/// pass-through bodies, and the first mid-stream error is counted once.
pub struct TrackedBody {
    inner: ProxyBody,
    path: String,
    counts_client: bool,
    counts_upstream: bool,
    errored: bool,
}

impl TrackedBody {
    pub fn tracked(inner: ProxyBody, path: &str, from_upstream: bool) -> Self {
        metrics::clients_conn_add(1);
        Self {
            inner,
            path: path.to_string(),
            counts_client: true,
            counts_upstream: from_upstream,
            errored: false,
        }
    }

    pub fn untracked(inner: ProxyBody) -> Self {
        Self {
            inner,
            path: String::new(),
            counts_client: false,
            counts_upstream: false,
            errored: false,
        }
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Err(err))) = &polled {
            if !this.errored {
                this.errored = true;
                error!(path = %this.path, error = %err, "response streaming failed");
                metrics::record_failed_request(metrics::STREAMING_ERROR, &this.path);
            }
        }
        polled
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        if self.counts_client {
            metrics::clients_conn_add(-1);
        }
        if self.counts_upstream {
            metrics::upstream_conn_add(-1);
        }
    }
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Invalid persisted status codes (and anything below 100) collapse to 500.
pub fn clamp_status(code: u16, path: &str) -> StatusCode {
    match StatusCode::from_u16(code) {
        Ok(status) => status,
        Err(_) => {
            error!(code, path, "invalid status code in response, sending 500");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Turn a worker reply into the client-facing response. Headers are copied
/// verbatim; the body source depends on the reply origin.
pub fn build_response(cresp: CacheResponse, path: &str) -> Response<TrackedBody> {
    match cresp.payload {
        ResponsePayload::Upstream(upstream) => {
            let status = upstream.status();
            let headers = upstream.headers().clone();
            let stream = upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(io::Error::other);
            let body = TrackedBody::tracked(StreamBody::new(stream).boxed_unsync(), path, true);
            assemble(status, headers, body)
        }
        ResponsePayload::CacheHit { meta, body } => {
            let status = clamp_status(meta.status_code, path);
            let headers = meta.headers();
            let remaining = content_length_hint(&meta);
            if let Some(length) = remaining {
                metrics::add_bytes_from_cache(length);
            }
            let body =
                TrackedBody::tracked(CacheFileBody::new(body, remaining).boxed_unsync(), path, false);
            assemble(status, headers, body)
        }
        ResponsePayload::BadGateway => {
            let body = TrackedBody::tracked(full_body(BAD_GATEWAY_BODY), path, false);
            assemble(StatusCode::BAD_GATEWAY, HeaderMap::new(), body)
        }
    }
}

fn content_length_hint(meta: &ResponseFile) -> Option<u64> {
    if meta.content_length >= 0 {
        Some(meta.content_length as u64)
    } else {
        None
    }
}

fn assemble(
    status: StatusCode,
    headers: HeaderMap,
    body: TrackedBody,
) -> Response<TrackedBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn collect(body: impl Body<Data = Bytes, Error = io::Error> + Unpin) -> io::Result<Vec<u8>> {
        let mut body = body;
        let mut out = Vec::new();
        loop {
            let frame = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
            match frame {
                None => return Ok(out),
                Some(Err(err)) => return Err(err),
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        out.extend_from_slice(data);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn cache_body_stops_exactly_at_content_length() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abc.layer");
        std::fs::write(&path, b"exact-body-plus-trailing-junk")?;

        let file = tokio::fs::File::open(&path).await?;
        let body = CacheFileBody::new(file, Some(10));
        let out = collect(body).await?;
        assert_eq!(out, b"exact-body");
        Ok(())
    }

    #[tokio::test]
    async fn cache_body_streams_to_eof_when_length_unknown() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abc.layer");
        std::fs::write(&path, b"whole file")?;

        let file = tokio::fs::File::open(&path).await?;
        let body = CacheFileBody::new(file, None);
        let out = collect(body).await?;
        assert_eq!(out, b"whole file");
        Ok(())
    }

    #[tokio::test]
    async fn truncated_cache_file_surfaces_unexpected_eof() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abc.layer");
        std::fs::write(&path, b"short")?;

        let file = tokio::fs::File::open(&path).await?;
        let body = CacheFileBody::new(file, Some(100));
        let err = collect(body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    }

    #[test]
    fn status_codes_below_100_clamp_to_500() {
        assert_eq!(clamp_status(200, "/"), StatusCode::OK);
        assert_eq!(clamp_status(404, "/"), StatusCode::NOT_FOUND);
        assert_eq!(clamp_status(42, "/"), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(clamp_status(0, "/"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn bad_gateway_reply_synthesizes_the_502_body() -> anyhow::Result<()> {
        use crate::dispatch::Origin;

        let response = build_response(
            CacheResponse {
                origin: Origin::Upstream,
                payload: ResponsePayload::BadGateway,
            },
            "/v2/x/blobs/sha256:abc",
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let out = collect(response.into_body()).await?;
        assert_eq!(out, BAD_GATEWAY_BODY.as_bytes());
        Ok(())
    }
}
