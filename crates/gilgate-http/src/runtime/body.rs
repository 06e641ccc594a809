//! Request body adaptation.
//!
//! Body-carrying requests have their first bytes buffered before scheduling so
//! a suspended request can be resubmitted. Anything beyond the buffer stays on
//! the connection and is streamed to the worker thread on demand.

use std::io;

use axum::body::Body;
use axum::http::{HeaderMap, Method, header};
use bytes::Bytes;
use futures::TryStreamExt;
use gilgate_core::RequestBody;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio_util::io::{StreamReader, SyncIoBridge};

pub fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Buffer up to `buffer_length` bytes (or the declared length, if smaller)
/// and leave the remainder streaming.
///
/// # Errors
///
/// Returns an error if the connection fails while the buffer is filled.
pub async fn request_body(
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    buffer_length: usize,
) -> io::Result<RequestBody> {
    if !carries_body(method) {
        return Ok(RequestBody::empty());
    }

    let declared = content_length(headers);
    let limit = declared.map_or(buffer_length, |len| len.min(buffer_length));

    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(stream);
    let mut initial = Vec::with_capacity(limit);
    (&mut reader)
        .take(limit as u64)
        .read_to_end(&mut initial)
        .await?;

    let complete = initial.len() < limit || declared.is_some_and(|len| len <= buffer_length);
    if complete {
        return Ok(RequestBody::buffered(Bytes::from(initial)));
    }

    let rest = SyncIoBridge::new_with_handle(reader, Handle::current());
    Ok(RequestBody::streaming(Bytes::from(initial), Box::new(rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_length(len: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, len.into());
        headers
    }

    #[tokio::test]
    async fn test_get_has_empty_body() {
        let body = request_body(&Method::GET, &HeaderMap::new(), Body::from("ignored"), 16)
            .await
            .unwrap();
        assert_eq!(body.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_small_body_fully_buffered() {
        let mut body = request_body(
            &Method::POST,
            &headers_with_length(5),
            Body::from("hello"),
            16,
        )
        .await
        .unwrap();
        assert_eq!(body.buffered_len(), 5);
        assert_eq!(body.read_all().unwrap(), b"hello");
        assert!(body.rewind().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_large_body_streams_remainder() {
        let body = request_body(&Method::PUT, &HeaderMap::new(), Body::from("hello world"), 4)
            .await
            .unwrap();
        assert_eq!(body.buffered_len(), 4);

        // The bridge blocks, so read off the runtime like a worker thread does
        let (content, mut body) = tokio::task::spawn_blocking(move || {
            let mut body = body;
            let content = body.read_all().unwrap();
            (content, body)
        })
        .await
        .unwrap();
        assert_eq!(content, b"hello world");
        assert!(body.is_partial());
        assert!(body.rewind().is_err());
    }
}
