use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reelsync_protocol::constants::{
    CHUNK_BODY_ENCODING, HEADER_CHUNK_SHA256, HEADER_TRANSFER_ENCODING, HEADER_UPLOAD_OFFSET,
    content_range,
};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use tracing::debug;

use crate::types::EncodedChunk;

/// A single failed attempt to hand bytes to the remote store.
///
/// Always retryable from the engine's point of view.
#[derive(Debug, thiserror::Error)]
pub enum ChunkTransferError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// Future returned by [`ChunkSink`] operations.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ChunkTransferError>> + Send + 'a>>;

/// Destination for upload bytes behind a pre-signed write URL.
///
/// Resolving means the remote store acknowledged the bytes.
pub trait ChunkSink: Send + Sync {
    /// Writes a whole object in one request with a raw body.
    fn put_object<'a>(&'a self, url: &'a str, content_type: &'a str, body: &'a [u8]) -> SinkFuture<'a>;

    /// Writes one base64 chunk of an object of `total` raw bytes.
    fn put_chunk<'a>(&'a self, url: &'a str, chunk: &'a EncodedChunk, total: u64) -> SinkFuture<'a>;
}

/// [`ChunkSink`] that issues `PUT` requests with `reqwest`.
pub struct HttpChunkSink {
    http: reqwest::Client,
}

impl HttpChunkSink {
    /// Creates a sink whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ChunkTransferError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(), ChunkTransferError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChunkTransferError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl ChunkSink for HttpChunkSink {
    fn put_object<'a>(&'a self, url: &'a str, content_type: &'a str, body: &'a [u8]) -> SinkFuture<'a> {
        Box::pin(async move {
            debug!(bytes = body.len(), "PUT whole object");
            let req = self
                .http
                .put(url)
                .header(CONTENT_TYPE, content_type)
                .body(body.to_vec());
            self.send(req).await
        })
    }

    fn put_chunk<'a>(&'a self, url: &'a str, chunk: &'a EncodedChunk, total: u64) -> SinkFuture<'a> {
        Box::pin(async move {
            let range = content_range(chunk.offset, chunk.len, total)
                .ok_or_else(|| ChunkTransferError::Other("empty chunk".into()))?;
            debug!(offset = chunk.offset, len = chunk.len, "PUT chunk");
            let req = self
                .http
                .put(url)
                .header(CONTENT_RANGE, range)
                .header(HEADER_UPLOAD_OFFSET, chunk.offset.to_string())
                .header(HEADER_CHUNK_SHA256, chunk.checksum.as_str())
                .header(HEADER_TRANSFER_ENCODING, CHUNK_BODY_ENCODING)
                .body(chunk.body.clone());
            self.send(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::{Engine, engine::general_purpose::STANDARD};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use super::*;
    use crate::types::Chunk;

    /// A request as seen by the mock store.
    struct Captured {
        method: String,
        target: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    async fn read_request(stream: &mut TcpStream) -> Captured {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 8192];
        let head_end = loop {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap_or_default().split(' ');
        let method = request_line.next().unwrap_or_default().to_string();
        let target = request_line.next().unwrap_or_default().to_string();
        let headers: HashMap<String, String> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let len: usize = headers
            .get("content-length")
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);
        let mut body = buf[head_end..].to_vec();
        while body.len() < len {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&tmp[..n]);
        }

        Captured {
            method,
            target,
            headers,
            body,
        }
    }

    /// Starts a mock store that answers every request with `status` and
    /// forwards what it received.
    async fn mock_store(status: u16, body: &str) -> (String, mpsc::UnboundedReceiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let body = body.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let req = read_request(&mut stream).await;
                let _ = tx.send(req);
                let resp = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, rx)
    }

    fn chunk(offset: u64, data: &[u8]) -> EncodedChunk {
        Chunk {
            offset,
            data: data.to_vec(),
            checksum: crate::checksum_bytes(data),
        }
        .encode()
    }

    #[tokio::test]
    async fn chunk_put_carries_range_offset_and_checksum() {
        let (url, mut rx) = mock_store(200, "").await;
        let sink = HttpChunkSink::new(Duration::from_secs(5)).unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let encoded = chunk(1024, &data);

        sink.put_chunk(&format!("{url}/bucket/clip.mp4?sig=abc"), &encoded, 4096)
            .await
            .unwrap();

        let req = rx.recv().await.unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.target, "/bucket/clip.mp4?sig=abc");
        assert_eq!(req.headers["content-range"], "bytes 1024-2047/4096");
        assert_eq!(req.headers["x-upload-offset"], "1024");
        assert_eq!(req.headers["x-chunk-sha256"], crate::checksum_bytes(&data));
        assert_eq!(req.headers["content-transfer-encoding"], "base64");
        assert_eq!(STANDARD.decode(&req.body).unwrap(), data);
    }

    #[tokio::test]
    async fn whole_object_put_sends_raw_body() {
        let (url, mut rx) = mock_store(200, "").await;
        let sink = HttpChunkSink::new(Duration::from_secs(5)).unwrap();

        sink.put_object(&format!("{url}/bucket/me.png"), "image/png", b"\x89PNG raw")
            .await
            .unwrap();

        let req = rx.recv().await.unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.headers["content-type"], "image/png");
        assert!(!req.headers.contains_key("content-range"));
        assert!(!req.headers.contains_key("content-transfer-encoding"));
        assert_eq!(req.body, b"\x89PNG raw");
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let (url, _rx) = mock_store(503, "slow down").await;
        let sink = HttpChunkSink::new(Duration::from_secs(5)).unwrap();

        let err = sink
            .put_chunk(&url, &chunk(0, b"abc"), 3)
            .await
            .unwrap_err();

        match err {
            ChunkTransferError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_chunk_is_rejected_before_sending() {
        let sink = HttpChunkSink::new(Duration::from_secs(1)).unwrap();
        let chunk = EncodedChunk {
            offset: 0,
            len: 0,
            body: String::new(),
            checksum: String::new(),
        };
        let err = sink
            .put_chunk("http://127.0.0.1:9/unused", &chunk, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkTransferError::Other(_)));
    }

    #[test]
    fn status_error_display() {
        let err = ChunkTransferError::Status {
            status: 503,
            body: "slow down".into(),
        };
        assert_eq!(err.to_string(), "remote store returned 503: slow down");
    }
}
