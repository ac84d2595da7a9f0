//! Incremental response sink handed to handlers.
//!
//! A [`ResponseWriter`] accumulates status, headers and body bytes. Until the
//! first [`flush`](ResponseWriter::flush) nothing reaches the wire and the whole
//! response is serialized once with a `Content-Length`. Flushing commits the head
//! with `Transfer-Encoding: chunked` and pushes every pending body byte to the
//! connection task as one chunk; from then on header mutations are ignored.
//!
//! Writers created with [`ResponseWriter::buffered`] have no transport behind
//! them. They keep the body in memory and report [`WriteError::FlushUnsupported`]
//! on flush, which is what streaming constructors use to refuse them.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::response::{LAST_CHUNK, encode_chunk, encode_chunked_head};
use super::{Headers, Response, StatusCode};

/// A writer shared between the dispatcher, the handler chain and any
/// streaming connection built on top of it.
pub type SharedWriter = Arc<Mutex<ResponseWriter>>;

/// Errors produced while writing a response.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("response already finished")]
    Finished,

    #[error("peer is no longer receiving the response")]
    Disconnected,

    #[error("streaming unsupported")]
    FlushUnsupported,
}

/// Response sink supporting status assignment, header mutation, body writes and
/// incremental flushing.
///
/// # Examples
///
/// ```
/// use switchyard::http::{ResponseWriter, StatusCode};
///
/// let mut w = ResponseWriter::buffered();
/// w.headers_mut().set("Content-Type", "text/plain");
/// w.write_header(StatusCode::Created);
/// w.write(b"made").unwrap();
///
/// assert_eq!(w.status(), StatusCode::Created);
/// assert_eq!(w.body(), b"made");
/// ```
#[derive(Debug)]
pub struct ResponseWriter {
    status: Option<StatusCode>,
    headers: Headers,
    body: BytesMut,
    keep_alive: bool,
    committed: bool,
    finished: bool,
    head_only: bool,
    stream: Option<mpsc::Sender<Bytes>>,
}

impl ResponseWriter {
    /// Creates a writer that forwards serialized bytes to `stream`.
    ///
    /// The receiving side is expected to copy each buffer to the socket in order.
    pub fn streaming(stream: mpsc::Sender<Bytes>, keep_alive: bool) -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            keep_alive,
            committed: false,
            finished: false,
            head_only: false,
            stream: Some(stream),
        }
    }

    /// Creates an in-memory writer that cannot flush.
    pub fn buffered() -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            keep_alive: true,
            committed: false,
            finished: false,
            head_only: false,
            stream: None,
        }
    }

    /// Suppresses body bytes on the wire, for responses to `HEAD`.
    ///
    /// Handlers still write their body; it only contributes to `Content-Length`.
    #[must_use]
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    /// Wraps the writer for sharing across the request.
    pub fn into_shared(self) -> SharedWriter {
        Arc::new(Mutex::new(self))
    }

    /// Returns the status that will be (or was) sent. Defaults to `200 OK`.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::Ok)
    }

    /// Returns `true` once a status has been written explicitly or implied by a body write.
    pub fn status_written(&self) -> bool {
        self.status.is_some()
    }

    /// Records the response status.
    ///
    /// Only the first call takes effect; later calls are ignored and return `false`.
    pub fn write_header(&mut self, status: StatusCode) -> bool {
        if self.status.is_some() || self.committed {
            debug!(
                requested = status.as_u16(),
                current = self.status().as_u16(),
                "superfluous status write ignored"
            );
            return false;
        }
        self.status = Some(status);
        true
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for mutation.
    ///
    /// Changes made after the head is committed never reach the peer.
    pub fn headers_mut(&mut self) -> &mut Headers {
        if self.committed {
            debug!("header mutation after commit has no effect");
        }
        &mut self.headers
    }

    /// Appends bytes to the body. Implies `200 OK` if no status was written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.finished {
            return Err(WriteError::Finished);
        }
        if self.status.is_none() {
            self.status = Some(StatusCode::Ok);
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    /// Returns the bytes written but not yet flushed.
    ///
    /// For buffered writers this is the whole body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns `true` if this writer can push partial responses to the peer.
    pub fn supports_flush(&self) -> bool {
        self.stream.is_some() && !self.finished
    }

    /// Returns `true` once the head has been sent.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Sends everything written so far to the peer.
    ///
    /// The first flush commits the head. Blocks for as long as the connection
    /// task applies backpressure.
    pub async fn flush(&mut self) -> Result<(), WriteError> {
        if self.finished {
            return Err(WriteError::Finished);
        }
        let Some(stream) = self.stream.as_ref() else {
            return Err(WriteError::FlushUnsupported);
        };

        let mut out = BytesMut::new();
        if !self.committed {
            let status = self.status();
            self.status = Some(status);
            out.extend_from_slice(&encode_chunked_head(status, &self.headers, self.keep_alive));
            self.committed = true;
        }
        if !self.head_only {
            out.extend_from_slice(&encode_chunk(&self.body));
        }
        self.body.clear();

        if out.is_empty() {
            return Ok(());
        }
        stream
            .send(out.freeze())
            .await
            .map_err(|_| WriteError::Disconnected)
    }

    /// Completes the response.
    ///
    /// A committed response gets its remaining bytes and the terminating chunk;
    /// an uncommitted one is serialized in full. The transport channel is
    /// released either way, and every later write or flush fails with
    /// [`WriteError::Finished`]. Calling `finish` twice is a no-op.
    pub async fn finish(&mut self) -> Result<(), WriteError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };

        if self.committed && self.head_only {
            self.body.clear();
            return Ok(());
        }

        let bytes = if self.committed {
            let mut out = BytesMut::from(encode_chunk(&self.body).as_ref());
            out.extend_from_slice(LAST_CHUNK);
            self.body.clear();
            out.freeze()
        } else if self.head_only {
            self.to_response().into_head_bytes().freeze()
        } else {
            self.to_response().into_bytes().freeze()
        };
        stream.send(bytes).await.map_err(|_| WriteError::Disconnected)
    }

    fn to_response(&self) -> Response {
        let mut response = Response::new(self.status())
            .keep_alive(self.keep_alive)
            .body_bytes(self.body.to_vec());
        for (name, value) in self.headers.iter() {
            if !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("connection") {
                response.add_header(name, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<Bytes>) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn first_status_wins() {
        let mut w = ResponseWriter::buffered();
        assert!(w.write_header(StatusCode::NotFound));
        assert!(!w.write_header(StatusCode::Ok));
        assert_eq!(w.status(), StatusCode::NotFound);
    }

    #[test]
    fn body_write_implies_ok() {
        let mut w = ResponseWriter::buffered();
        w.write(b"x").unwrap();
        assert!(w.status_written());
        assert!(!w.write_header(StatusCode::Accepted));
        assert_eq!(w.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn buffered_writer_cannot_flush() {
        let mut w = ResponseWriter::buffered();
        assert!(!w.supports_flush());
        assert!(matches!(w.flush().await, Err(WriteError::FlushUnsupported)));
    }

    #[tokio::test]
    async fn unflushed_response_is_sent_with_content_length() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut w = ResponseWriter::streaming(tx, true);
        w.write_header(StatusCode::Created);
        w.write(b"hello").unwrap();
        w.finish().await.unwrap();

        let s = drain(&mut rx).await;
        assert!(s.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn flushed_response_is_chunked_and_terminated() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut w = ResponseWriter::streaming(tx, true);
        w.headers_mut().set("Content-Type", "text/event-stream");
        w.write(b"data: 1\n\n").unwrap();
        w.flush().await.unwrap();
        w.headers_mut().set("X-Late", "ignored");
        w.write(b"data: 2\n\n").unwrap();
        w.finish().await.unwrap();

        let s = drain(&mut rx).await;
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert!(s.contains("9\r\ndata: 1\n\n\r\n"));
        assert!(s.contains("9\r\ndata: 2\n\n\r\n"));
        assert!(!s.contains("X-Late"));
        assert!(s.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn head_response_keeps_length_but_sends_no_body() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut w = ResponseWriter::streaming(tx, true).head_only(true);
        w.write(b"BODYBYTES").unwrap();
        w.finish().await.unwrap();

        let s = drain(&mut rx).await;
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 9\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(!s.contains("BODYBYTES"));
    }

    #[tokio::test]
    async fn flushed_head_response_sends_head_only() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut w = ResponseWriter::streaming(tx, true).head_only(true);
        w.write(b"data: 1\n\n").unwrap();
        w.flush().await.unwrap();
        w.write(b"data: 2\n\n").unwrap();
        w.finish().await.unwrap();

        let s = drain(&mut rx).await;
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(!s.contains("data:"));
        assert!(!s.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn writes_after_finish_fail() {
        let (tx, _rx) = mpsc::channel(8);
        let mut w = ResponseWriter::streaming(tx, true);
        w.finish().await.unwrap();
        assert!(matches!(w.write(b"late"), Err(WriteError::Finished)));
        assert!(matches!(w.flush().await, Err(WriteError::Finished)));
        assert!(!w.supports_flush());
        w.finish().await.unwrap();
    }

    #[tokio::test]
    async fn flush_reports_disconnected_peer() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut w = ResponseWriter::streaming(tx, true);
        w.write(b"x").unwrap();
        assert!(matches!(w.flush().await, Err(WriteError::Disconnected)));
    }
}
