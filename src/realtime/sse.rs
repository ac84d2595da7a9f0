//! Server-Sent Events connection bound to one streaming response.
//!
//! A [`Conn`] moves through three states: open, closing and closed. Two
//! independent signals close it:
//!
//! - an explicit [`Conn::close`], which emits a final `close` event;
//! - cancellation of the originating request (peer gone, or the handler that
//!   opened the stream returned).
//!
//! Whichever arrives first performs the transition. The closed flag is checked and
//! set under one mutex together with raising the close signal, so the transition
//! happens exactly once and [`Conn::done`] resolves exactly when it has.

use std::fmt;
use std::io::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::context::{CancellationToken, Context, ContextError};
use crate::http::{SharedWriter, WriteError};

/// Event type used by [`Conn::send_text`] and [`Conn::send_json`].
pub const DEFAULT_EVENT: &str = "message";

const CLOSE_EVENT: &str = "close";
const CLOSE_MESSAGE: &str = "Server closing connection";

/// Errors produced by a streaming connection.
#[derive(Debug, Error)]
pub enum SseError {
    /// The response sink cannot push partial responses.
    #[error("streaming unsupported")]
    StreamUnsupported,

    #[error("connection is closed")]
    Closed,

    #[error("compression error: {0}")]
    Compression(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Per-connection settings.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use switchyard::realtime::SseConfig;
///
/// let config = SseConfig::default()
///     .id("dashboard")
///     .retry(Duration::from_secs(1))
///     .cors_origin("https://example.com")
///     .logging(false);
/// assert_eq!(config.connection_id(), "dashboard");
/// ```
#[derive(Debug, Clone)]
pub struct SseConfig {
    id: String,
    headers: Vec<(String, String)>,
    retry: Duration,
    cors: bool,
    cors_origin: String,
    compression: bool,
    logging: bool,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            headers: vec![
                ("Content-Type".to_owned(), "text/event-stream".to_owned()),
                ("Cache-Control".to_owned(), "no-cache".to_owned()),
                ("Connection".to_owned(), "keep-alive".to_owned()),
            ],
            retry: Duration::from_millis(3000),
            cors: true,
            cors_origin: "*".to_owned(),
            compression: false,
            logging: true,
        }
    }
}

impl SseConfig {
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds a response header, replacing a configured header of the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Client reconnection delay advertised in each frame. Zero omits the `retry:` line.
    #[must_use]
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors = enabled;
        self
    }

    /// Sets the `Access-Control-Allow-Origin` value and enables CORS.
    #[must_use]
    pub fn cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors = true;
        self.cors_origin = origin.into();
        self
    }

    /// Gzip each frame's payload and announce `Content-Encoding: gzip`.
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Log every sent frame at `info`.
    #[must_use]
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.id
    }
}

struct ConnInner {
    config: SseConfig,
    writer: SharedWriter,
    // Closed flag; held across every frame write so no frame follows the close.
    closed: Mutex<bool>,
    close_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

/// Handle to an open event stream.
///
/// Clones share the same connection, so a handle may be parked in the
/// application store and driven from other requests.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::{Context, Router};
/// use switchyard::realtime::{Conn, SseConfig};
///
/// let router = Router::new();
/// router.get("/events", |ctx: Context| async move {
///     let Ok(conn) = Conn::from_context(&ctx, SseConfig::default()).await else {
///         return;
///     };
///     let _ = conn.event("greeting").send_text("hello").await;
///     conn.done().await;
/// });
/// ```
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    /// Opens a stream on the context's response.
    ///
    /// Fails with [`SseError::StreamUnsupported`] when the response cannot be
    /// flushed incrementally. The connection closes on its own once the
    /// request's cancellation token fires.
    pub async fn from_context(ctx: &Context, config: SseConfig) -> Result<Self, SseError> {
        let writer = ctx.response()?;
        if !writer.lock().await.supports_flush() {
            return Err(SseError::StreamUnsupported);
        }
        let conn = Self::new(writer, config);
        conn.watch(ctx.cancellation().clone());
        debug!(id = conn.id(), "event stream opened");
        Ok(conn)
    }

    fn new(writer: SharedWriter, config: SseConfig) -> Self {
        let (close_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnInner {
                config,
                writer,
                closed: Mutex::new(false),
                close_tx,
                done_tx,
            }),
        }
    }

    // Races the explicit close against request cancellation, then signals done.
    fn watch(&self, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut close_rx = inner.close_tx.subscribe();
            tokio::select! {
                _ = raised(&mut close_rx) => {}
                _ = cancel.cancelled() => {
                    let mut closed = inner.closed.lock().await;
                    if !*closed {
                        *closed = true;
                        inner.close_tx.send_replace(true);
                        debug!(id = %inner.config.id, "event stream cancelled");
                    }
                }
            }
            inner.done_tx.send_replace(true);
        });
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Returns `true` once the connection has left the open state.
    pub fn is_closed(&self) -> bool {
        *self.inner.close_tx.borrow()
    }

    /// Sends a final `close` event and closes the connection.
    ///
    /// Only the first call, or the first of a call and a cancellation, has any
    /// effect. The connection is closed even if the final event cannot be written,
    /// in which case the write error is returned.
    pub async fn close(&self) -> Result<(), SseError> {
        let mut closed = self.inner.closed.lock().await;
        if *closed {
            return Ok(());
        }
        let result = self.write_frame(CLOSE_EVENT, CLOSE_MESSAGE).await;
        *closed = true;
        self.inner.close_tx.send_replace(true);
        result
    }

    /// Resolves once the connection is closed, by either source.
    pub async fn done(&self) {
        let mut rx = self.inner.done_tx.subscribe();
        raised(&mut rx).await;
    }

    /// Sends `data` as a default-typed event.
    pub async fn send_text(&self, data: &str) -> Result<(), SseError> {
        self.send(DEFAULT_EVENT, data).await
    }

    /// Sends `data` serialized as JSON as a default-typed event.
    pub async fn send_json<T>(&self, data: &T) -> Result<(), SseError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(data)?;
        self.send(DEFAULT_EVENT, &json).await
    }

    /// Returns a builder for an event of the given type.
    pub fn event(&self, event_type: impl Into<String>) -> Event<'_> {
        Event {
            conn: self,
            event_type: event_type.into(),
        }
    }

    async fn send(&self, event_type: &str, data: &str) -> Result<(), SseError> {
        let closed = self.inner.closed.lock().await;
        if *closed {
            return Err(SseError::Closed);
        }
        let result = self.write_frame(event_type, data).await;
        drop(closed);
        result
    }

    // Caller holds the closed flag.
    async fn write_frame(&self, event_type: &str, data: &str) -> Result<(), SseError> {
        let config = &self.inner.config;
        let payload = if config.compression {
            gzip(data.as_bytes())?
        } else {
            data.as_bytes().to_vec()
        };

        let mut writer = self.inner.writer.lock().await;
        if !writer.is_committed() {
            let headers = writer.headers_mut();
            for (name, value) in &config.headers {
                headers.set(name.as_str(), value.as_str());
            }
            if config.cors {
                headers.set("Access-Control-Allow-Origin", config.cors_origin.as_str());
            }
            if config.compression {
                headers.set("Content-Encoding", "gzip");
            }
        }

        let frame = encode_frame(event_type, config.retry, &payload);
        writer.write(&frame)?;
        writer.flush().await?;
        drop(writer);

        if config.logging {
            info!(id = %config.id, event = event_type, bytes = payload.len(), "sent SSE event");
        }
        Ok(())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A typed event bound to a connection.
pub struct Event<'a> {
    conn: &'a Conn,
    event_type: String,
}

impl Event<'_> {
    pub async fn send_text(&self, data: &str) -> Result<(), SseError> {
        self.conn.send(&self.event_type, data).await
    }

    pub async fn send_json<T>(&self, data: &T) -> Result<(), SseError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(data)?;
        self.conn.send(&self.event_type, &json).await
    }
}

/// Serializes one event: `event:`, optional `retry:`, `data:` and a blank line.
pub fn encode_frame(event_type: &str, retry: Duration, payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(event_type.len() + payload.len() + 32);
    frame.put_slice(b"event: ");
    frame.put_slice(event_type.as_bytes());
    frame.put_u8(b'\n');
    if !retry.is_zero() {
        frame.put_slice(format!("retry: {}\n", retry.as_millis()).as_bytes());
    }
    frame.put_slice(b"data: ");
    frame.put_slice(payload);
    frame.put_slice(b"\n\n");
    frame
}

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

async fn raised(rx: &mut watch::Receiver<bool>) {
    // The sender outlives every receiver handed out here.
    let _ = rx.wait_for(|raised| *raised).await;
}
