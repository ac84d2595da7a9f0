//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests through a
//! [`Router`]. Supports HTTP/1.1 persistent connections (keep-alive) out of the box.
//!
//! Each request is served by two cooperating futures: the router dispatch, which
//! writes into a [`ResponseWriter`], and a drain that copies whatever the writer
//! flushes onto the socket. Responses that are never flushed go out in one piece
//! with a `Content-Length`; flushed ones are streamed with chunked encoding.
//!
//! Every request carries a [`CancellationToken`]. It fires when the peer closes
//! its side or stops accepting bytes, when the server shuts down, and in any case
//! once the dispatch has returned.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::CancellationToken;
use crate::http::{
    Method, ResponseWriter, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Number of flushed chunks that may queue up ahead of a slow peer.
const STREAM_CAPACITY: usize = 32;

/// Connection-level limits.
///
/// # Examples
///
/// ```
/// use switchyard::server::ServerConfig;
///
/// let config = ServerConfig::default().max_request_size(1024 * 1024);
/// assert_eq!(config.request_limit(), 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    max_request_size: usize,
    initial_buffer: usize,
    stream_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_size: MAX_REQUEST_SIZE,
            initial_buffer: INITIAL_BUF_SIZE,
            stream_capacity: STREAM_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Largest request (head plus body) accepted before answering `413`.
    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    #[must_use]
    pub fn initial_buffer(mut self, bytes: usize) -> Self {
        self.initial_buffer = bytes;
        self
    }

    /// Flushed chunks buffered per response before the handler is held back.
    #[must_use]
    pub fn stream_capacity(mut self, chunks: usize) -> Self {
        self.stream_capacity = chunks.max(1);
        self
    }

    pub fn request_limit(&self) -> usize {
        self.max_request_size
    }
}

/// The switchyard HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::{Context, Router, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let router = Arc::new(Router::new());
///     router.get("/", |ctx: Context| async move {
///         let _ = ctx.write_string("Hello!").await;
///     });
///
///     Server::bind("127.0.0.1:8080").await?.serve(router).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: ServerConfig::default(),
        })
    }

    /// Replaces the connection-level limits.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests through `router`.
    ///
    /// Runs until the process is terminated.
    pub async fn serve(self, router: Arc<Router>) -> Result<(), ServerError> {
        self.serve_with_shutdown(router, std::future::pending()).await
    }

    /// Like [`serve`](Self::serve), but stops accepting once `signal` resolves.
    ///
    /// On shutdown every in-flight request's cancellation token fires, so open
    /// event streams close. Connection tasks finish on their own; they are not
    /// awaited.
    pub async fn serve_with_shutdown(
        self,
        router: Arc<Router>,
        signal: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let config = Arc::new(self.config);
        let shutdown = CancellationToken::new();
        info!(address = %self.local_addr, "switchyard listening");

        tokio::pin!(signal);
        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut signal => {
                    info!(address = %self.local_addr, "shutting down");
                    shutdown.cancel();
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let router = Arc::clone(&router);
            let config = Arc::clone(&config);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, router, config, shutdown).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, serving one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(config.initial_buffer);
    let (mut reader, mut sink) = stream.split();

    loop {
        // Pipelined requests may already be buffered.
        if !buf.is_empty() {
            match Request::parse(&buf) {
                Ok((request, body_offset)) => {
                    let content_length = request.content_length().unwrap_or(0);
                    if content_length > config.max_request_size {
                        let e = RequestError::BodyTooLarge {
                            max_bytes: config.max_request_size,
                        };
                        warn!(peer = %peer_addr, error = %e, "sending 413");
                        reject(&mut sink, StatusCode::PayloadTooLarge, "Request entity too large").await?;
                        break;
                    }

                    let total_needed = body_offset.saturating_add(content_length);
                    if buf.len() >= total_needed {
                        // Drop the consumed request bytes from the buffer.
                        let _ = buf.split_to(total_needed);
                        let keep_alive = request.is_keep_alive();
                        let request = request.with_peer_addr(peer_addr);

                        debug!(
                            peer = %peer_addr,
                            method = %request.method(),
                            path = %request.path(),
                            "dispatching request"
                        );
                        let ended = exchange(
                            &mut reader,
                            &mut sink,
                            &mut buf,
                            request,
                            keep_alive,
                            &router,
                            &config,
                            &shutdown,
                        )
                        .await?;

                        if ended || !keep_alive {
                            debug!(peer = %peer_addr, "closing connection");
                            break;
                        }
                        continue;
                    }
                }
                Err(RequestError::Incomplete) => {}
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                    reject(&mut sink, StatusCode::BadRequest, &format!("Bad Request: {e}")).await?;
                    break;
                }
            }
        }

        // Guard against excessively large requests.
        if buf.len() > config.max_request_size {
            warn!(peer = %peer_addr, "request too large, sending 413");
            reject(&mut sink, StatusCode::PayloadTooLarge, "Request entity too large").await?;
            break;
        }

        if reader.read_buf(&mut buf).await? == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }
    }

    Ok(())
}

/// Serves one request. Returns `true` when the connection must not be reused.
#[allow(clippy::too_many_arguments)]
async fn exchange(
    reader: &mut ReadHalf<'_>,
    sink: &mut WriteHalf<'_>,
    buf: &mut BytesMut,
    request: Request,
    keep_alive: bool,
    router: &Arc<Router>,
    config: &ServerConfig,
    shutdown: &CancellationToken,
) -> io::Result<bool> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(config.stream_capacity);
    let head_only = *request.method() == Method::Head;
    let writer = ResponseWriter::streaming(tx, keep_alive)
        .head_only(head_only)
        .into_shared();
    let cancel = CancellationToken::new();

    let dispatch = async {
        router.dispatch(request, Arc::clone(&writer), cancel.clone()).await;
        if let Err(e) = writer.lock().await.finish().await {
            debug!(error = %e, "response not completed");
        }
        cancel.cancel();
    };

    // Keeps receiving after a failed write so the handler never blocks on a full channel.
    let drain = async {
        let mut failed = None;
        while let Some(bytes) = rx.recv().await {
            if failed.is_some() {
                continue;
            }
            if let Err(e) = sink.write_all(&bytes).await {
                cancel.cancel();
                failed = Some(e);
            }
        }
        match failed {
            Some(e) => Err(e),
            None => sink.flush().await,
        }
    };

    let both = async { tokio::join!(dispatch, drain) };
    tokio::pin!(both);

    let mut peer_gone = false;
    let mut shutting_down = false;
    let ((), drained) = loop {
        tokio::select! {
            out = &mut both => break out,
            read = reader.read_buf(&mut *buf), if !peer_gone && buf.len() <= config.max_request_size => {
                if matches!(read, Ok(0) | Err(_)) {
                    debug!("peer went away mid-response");
                    peer_gone = true;
                    cancel.cancel();
                }
            }
            () = shutdown.cancelled(), if !shutting_down => {
                shutting_down = true;
                cancel.cancel();
            }
        }
    };

    drained?;
    Ok(peer_gone || shutting_down)
}

async fn reject(sink: &mut WriteHalf<'_>, status: StatusCode, body: &str) -> io::Result<()> {
    let response = Response::new(status).body(body).keep_alive(false);
    sink.write_all(&response.into_bytes()).await?;
    sink.flush().await
}
