//! Per-request execution context and chain continuation.
//!
//! A [`Context`] is created by the router for every inbound request. It carries
//! the resolved handler chain, a cursor into it, the request's [`Store`] (seeded
//! with the request, the response sink and the owning router) and the request's
//! [`CancellationToken`].
//!
//! `Context` is a cheap handle: clones refer to the same request state. It
//! belongs to exactly one in-flight request and is dropped once the top-level
//! dispatch returns; it must not be shared across requests.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;

pub mod cancel;

pub use cancel::CancellationToken;

use crate::http::{Request, ResponseWriter, SharedWriter, StatusCode, WriteError};
use crate::middleware::Handler;
use crate::router::{Router, hooks};
use crate::store::{Key, Store};

/// Errors raised by context helpers.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A well-known value the helper depends on is absent from the store.
    #[error("{key} not found in context values")]
    Missing { key: &'static str },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write failed: {0}")]
    Write(#[from] WriteError),
}

struct Inner {
    chain: RwLock<Arc<[Handler]>>,
    cursor: AtomicUsize,
    values: Store,
    cancel: CancellationToken,
    // Status codes whose hook is currently running for this request.
    active_hooks: Mutex<Vec<StatusCode>>,
}

/// Per-request carrier of chain state and shared key-value data.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::{Context, Router, StatusCode};
///
/// let router = Router::new();
/// router.get("/hello", |ctx: Context| async move {
///     let name = ctx.query("name").unwrap_or_else(|| "world".to_owned());
///     let _ = ctx.send_string(StatusCode::Ok, &format!("hello {name}")).await;
/// });
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Creates a context with an empty chain and an empty store.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                chain: RwLock::new(Arc::from(Vec::<Handler>::new())),
                cursor: AtomicUsize::new(0),
                values: Store::new(),
                cancel,
                active_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the request's key-value store.
    pub fn values(&self) -> &Store {
        &self.inner.values
    }

    /// Returns the cancellation token inherited from the underlying connection.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Installs the handler chain and rewinds the cursor to its start.
    pub fn set_chain(&self, chain: Vec<Handler>) {
        *self.inner.chain.write() = Arc::from(chain);
        self.inner.cursor.store(0, Ordering::SeqCst);
    }

    /// Returns the index of the next handler to run.
    pub fn cursor(&self) -> usize {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    /// Runs the next handler in the chain.
    ///
    /// Each handler runs at most once: the cursor only moves forward, and once
    /// it reaches the end of the chain further calls are no-ops.
    pub async fn next(&self) {
        let handler = {
            let chain = self.inner.chain.read();
            let len = chain.len();
            match self
                .inner
                .cursor
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| (i < len).then_some(i + 1))
            {
                Ok(index) => Arc::clone(&chain[index]),
                Err(_) => return,
            }
        };
        handler(self.clone()).await;
    }

    /// Returns the in-flight request.
    pub fn request(&self) -> Result<Arc<Request>, ContextError> {
        self.values()
            .get::<Request>(Key::Request)
            .ok_or(ContextError::Missing { key: "request" })
    }

    /// Returns the response sink.
    pub fn response(&self) -> Result<SharedWriter, ContextError> {
        self.values()
            .get::<tokio::sync::Mutex<ResponseWriter>>(Key::Response)
            .ok_or(ContextError::Missing { key: "response" })
    }

    /// Returns the router that dispatched this request.
    pub fn app(&self) -> Result<Arc<Router>, ContextError> {
        self.values()
            .get::<Router>(Key::App)
            .ok_or(ContextError::Missing { key: "app" })
    }

    /// Returns the router-wide store, shared by every request.
    pub fn app_store(&self) -> Result<Arc<Store>, ContextError> {
        self.app().map(|app| app.store())
    }

    /// Returns the first value of a request header.
    pub fn header(&self, name: &str) -> Option<String> {
        let req = self.request().ok()?;
        req.headers().get(name).map(str::to_owned)
    }

    /// Returns a query parameter of the request URL.
    pub fn query(&self, key: &str) -> Option<String> {
        let req = self.request().ok()?;
        req.query_param(key).map(str::to_owned)
    }

    /// Decodes the request body as JSON.
    pub fn body_parser<T>(&self) -> Result<T, ContextError>
    where
        T: DeserializeOwned,
    {
        let req = self.request()?;
        Ok(serde_json::from_slice(req.body())?)
    }

    /// Writes `data` as a JSON body and sets `Content-Type: application/json`.
    pub async fn json<T>(&self, data: &T) -> Result<(), ContextError>
    where
        T: Serialize + ?Sized,
    {
        let mut body = serde_json::to_vec(data)?;
        body.push(b'\n');
        let writer = self.response()?;
        let mut writer = writer.lock().await;
        writer.headers_mut().set("Content-Type", "application/json");
        writer.write(&body)?;
        Ok(())
    }

    /// Appends `s` to the response body.
    pub async fn write_string(&self, s: &str) -> Result<(), ContextError> {
        let writer = self.response()?;
        writer.lock().await.write(s.as_bytes())?;
        Ok(())
    }

    /// Sets the status (running its hook) and then writes `s`.
    ///
    /// The hook output precedes `s`: `send_string(NotFound, "user missing")` with
    /// no `404` hook installed produces the body `Not Founduser missing`. A hook
    /// that writes nothing lets `s` stand alone.
    pub async fn send_string(&self, code: StatusCode, s: &str) -> Result<(), ContextError> {
        // Fail before the status is touched when there is nowhere to write.
        self.response()?;
        self.status(code).await;
        self.write_string(s).await
    }

    /// Writes `code` to the response and consults the status hook table.
    ///
    /// The table is consulted for every code, success codes included, and also
    /// when an earlier status makes the writer ignore `code`. Without a router in
    /// the store the built-in defaults apply. A hook is never re-entered for the
    /// code it is already handling, so a hook may set its own status.
    ///
    /// Whatever the hook or default writes lands in the body before anything the
    /// caller writes next. With no `404` hook installed, `status(NotFound)` followed
    /// by a write yields `Not Found` and then the caller's bytes.
    pub async fn status(&self, code: StatusCode) -> &Self {
        let writer = match self.response() {
            Ok(writer) => writer,
            Err(e) => {
                debug!(status = code.as_u16(), error = %e, "status ignored");
                return self;
            }
        };
        writer.lock().await.write_header(code);

        if !self.enter_hook(code) {
            return self;
        }
        match self.app() {
            Ok(app) => app.handle_error(code, self).await,
            Err(_) => hooks::default_response(code, self).await,
        }
        self.leave_hook(code);
        self
    }

    /// Returns the client address: the first valid entry of `X-Forwarded-For`,
    /// falling back to the socket peer.
    pub fn remote_ip(&self) -> Result<Option<IpAddr>, ContextError> {
        let req = self.request()?;
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.split(',').find_map(|ip| ip.trim().parse::<IpAddr>().ok()));
        Ok(forwarded.or_else(|| req.peer_addr().map(|addr| addr.ip())))
    }

    fn enter_hook(&self, code: StatusCode) -> bool {
        let mut active = self.inner.active_hooks.lock();
        if active.contains(&code) {
            return false;
        }
        active.push(code);
        true
    }

    fn leave_hook(&self, code: StatusCode) {
        self.inner.active_hooks.lock().retain(|c| *c != code);
    }
}
