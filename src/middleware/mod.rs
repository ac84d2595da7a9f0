//! Handlers and middleware: the units a request chain is built from.
//!
//! Every entry in a chain, whether it is a route handler, a piece of global
//! middleware or a status hook, is a [`Handler`]: a type-erased async function of
//! a [`Context`]. Handlers cooperate through [`Context::next`], which runs the
//! next entry of the chain. A handler that never calls it short-circuits the rest
//! of the pipeline.
//!
//! ## Core types
//!
//! - [`Handler`]: type-erased, cheaply-cloneable chain entry.
//! - [`IntoHandler`]: implemented for every `Fn(Context) -> impl Future<Output = ()>`.
//! - [`handler`]: erases an [`IntoHandler`] into a [`Handler`].
//! - [`Middleware`]: trait for struct-based middleware, turned into a handler by
//!   [`from_middleware`].
//! - [`LoggerMiddleware`]: built-in request logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::context::Context;

/// Boxed future returned by every handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A type-erased, reference-counted chain entry.
///
/// The [`Arc`] wrapper makes handlers cheap to clone, so resolving a chain for a
/// request copies pointers rather than closures.
///
/// ```rust
/// use switchyard::{Context, middleware::{Handler, handler}};
///
/// let h: Handler = handler(|ctx: Context| async move {
///     ctx.next().await;
/// });
/// ```
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = ()> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl below,
/// so registration methods can accept closures and `async fn` items directly.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}

/// Erases the concrete handler type.
pub fn handler(h: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| h.call(ctx))
}

/// Converts a [`Middleware`] implementation into a [`Handler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> Handler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context| middleware.handle(ctx))
}

/// The core trait for struct-based middleware.
///
/// Implementors receive the per-request [`Context`]. They may:
///
/// - **Pass through**: call `ctx.next().await`.
/// - **Short-circuit**: write a response and return without calling `next`.
/// - **Decorate**: do work before and after `ctx.next().await`.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally continue the chain.
    fn handle(&self, ctx: Context) -> HandlerFuture;
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the rest of the chain completes:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context) -> HandlerFuture {
        Box::pin(async move {
            let start = Instant::now();
            let (method, path) = match ctx.request() {
                Ok(req) => (req.method().as_str().to_owned(), req.path().to_owned()),
                Err(_) => ("-".to_owned(), "-".to_owned()),
            };

            ctx.next().await;

            let status = match ctx.response() {
                Ok(writer) => writer.lock().await.status().as_u16(),
                Err(_) => 0,
            };
            tracing::info!(
                method = %method,
                path = %path,
                status,
                elapsed = ?start.elapsed(),
                "{} {} - {}",
                method,
                path,
                status
            );
        })
    }
}
