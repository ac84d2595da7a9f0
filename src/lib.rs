//! # switchyard
//!
//! An embeddable async HTTP router: pattern/method routing to handler chains,
//! global and grouped middleware cooperating through [`Context::next`], per-status
//! hooks, a typed key-value store and Server-Sent Events streams.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchyard::{Context, Router, Server, StatusCode};
//! use switchyard::middleware::{LoggerMiddleware, from_middleware};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Arc::new(Router::new());
//!     router.use_handler(from_middleware(Arc::new(LoggerMiddleware)));
//!
//!     router.get("/", |ctx: Context| async move {
//!         let _ = ctx.send_string(StatusCode::Ok, "Hello, World!").await;
//!     });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://{}", server.local_addr());
//!     server.serve(router).await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod http;
pub mod middleware;
pub mod realtime;
pub mod router;
pub mod security;
pub mod server;
pub mod store;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::{CancellationToken, Context, ContextError};
pub use http::{Headers, Method, Request, Response, ResponseWriter, StatusCode};
pub use middleware::{Handler, IntoHandler, Middleware};
pub use router::{Group, Router};
pub use server::{Server, ServerConfig, ServerError};
pub use store::{Key, Store};
