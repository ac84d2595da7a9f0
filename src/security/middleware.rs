//! Cross-Origin Resource Sharing middleware.

use tracing::debug;

use crate::context::Context;
use crate::middleware::{HandlerFuture, Middleware};
use crate::{Method, StatusCode};

/// CORS middleware: injects `Access-Control-*` headers and answers preflight
/// requests itself.
///
/// # Behavior
///
/// - With no explicit origin configured (or with `"*"` in the allow-list) every
///   request gets `Access-Control-Allow-Origin: *`, with or without an `Origin`
///   header.
/// - With specific origins, a request whose `Origin` is listed gets that origin
///   echoed back plus `Vary: Origin`; any other request passes through untouched.
/// - `OPTIONS` requests that receive CORS headers are short-circuited with
///   `204 No Content`; the rest of the chain is **not** run.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::{Router, middleware::from_middleware, security::CorsMiddleware};
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header")
///     .allow_credentials(true);
///
/// let router = Router::new();
/// router.use_handler(from_middleware(Arc::new(cors)));
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    exposed_headers: Vec<String>,
    allow_credentials: bool,
    max_age: u32,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates a new `CorsMiddleware` with permissive defaults.
    ///
    /// | Setting           | Default value                                       |
    /// |-------------------|-----------------------------------------------------|
    /// | Allowed origins   | `*` (all origins)                                   |
    /// | Allowed methods   | `GET`, `POST`, `PUT`, `DELETE`, `OPTIONS`           |
    /// | Allowed headers   | `Accept`, `Content-Type`, `Content-Length`, `Accept-Encoding`, `X-CSRF-Token`, `Authorization` |
    /// | Exposed headers   | none                                                |
    /// | Credentials       | not allowed                                         |
    /// | Max age           | 86400 seconds                                       |
    pub fn new() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: [
                "Accept",
                "Content-Type",
                "Content-Length",
                "Accept-Encoding",
                "X-CSRF-Token",
                "Authorization",
            ]
            .map(String::from)
            .to_vec(),
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: 86_400,
        }
    }

    /// Adds an allowed origin. The first call replaces the wildcard default;
    /// pass `"*"` to allow every origin again.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Adds a response header the browser may expose to scripts.
    #[must_use]
    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.exposed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// How long, in seconds, a preflight result may be cached.
    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    // The `Access-Control-Allow-Origin` value for a request, or `None` to skip CORS.
    fn allow_origin_for(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*") {
            return Some("*".to_owned());
        }
        let origin = origin?;
        self.allowed_origins
            .iter()
            .any(|o| o == origin)
            .then(|| origin.to_owned())
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context) -> HandlerFuture {
        let cors = self.clone();

        Box::pin(async move {
            let (origin, is_preflight) = match ctx.request() {
                Ok(req) => (
                    req.headers().get("origin").map(str::to_owned),
                    req.method() == &Method::Options,
                ),
                Err(_) => (None, false),
            };

            let Some(allow_origin) = cors.allow_origin_for(origin.as_deref()) else {
                debug!(origin = ?origin, "origin not allowed, skipping CORS headers");
                return ctx.next().await;
            };

            if let Ok(writer) = ctx.response() {
                let mut writer = writer.lock().await;
                let headers = writer.headers_mut();
                if allow_origin != "*" {
                    headers.set("Vary", "Origin");
                }
                headers.set("Access-Control-Allow-Origin", allow_origin);
                headers.set("Access-Control-Allow-Methods", cors.allowed_methods.join(", "));
                headers.set("Access-Control-Allow-Headers", cors.allowed_headers.join(", "));
                if cors.allow_credentials {
                    headers.set("Access-Control-Allow-Credentials", "true");
                }
                if !cors.exposed_headers.is_empty() {
                    headers.set("Access-Control-Expose-Headers", cors.exposed_headers.join(", "));
                }
                headers.set("Access-Control-Max-Age", cors.max_age.to_string());
            }

            if is_preflight {
                ctx.status(StatusCode::NoContent).await;
                return;
            }
            ctx.next().await;
        })
    }
}
