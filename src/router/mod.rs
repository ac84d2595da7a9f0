//! Request routing: map URL patterns and HTTP methods to handler chains.
//!
//! A [`Router`] owns a route [`Registry`], a list of global middleware, a table of
//! status hooks and an application-wide [`Store`]. All registration methods take
//! `&self`, so routes may be added while requests are being served.
//!
//! For every request, [`Router::dispatch`] seeds a fresh [`Context`] with the
//! request, the response sink and the router itself, resolves the chain
//! `global middleware ++ route handlers` and runs it through [`Context::next`].
//!
//! | Outcome                              | Response                      |
//! |--------------------------------------|-------------------------------|
//! | pattern and method match             | the chain runs                |
//! | pattern matches, method does not     | `405` through the status hook |
//! | nothing matches                      | `404` through the status hook |
//!
//! See [`registry`] for the match precedence rules.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

pub mod hooks;
pub mod registry;
pub mod static_files;

pub use hooks::StatusHooks;
pub use registry::{Pattern, Registry, RouteError, RouteRecord};
pub use static_files::StaticFiles;

use crate::context::{CancellationToken, Context};
use crate::http::SharedWriter;
use crate::middleware::{Handler, IntoHandler, handler};
use crate::store::{Key, Store, Value};
use crate::{Method, Request, StatusCode};

// Every method `any` registers a chain for.
const ANY_METHODS: [Method; 7] = [
    Method::Get,
    Method::Post,
    Method::Put,
    Method::Delete,
    Method::Patch,
    Method::Head,
    Method::Options,
];

// Generates one registration method per HTTP verb on any type exposing
// `route(&self, Method, &str, Vec<Handler>)`.
macro_rules! verb_methods {
    ($($(#[$doc:meta])* $name:ident => $method:ident;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, path: &str, h: impl IntoHandler) {
                self.route(Method::$method, path, vec![handler(h)]);
            }
        )+

        /// Registers `h` for every common method on `path`.
        pub fn any(&self, path: &str, h: impl IntoHandler) {
            let h = handler(h);
            for method in ANY_METHODS {
                self.route(method, path, vec![Arc::clone(&h)]);
            }
        }

        /// Registers `h` for an arbitrary method, including extension methods.
        pub fn method(&self, method: Method, path: &str, h: impl IntoHandler) {
            self.route(method, path, vec![handler(h)]);
        }
    };
}

/// HTTP request router that dispatches requests to registered handler chains.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::{Context, Router, StatusCode};
///
/// let router = Arc::new(Router::new());
///
/// router.get("/ping", |ctx: Context| async move {
///     let _ = ctx.send_string(StatusCode::Ok, "pong").await;
/// });
///
/// router.on_error_code(StatusCode::NotFound, |ctx: Context| async move {
///     let _ = ctx.json(&serde_json::json!({ "error": "no such route" })).await;
/// });
/// ```
pub struct Router {
    routes: Registry,
    middleware: RwLock<Vec<Handler>>,
    hooks: StatusHooks,
    store: Arc<Store>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new router with no routes, no middleware and no hooks.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self {
            routes: Registry::new(),
            middleware: RwLock::new(Vec::new()),
            hooks: StatusHooks::new(),
            store: Arc::new(Store::new()),
        }
    }

    verb_methods! {
        /// Register a handler for `GET` requests matching `path`.
        ///
        /// # Examples
        ///
        /// ```rust,no_run
        /// use switchyard::{Context, Router};
        ///
        /// let router = Router::new();
        /// router.get("/hello", |ctx: Context| async move {
        ///     let _ = ctx.write_string("hello").await;
        /// });
        /// ```
        get => Get;
        /// Register a handler for `POST` requests matching `path`.
        post => Post;
        /// Register a handler for `PUT` requests matching `path`.
        put => Put;
        /// Register a handler for `DELETE` requests matching `path`.
        delete => Delete;
        /// Register a handler for `PATCH` requests matching `path`.
        patch => Patch;
        /// Register a handler for `OPTIONS` requests matching `path`.
        options => Options;
        /// Register a handler for `HEAD` requests matching `path`.
        head => Head;
    }

    /// Registers an ordered handler chain for `(method, path)`.
    ///
    /// A later registration of the same pair replaces the earlier chain.
    pub fn route(&self, method: Method, path: &str, handlers: Vec<Handler>) {
        debug!(method = %method, path, handlers = handlers.len(), "route registered");
        self.routes.add(path, method, handlers);
    }

    /// Appends a global middleware, run before every matched route chain.
    pub fn use_middleware(&self, h: impl IntoHandler) {
        self.use_handler(handler(h));
    }

    /// Appends an already erased global middleware, e.g. one built with
    /// [`from_middleware`](crate::middleware::from_middleware).
    pub fn use_handler(&self, h: Handler) {
        self.middleware.write().push(h);
    }

    /// Installs the hook run whenever `code` is written through [`Context::status`].
    ///
    /// A later registration for the same code replaces the earlier hook.
    pub fn on_error_code(&self, code: StatusCode, h: impl IntoHandler) {
        self.hooks.set(code, handler(h));
    }

    /// Returns a registration scope that prefixes paths and prepends `middleware`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use switchyard::{Context, Router};
    ///
    /// let router = Router::new();
    /// let api = router.group("/api", Vec::new());
    /// api.get("/users", |ctx: Context| async move {
    ///     let _ = ctx.json(&["ada", "grace"]).await;
    /// });
    /// ```
    pub fn group(&self, prefix: &str, middleware: Vec<Handler>) -> Group<'_> {
        Group {
            router: self,
            prefix: prefix.to_owned(),
            middleware,
        }
    }

    /// Serves files from `dir` for `GET` requests below `prefix`.
    ///
    /// The request path minus `prefix` is resolved inside `dir`; paths that
    /// would escape it answer `404`.
    ///
    /// The path is used as sent: percent-escapes are not decoded, so
    /// `/assets/my%20file.txt` looks for a file literally named `my%20file.txt`.
    /// Each file is read into memory whole before it is written.
    pub fn static_files(&self, prefix: &str, dir: impl Into<PathBuf>) {
        let files = StaticFiles::new(prefix, dir);
        self.route(Method::Get, &format!("{prefix}*"), vec![files.into_handler()]);
    }

    /// Returns the application-wide store shared by every request.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Returns the route registry.
    pub fn routes(&self) -> &Registry {
        &self.routes
    }

    /// Return the number of registered patterns.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no route has been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolves the full chain for a request: global middleware, then the route's handlers.
    pub fn resolve(&self, path: &str, method: &Method) -> Result<Vec<Handler>, RouteError> {
        let route = self.routes.resolve(path, method)?;
        let middleware = self.middleware.read();
        let mut chain = Vec::with_capacity(middleware.len() + route.len());
        chain.extend(middleware.iter().cloned());
        chain.extend(route.iter().cloned());
        Ok(chain)
    }

    /// Runs the status hook for `code`, or the built-in response if none is installed.
    pub async fn handle_error(&self, code: StatusCode, ctx: &Context) {
        self.hooks.run(code, ctx).await;
    }

    /// Dispatch `request` through the matching chain, writing into `writer`.
    ///
    /// Returns once the chain (or the status hook standing in for it) has
    /// returned. Completing the response on the wire is left to the caller.
    pub async fn dispatch(self: &Arc<Self>, request: Request, writer: SharedWriter, cancel: CancellationToken) {
        let method = request.method().clone();
        let path = request.path().to_owned();

        let ctx = Context::new(cancel);
        ctx.values().set(Key::Request, request);
        ctx.values().set_value(Key::Response, writer);
        let app: Value = Arc::<Router>::clone(self);
        ctx.values().set_value(Key::App, app);

        match self.resolve(&path, &method) {
            Ok(chain) => {
                debug!(method = %method, path = %path, handlers = chain.len(), "dispatching");
                ctx.set_chain(chain);
                ctx.next().await;
            }
            Err(RouteError::MethodDisallowed) => {
                debug!(method = %method, path = %path, "method not allowed");
                ctx.status(StatusCode::MethodNotAllowed).await;
            }
            Err(RouteError::NoMatch) => {
                debug!(method = %method, path = %path, "no route");
                ctx.status(StatusCode::NotFound).await;
            }
        }
    }
}

/// A registration scope sharing a path prefix and a middleware list.
///
/// Routes registered through a group are stored in the owning router as
/// `prefix + path` with the chain `group middleware ++ handlers`. Groups nest.
pub struct Group<'a> {
    router: &'a Router,
    prefix: String,
    middleware: Vec<Handler>,
}

impl Group<'_> {
    verb_methods! {
        /// Register a handler for `GET` requests matching `prefix + path`.
        get => Get;
        /// Register a handler for `POST` requests matching `prefix + path`.
        post => Post;
        /// Register a handler for `PUT` requests matching `prefix + path`.
        put => Put;
        /// Register a handler for `DELETE` requests matching `prefix + path`.
        delete => Delete;
        /// Register a handler for `PATCH` requests matching `prefix + path`.
        patch => Patch;
        /// Register a handler for `OPTIONS` requests matching `prefix + path`.
        options => Options;
        /// Register a handler for `HEAD` requests matching `prefix + path`.
        head => Head;
    }

    /// Registers a chain for `(method, prefix + path)`, after the group's middleware.
    pub fn route(&self, method: Method, path: &str, handlers: Vec<Handler>) {
        let mut chain = Vec::with_capacity(self.middleware.len() + handlers.len());
        chain.extend(self.middleware.iter().cloned());
        chain.extend(handlers);
        self.router.route(method, &format!("{}{}", self.prefix, path), chain);
    }

    /// Opens a nested group; its middleware runs after this group's.
    pub fn group(&self, prefix: &str, middleware: Vec<Handler>) -> Group<'_> {
        let mut chain = self.middleware.clone();
        chain.extend(middleware);
        Group {
            router: self.router,
            prefix: format!("{}{}", self.prefix, prefix),
            middleware: chain,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::http::ResponseWriter;

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    async fn serve(router: &Arc<Router>, method: &str, path: &str) -> (StatusCode, Vec<u8>) {
        let writer = ResponseWriter::buffered().into_shared();
        router
            .dispatch(make_request(method, path), writer.clone(), CancellationToken::new())
            .await;
        let w = writer.lock().await;
        (w.status(), w.body().to_vec())
    }

    fn say(text: &'static str) -> impl IntoHandler {
        move |ctx: Context| async move {
            let _ = ctx.write_string(text).await;
        }
    }

    fn tag(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        let log = Arc::clone(log);
        handler(move |ctx: Context| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(name);
                ctx.next().await;
            }
        })
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::default();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[tokio::test]
    async fn empty_router_answers_404() {
        let router = Arc::new(Router::new());
        let (status, body) = serve(&router, "GET", "/").await;
        assert_eq!(status, StatusCode::NotFound);
        assert_eq!(body, b"Not Found");
    }

    #[tokio::test]
    async fn get_route_matches() {
        let router = Arc::new(Router::new());
        router.get("/hello", say("hi"));
        assert_eq!(serve(&router, "GET", "/hello").await, (StatusCode::Ok, b"hi".to_vec()));
    }

    #[tokio::test]
    async fn wrong_method_answers_405_without_body() {
        let router = Arc::new(Router::new());
        router.get("/a", say("a"));
        let (status, body) = serve(&router, "POST", "/a").await;
        assert_eq!(status, StatusCode::MethodNotAllowed);
        assert!(body.is_empty());
        assert_eq!(serve(&router, "POST", "/b").await.0, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn reregistration_replaces_chain() {
        let router = Arc::new(Router::new());
        router.get("/path", say("first"));
        router.get("/path", say("second"));
        assert_eq!(serve(&router, "GET", "/path").await.1, b"second");
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn global_middleware_runs_before_route_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new());
        router.use_handler(tag(&log, "mw1"));
        router.use_handler(tag(&log, "mw2"));
        router.route(Method::Get, "/x", vec![tag(&log, "h1"), tag(&log, "h2")]);
        serve(&router, "GET", "/x").await;
        assert_eq!(*log.lock(), vec!["mw1", "mw2", "h1", "h2"]);
    }

    #[tokio::test]
    async fn middleware_added_after_route_still_runs_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new());
        router.route(Method::Get, "/late", vec![tag(&log, "route")]);
        router.use_handler(tag(&log, "mw"));
        serve(&router, "GET", "/late").await;
        assert_eq!(*log.lock(), vec!["mw", "route"]);
    }

    #[tokio::test]
    async fn middleware_does_not_run_for_unmatched_requests() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new());
        router.use_handler(tag(&log, "mw"));
        serve(&router, "GET", "/nothing").await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn short_circuiting_middleware_stops_chain() {
        let router = Arc::new(Router::new());
        router.use_middleware(|ctx: Context| async move {
            let _ = ctx.send_string(StatusCode::Unauthorized, "no").await;
        });
        router.get("/secret", say("treasure"));
        assert_eq!(
            serve(&router, "GET", "/secret").await,
            (StatusCode::Unauthorized, b"no".to_vec())
        );
    }

    #[tokio::test]
    async fn custom_not_found_hook_replaces_default_body() {
        let router = Arc::new(Router::new());
        router.on_error_code(StatusCode::NotFound, |ctx: Context| async move {
            let _ = ctx.json(&serde_json::json!({ "error": "missing" })).await;
        });
        let (status, body) = serve(&router, "GET", "/nope").await;
        assert_eq!(status, StatusCode::NotFound);
        assert_eq!(body, b"{\"error\":\"missing\"}\n");
    }

    #[tokio::test]
    async fn hook_runs_for_success_codes_and_cannot_reenter() {
        let router = Arc::new(Router::new());
        router.on_error_code(StatusCode::Created, |ctx: Context| async move {
            // Setting the same code from its own hook must not recurse.
            ctx.status(StatusCode::Created).await;
            let _ = ctx.write_string("[created]").await;
        });
        router.post("/items", |ctx: Context| async move {
            let _ = ctx.send_string(StatusCode::Created, "item").await;
        });
        assert_eq!(
            serve(&router, "POST", "/items").await,
            (StatusCode::Created, b"[created]item".to_vec())
        );
    }

    #[tokio::test]
    async fn any_registers_common_methods() {
        let router = Arc::new(Router::new());
        router.any("/any", say("ok"));
        for method in ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD"] {
            assert_eq!(serve(&router, method, "/any").await.0, StatusCode::Ok, "{method}");
        }
        assert_eq!(serve(&router, "TRACE", "/any").await.0, StatusCode::MethodNotAllowed);
    }

    #[tokio::test]
    async fn extension_method_route() {
        let router = Arc::new(Router::new());
        router.method(Method::Custom("PURGE".into()), "/cache", say("purged"));
        assert_eq!(serve(&router, "PURGE", "/cache").await.1, b"purged");
    }

    #[tokio::test]
    async fn wildcard_route_matches_prefix() {
        let router = Arc::new(Router::new());
        router.get("/files/*", |ctx: Context| async move {
            let path = ctx.request().unwrap().path().to_owned();
            let _ = ctx.write_string(&path).await;
        });
        assert_eq!(
            serve(&router, "GET", "/files/docs/readme.txt").await.1,
            b"/files/docs/readme.txt"
        );
        assert_eq!(serve(&router, "GET", "/other").await.0, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn groups_prefix_paths_and_nest_middleware() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new());
        router.use_handler(tag(&log, "global"));

        let api = router.group("/api", vec![tag(&log, "api")]);
        let v1 = api.group("/v1", vec![tag(&log, "v1")]);
        assert_eq!(v1.prefix(), "/api/v1");
        v1.route(Method::Get, "/users", vec![tag(&log, "users")]);

        serve(&router, "GET", "/api/v1/users").await;
        assert_eq!(*log.lock(), vec!["global", "api", "v1", "users"]);
        assert_eq!(serve(&router, "GET", "/users").await.0, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn dispatch_seeds_app_and_request() {
        let router = Arc::new(Router::new());
        router.store().set("greeting", String::from("howdy"));
        router.get("/who", |ctx: Context| async move {
            let store = ctx.app_store().unwrap();
            let greeting = store.get::<String>("greeting").unwrap();
            let path = ctx.request().unwrap().path().to_owned();
            let _ = ctx.write_string(&format!("{greeting} {path}")).await;
        });
        assert_eq!(serve(&router, "GET", "/who").await.1, b"howdy /who");
    }

    #[tokio::test]
    async fn static_files_serve_and_reject_missing() {
        let dir = std::env::temp_dir().join(format!("switchyard-router-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("app.js"), "console.log(1)").await.unwrap();

        let router = Arc::new(Router::new());
        router.static_files("/assets/", &dir);
        assert_eq!(serve(&router, "GET", "/assets/app.js").await.1, b"console.log(1)");
        assert_eq!(serve(&router, "GET", "/assets/none.js").await.0, StatusCode::NotFound);
        assert_eq!(serve(&router, "GET", "/assets/../secret").await.0, StatusCode::NotFound);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
