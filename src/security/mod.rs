//! Security middleware.
//!
//! - [`CorsMiddleware`]: Cross-Origin Resource Sharing header injection and
//!   preflight (`OPTIONS`) short-circuiting.

mod middleware;

pub use middleware::CorsMiddleware;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::CancellationToken;
    use crate::http::{ResponseWriter, SharedWriter};
    use crate::middleware::from_middleware;
    use crate::{Context, Request, Router, StatusCode};

    async fn run(router: &Arc<Router>, raw: &str) -> SharedWriter {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        let writer = ResponseWriter::buffered().into_shared();
        router.dispatch(req, writer.clone(), CancellationToken::new()).await;
        writer
    }

    fn app(cors: CorsMiddleware) -> Arc<Router> {
        let router = Arc::new(Router::new());
        router.use_handler(from_middleware(Arc::new(cors)));
        router.any("/test", |ctx: Context| async move {
            let _ = ctx.write_string("handled").await;
        });
        router
    }

    #[tokio::test]
    async fn wildcard_applies_without_origin_header() {
        let router = app(CorsMiddleware::new());
        let writer = run(&router, "GET /test HTTP/1.1\r\n\r\n").await;
        let w = writer.lock().await;
        assert_eq!(w.status(), StatusCode::Ok);
        assert_eq!(w.headers().get("access-control-allow-origin"), Some("*"));
        assert_eq!(w.headers().get("access-control-max-age"), Some("86400"));
        assert!(w.headers().get("vary").is_none());
        assert!(w.headers().get("access-control-allow-credentials").is_none());
        assert_eq!(w.body(), b"handled");
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_no_content() {
        let router = app(CorsMiddleware::new());
        let writer = run(
            &router,
            "OPTIONS /test HTTP/1.1\r\nOrigin: https://a.example\r\n\r\n",
        )
        .await;
        let w = writer.lock().await;
        assert_eq!(w.status(), StatusCode::NoContent);
        assert!(w.body().is_empty());
        assert_eq!(
            w.headers().get("access-control-allow-methods"),
            Some("GET, POST, PUT, DELETE, OPTIONS")
        );
    }

    #[tokio::test]
    async fn specific_origin_is_echoed() {
        let router = app(
            CorsMiddleware::new()
                .allow_origin("https://a.example")
                .allow_credentials(true)
                .expose_header("X-Total"),
        );
        let writer = run(&router, "GET /test HTTP/1.1\r\nOrigin: https://a.example\r\n\r\n").await;
        let w = writer.lock().await;
        assert_eq!(w.headers().get("access-control-allow-origin"), Some("https://a.example"));
        assert_eq!(w.headers().get("vary"), Some("Origin"));
        assert_eq!(w.headers().get("access-control-allow-credentials"), Some("true"));
        assert_eq!(w.headers().get("access-control-expose-headers"), Some("X-Total"));
    }

    #[tokio::test]
    async fn unlisted_origin_passes_through_untouched() {
        let router = app(CorsMiddleware::new().allow_origin("https://a.example"));
        let writer = run(&router, "OPTIONS /test HTTP/1.1\r\nOrigin: https://evil.example\r\n\r\n").await;
        let w = writer.lock().await;
        assert!(w.headers().get("access-control-allow-origin").is_none());
        // Not a CORS preflight, so the route handler runs.
        assert_eq!(w.body(), b"handled");
    }
}
