//! Event stream demo.
//!
//! ```text
//! cargo run --example sse_demo
//! curl -N http://127.0.0.1:8089/sse                      # prints the connection id
//! curl -X POST -d '{"id":"<id>"}' http://127.0.0.1:8089/getsse
//! curl -X POST -d '{"id":"<id>"}' http://127.0.0.1:8089/deletesse
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::json;
use switchyard::middleware::{LoggerMiddleware, from_middleware};
use switchyard::realtime::{Conn, SseConfig};
use switchyard::security::CorsMiddleware;
use switchyard::{Context, Router, Server, StatusCode};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct Target {
    id: String,
}

async fn fail(ctx: &Context, code: StatusCode, message: &str) {
    ctx.status(code).await;
    let _ = ctx.json(&json!({ "error": message })).await;
}

// Looks up the stream named in the request body.
async fn target_conn(ctx: &Context) -> Option<Conn> {
    let Ok(target) = ctx.body_parser::<Target>() else {
        ctx.status(StatusCode::BadRequest).await;
        return None;
    };
    let store = match ctx.app_store() {
        Ok(store) => store,
        Err(e) => {
            fail(ctx, StatusCode::InternalServerError, &e.to_string()).await;
            return None;
        }
    };
    match store.get::<Conn>(format!("sse:{}", target.id)) {
        Some(conn) => Some(Conn::clone(&conn)),
        None => {
            let message = format!("no connection found with ID {}", target.id);
            fail(ctx, StatusCode::InternalServerError, &message).await;
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let router = Arc::new(Router::new());
    router.use_handler(from_middleware(Arc::new(LoggerMiddleware)));
    router.use_handler(from_middleware(Arc::new(
        CorsMiddleware::new().allow_credentials(true),
    )));

    router.get("/", |ctx: Context| async move {
        let _ = ctx.write_string("Hello, World!").await;
    });

    router.get("/sse", |ctx: Context| async move {
        let conn = match Conn::from_context(&ctx, SseConfig::default()).await {
            Ok(conn) => conn,
            Err(e) => return fail(&ctx, StatusCode::InternalServerError, &e.to_string()).await,
        };
        let store = match ctx.app_store() {
            Ok(store) => store,
            Err(e) => return fail(&ctx, StatusCode::InternalServerError, &e.to_string()).await,
        };
        let key = format!("sse:{}", conn.id());
        store.set(key.as_str(), conn.clone());

        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                () = conn.done() => break,
                _ = ticker.tick() => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or_default();
                    if conn.send_json(&json!({ "id": conn.id(), "time": now })).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(id = conn.id(), "stream finished");
        store.delete(key.as_str());
    });

    router.post("/getsse", |ctx: Context| async move {
        if let Some(conn) = target_conn(&ctx).await {
            if let Err(e) = conn.event("myEventType").send_text("Get test ok").await {
                fail(&ctx, StatusCode::Gone, &e.to_string()).await;
            }
        }
    });

    router.post("/deletesse", |ctx: Context| async move {
        if let Some(conn) = target_conn(&ctx).await {
            let _ = conn.close().await;
        }
    });

    let server = Server::bind("127.0.0.1:8089").await?;
    server
        .serve_with_shutdown(router, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
