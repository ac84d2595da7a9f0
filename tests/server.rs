use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use switchyard::realtime::{Conn, SseConfig};
use switchyard::{Context, Router, Server, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

async fn start(router: Arc<Router>) -> (SocketAddr, oneshot::Sender<()>) {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .serve_with_shutdown(router, async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    (addr, stop_tx)
}

async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(out).unwrap()
}

fn app() -> Arc<Router> {
    let router = Arc::new(Router::new());
    router.get("/hello", |ctx: Context| async move {
        let name = ctx.query("name").unwrap_or_else(|| "world".to_owned());
        let _ = ctx.send_string(StatusCode::Ok, &format!("hello {name}")).await;
    });
    router.post("/echo", |ctx: Context| async move {
        let body: serde_json::Value = match ctx.body_parser() {
            Ok(body) => body,
            Err(_) => {
                ctx.status(StatusCode::BadRequest).await;
                return;
            }
        };
        let _ = ctx.json(&body).await;
    });
    router
}

#[tokio::test]
async fn serves_matched_route() {
    let (addr, _stop) = start(app()).await;
    let out = roundtrip(addr, "GET /hello?name=ada HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.contains("Content-Length: 9\r\n"));
    assert!(out.ends_with("\r\n\r\nhello ada"));
}

#[tokio::test]
async fn unknown_path_is_not_found_and_wrong_method_is_not_allowed() {
    let (addr, _stop) = start(app()).await;
    let out = roundtrip(addr, "GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
    assert!(out.ends_with("Not Found"));

    let out = roundtrip(addr, "DELETE /hello HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{out}");
    assert!(out.contains("Content-Length: 0\r\n"));
}

#[tokio::test]
async fn json_body_round_trip() {
    let (addr, _stop) = start(app()).await;
    let body = r#"{"id":"42"}"#;
    let raw = format!(
        "POST /echo HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let out = roundtrip(addr, &raw).await;
    assert!(out.contains("Content-Type: application/json\r\n"), "{out}");
    assert!(out.ends_with("{\"id\":\"42\"}\n"));
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let (addr, _stop) = start(app()).await;
    let out = roundtrip(
        addr,
        "GET /hello?name=a HTTP/1.1\r\n\r\nGET /hello?name=b HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2, "{out}");
    assert!(out.contains("hello a"));
    assert!(out.ends_with("hello b"));
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let (addr, _stop) = start(app()).await;
    let out = roundtrip(addr, "NOT A REQUEST\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
}

#[tokio::test]
async fn event_stream_is_chunked_and_closed_from_another_request() {
    let router = Arc::new(Router::new());
    router.get("/events", |ctx: Context| async move {
        let config = SseConfig::default().id("demo").logging(false);
        let Ok(conn) = Conn::from_context(&ctx, config).await else {
            ctx.status(StatusCode::InternalServerError).await;
            return;
        };
        let Ok(store) = ctx.app_store() else {
            return;
        };
        store.set("sse:demo", conn.clone());
        let _ = conn.event("hello").send_text("first").await;
        conn.done().await;
        store.delete("sse:demo");
    });
    router.post("/close", |ctx: Context| async move {
        let conn = ctx
            .app_store()
            .ok()
            .and_then(|store| store.get::<Conn>("sse:demo"));
        match conn {
            Some(conn) => {
                let _ = conn.close().await;
                ctx.status(StatusCode::NoContent).await;
            }
            None => {
                ctx.status(StatusCode::NotFound).await;
            }
        }
    });
    let (addr, _stop) = start(router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /events HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // Wait for the first event before closing from a second connection.
    let mut seen = Vec::new();
    let mut chunk = [0u8; 1024];
    while !String::from_utf8_lossy(&seen).contains("data: first") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(n, 0, "stream ended early");
        seen.extend_from_slice(&chunk[..n]);
    }

    let out = roundtrip(addr, "POST /close HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"), "{out}");

    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut seen))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(seen).unwrap();
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.contains("Content-Type: text/event-stream\r\n"));
    assert!(text.contains("event: hello\nretry: 3000\ndata: first\n\n"));
    assert!(text.contains("event: close\nretry: 3000\ndata: Server closing connection\n\n"));
    assert!(text.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn client_disconnect_releases_event_stream() {
    let (released_tx, released_rx) = oneshot::channel::<()>();
    let released_tx = Arc::new(parking_lot::Mutex::new(Some(released_tx)));

    let router = Arc::new(Router::new());
    {
        let released_tx = Arc::clone(&released_tx);
        router.get("/events", move |ctx: Context| {
            let released_tx = Arc::clone(&released_tx);
            async move {
                let Ok(conn) = Conn::from_context(&ctx, SseConfig::default().logging(false)).await else {
                    return;
                };
                let _ = conn.send_text("ready").await;
                conn.done().await;
                if let Some(tx) = released_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });
    }
    let (addr, _stop) = start(router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /events HTTP/1.1\r\n\r\n").await.unwrap();
    let mut chunk = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
        .await
        .unwrap()
        .unwrap();
    assert!(n > 0);
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), released_rx)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn huge_declared_length_gets_413() {
    let (addr, _stop) = start(app()).await;
    let out = roundtrip(
        addr,
        "POST /echo HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");
}

#[tokio::test]
async fn head_response_has_no_body_and_keeps_connection_framed() {
    let router = Arc::new(Router::new());
    router.any("/a", |ctx: Context| async move {
        let _ = ctx.write_string("BODYBYTES").await;
    });
    let (addr, _stop) = start(router).await;

    let out = roundtrip(
        addr,
        "HEAD /a HTTP/1.1\r\n\r\nGET /a HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{out}");
    assert_eq!(out.matches("Content-Length: 9\r\n").count(), 2);
    assert_eq!(out.matches("BODYBYTES").count(), 1);
    assert!(out.ends_with("\r\n\r\nBODYBYTES"));
}
