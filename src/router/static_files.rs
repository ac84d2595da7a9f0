//! Serving files from a directory under a URL prefix.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::http::StatusCode;
use crate::middleware::{Handler, handler};

/// Maps request paths below `prefix` onto files below `base_dir`.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    prefix: String,
    base_dir: PathBuf,
}

impl StaticFiles {
    pub fn new(prefix: &str, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.to_owned(),
            base_dir: base_dir.into(),
        }
    }

    // Rejects any path that would escape `base_dir`.
    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let rel = url_path.strip_prefix(self.prefix.as_str())?;
        let mut pb = self.base_dir.clone();
        for comp in Path::new(rel.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(s) => pb.push(s),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(pb)
    }

    fn content_type(path: &Path) -> &'static str {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "html" | "htm" => "text/html; charset=utf-8",
            "css" => "text/css; charset=utf-8",
            "js" => "application/javascript",
            "json" => "application/json",
            "txt" => "text/plain; charset=utf-8",
            "svg" => "image/svg+xml",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "ico" => "image/x-icon",
            "wasm" => "application/wasm",
            _ => "application/octet-stream",
        }
    }

    /// Reads the file addressed by `url_path`. Directories resolve to their `index.html`.
    pub async fn load(&self, url_path: &str) -> io::Result<(Vec<u8>, &'static str)> {
        let mut path = self
            .map_path(url_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "invalid path"))?;
        if tokio::fs::metadata(&path).await?.is_dir() {
            path.push("index.html");
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok((bytes, Self::content_type(&path)))
    }

    /// Wraps this file server in a route handler. Missing files answer `404`.
    pub fn into_handler(self) -> Handler {
        let files = Arc::new(self);
        handler(move |ctx: Context| {
            let files = Arc::clone(&files);
            async move {
                let Ok(req) = ctx.request() else {
                    return;
                };
                match files.load(req.path()).await {
                    Ok((bytes, content_type)) => {
                        let Ok(writer) = ctx.response() else {
                            return;
                        };
                        let mut writer = writer.lock().await;
                        writer.headers_mut().set("Content-Type", content_type);
                        if let Err(e) = writer.write(&bytes) {
                            debug!(path = req.path(), error = %e, "static file not written");
                        }
                    }
                    Err(e) => {
                        debug!(path = req.path(), error = %e, "static file unavailable");
                        ctx.status(StatusCode::NotFound).await;
                    }
                }
            }
        })
    }
}
