//! Status hooks: handlers run whenever a given status code is written.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::http::StatusCode;
use crate::middleware::Handler;

/// Table mapping a status code to the handler run when that code is written.
#[derive(Default)]
pub struct StatusHooks {
    hooks: RwLock<HashMap<StatusCode, Handler>>,
}

impl StatusHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `hook` for `code`, replacing any previous hook.
    pub fn set(&self, code: StatusCode, hook: Handler) {
        self.hooks.write().insert(code, hook);
    }

    /// Returns the hook for `code`, if one is installed.
    pub fn get(&self, code: StatusCode) -> Option<Handler> {
        self.hooks.read().get(&code).cloned()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Runs the hook for `code`, or the built-in response when none is installed.
    pub async fn run(&self, code: StatusCode, ctx: &Context) {
        // Clone out of the lock so the hook can register further hooks.
        match self.get(code) {
            Some(hook) => {
                debug!(status = code.as_u16(), "running status hook");
                hook(ctx.clone()).await;
            }
            None => default_response(code, ctx).await,
        }
    }
}

/// Built-in behaviour for codes without a hook.
///
/// `404` writes its reason phrase as the body; every other code leaves the
/// response status-only.
pub async fn default_response(code: StatusCode, ctx: &Context) {
    if code != StatusCode::NotFound {
        return;
    }
    if let Err(e) = ctx.write_string(code.canonical_reason()).await {
        debug!(status = code.as_u16(), error = %e, "default status body not written");
    }
}
