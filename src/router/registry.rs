//! Concurrency-safe route table.
//!
//! Maps a [`Pattern`] to a [`RouteRecord`] of `{method → handler chain}`. The
//! table is guarded by a single read/write lock: registration takes it
//! exclusively for the whole mutation, lookups share it.
//!
//! ## Match precedence
//!
//! Patterns are visited in a fixed total order:
//!
//! 1. exact patterns, in registration order;
//! 2. wildcard patterns, longest prefix first, ties in registration order.
//!
//! The first pattern that matches the request path decides the outcome, even
//! when it has no chain for the request method.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::Method;
use crate::middleware::Handler;

/// Why a request could not be resolved to a handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no registered pattern matches the request path")]
    NoMatch,

    #[error("the matching pattern has no handlers for the request method")]
    MethodDisallowed,
}

/// A registered path template.
///
/// | Pattern      | Example match            |
/// |--------------|--------------------------|
/// | `/users`     | `/users` only            |
/// | `/static/*`  | `/static/`, `/static/x/y` |
///
/// Paths are compared literally; there are no named parameters and no
/// trailing-slash normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Matches one exact path string.
    Exact(String),
    /// Matches any path starting with the prefix (the pattern minus its trailing `*`).
    Wildcard(String),
}

impl Pattern {
    /// Parse a route pattern string. A trailing `*` makes it a prefix match.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Pattern::Wildcard(prefix.to_owned()),
            None => Pattern::Exact(pattern.to_owned()),
        }
    }

    /// Returns `true` if `path` is matched by this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Wildcard(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    // Sort key: exact patterns first, then wildcards by descending prefix length.
    fn rank(&self) -> (u8, std::cmp::Reverse<usize>) {
        match self {
            Pattern::Exact(_) => (0, std::cmp::Reverse(0)),
            Pattern::Wildcard(prefix) => (1, std::cmp::Reverse(prefix.len())),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(p) => f.write_str(p),
            Pattern::Wildcard(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Per-pattern record: one ordered handler chain per method.
#[derive(Default, Clone)]
pub struct RouteRecord {
    methods: HashMap<Method, Arc<[Handler]>>,
}

impl RouteRecord {
    /// Returns the chain registered for `method`, if any.
    pub fn method_exists(&self, method: &Method) -> Option<Arc<[Handler]>> {
        self.methods.get(method).cloned()
    }

    /// Returns the methods with a registered chain.
    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.keys()
    }
}

impl fmt::Debug for RouteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.methods.iter().map(|(m, chain)| (m.as_str(), chain.len())))
            .finish()
    }
}

struct Entry {
    pattern: Pattern,
    record: RouteRecord,
}

/// Route table shared by every request served by a router.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<Vec<Entry>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handlers` for the exact `(pattern, method)` pair, replacing any
    /// previous chain for that pair.
    pub fn add(&self, pattern: &str, method: Method, handlers: Vec<Handler>) {
        let pattern = Pattern::parse(pattern);
        let chain: Arc<[Handler]> = Arc::from(handlers);
        let mut entries = self.entries.write();

        if let Some(entry) = entries.iter_mut().find(|e| e.pattern == pattern) {
            entry.record.methods.insert(method, chain);
            return;
        }

        let rank = pattern.rank();
        let at = entries.partition_point(|e| e.pattern.rank() <= rank);
        let mut record = RouteRecord::default();
        record.methods.insert(method, chain);
        entries.insert(at, Entry { pattern, record });
    }

    /// Visits every `(pattern, record)` pair in match-precedence order under
    /// shared access. The visitor stops the walk by returning `ControlFlow::Break`.
    pub fn visit<B>(&self, mut f: impl FnMut(&Pattern, &RouteRecord) -> ControlFlow<B>) -> Option<B> {
        let entries = self.entries.read();
        for entry in entries.iter() {
            if let ControlFlow::Break(b) = f(&entry.pattern, &entry.record) {
                return Some(b);
            }
        }
        None
    }

    /// Resolves the route chain for a request.
    ///
    /// The first pattern matching `path` decides: its chain for `method`, or
    /// [`RouteError::MethodDisallowed`] if it has none. An empty table, or one
    /// where nothing matches, yields [`RouteError::NoMatch`].
    pub fn resolve(&self, path: &str, method: &Method) -> Result<Arc<[Handler]>, RouteError> {
        self.visit(|pattern, record| {
            if pattern.matches(path) {
                ControlFlow::Break(record.method_exists(method).ok_or(RouteError::MethodDisallowed))
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap_or(Err(RouteError::NoMatch))
    }

    /// Returns the registered patterns in match-precedence order.
    pub fn patterns(&self) -> Vec<Pattern> {
        self.entries.read().iter().map(|e| e.pattern.clone()).collect()
    }

    /// Returns the number of registered patterns.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no pattern has been registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
