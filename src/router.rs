//! Path router with `<name>` segment wildcards
//!
//! Routes are kept in registration order and the first full match wins, so
//! with `/a/<x>` registered before `/<x>/b` the path `/a/b` goes to the first.

use crate::protocol::{Method, Request, Response};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Variables bound by `<name>` segments
pub type PathParams = HashMap<String, String>;

/// Handler attached to a route.
///
/// Implemented for any `Fn(Request, PathParams) -> impl Future<Output =
/// anyhow::Result<Response>>`, so plain async closures can be registered.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn call(&self, request: Request, params: PathParams) -> anyhow::Result<Response>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(Request, PathParams) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    async fn call(&self, request: Request, params: PathParams) -> anyhow::Result<Response> {
        (self)(request, params).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Parsed route pattern such as `/users/<user>/comment/<comment>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = split_path(pattern)
            .map(|part| {
                match part.strip_prefix('<').and_then(|p| p.strip_suffix('>')) {
                    Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                    _ => Segment::Literal(part.to_string()),
                }
            })
            .collect();

        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a request path, returning the bound variables.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let parts: Vec<&str> = split_path(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

struct RouteEntry {
    method: Method,
    pattern: PathPattern,
    handler: Arc<dyn RouteHandler>,
}

/// Result of a successful lookup
#[derive(Clone)]
pub struct RouteMatch {
    pub pattern: String,
    pub params: PathParams,
    pub handler: Arc<dyn RouteHandler>,
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Ordered route registry
#[derive(Default)]
pub struct Router {
    routes: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `pattern` under each of `methods`
    /// (`GET` when empty).
    pub fn route<F, Fut>(&mut self, pattern: &str, methods: &[Method], handler: F) -> &mut Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        self.route_handler(pattern, methods, handler)
    }

    /// Register a [`RouteHandler`]. Registering an existing `(method,
    /// pattern)` pair swaps the handler but keeps the route's original
    /// position.
    pub fn route_handler<H>(&mut self, pattern: &str, methods: &[Method], handler: H) -> &mut Self
    where
        H: RouteHandler + 'static,
    {
        let handler: Arc<dyn RouteHandler> = Arc::new(handler);
        let methods = if methods.is_empty() {
            &[Method::Get][..]
        } else {
            methods
        };

        for &method in methods {
            let existing = self
                .routes
                .iter_mut()
                .find(|r| r.method == method && r.pattern.as_str() == pattern);

            match existing {
                Some(entry) => {
                    log::debug!("Replacing handler for {} {}", method, pattern);
                    entry.handler = Arc::clone(&handler);
                }
                None => self.routes.push(RouteEntry {
                    method,
                    pattern: PathPattern::parse(pattern),
                    handler: Arc::clone(&handler),
                }),
            }
        }
        self
    }

    /// First route registered for `method` whose pattern matches `path`.
    pub fn match_route(&self, path: &str, method: Method) -> Option<RouteMatch> {
        self.routes
            .iter()
            .filter(|r| r.method == method)
            .find_map(|r| {
                r.pattern.matches(path).map(|params| RouteMatch {
                    pattern: r.pattern.as_str().to_string(),
                    params,
                    handler: Arc::clone(&r.handler),
                })
            })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
