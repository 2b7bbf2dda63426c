use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::rate_limit::RateLimiter;
use crate::model::{Method, Request, Response};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;
pub type Middleware = Arc<dyn Fn(Request, Next) -> MiddlewareFuture + Send + Sync>;

/// Wrap an async fn into a boxed route handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Wrap an async fn into a boxed middleware.
pub fn middleware<F, Fut>(f: F) -> Middleware
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |request, next| Box::pin(f(request, next)))
}

/// Continuation handed to each middleware. Holds an index into the combined
/// chain rather than nesting closures, so an arbitrarily long chain cannot
/// blow the stack. The terminal link is the route handler itself.
pub struct Next {
    chain: Arc<Vec<Middleware>>,
    handler: Handler,
    index: usize,
}

impl Next {
    pub fn run(mut self, request: Request) -> MiddlewareFuture {
        Box::pin(async move {
            if self.index < self.chain.len() {
                let current = self.chain[self.index].clone();
                self.index += 1;
                current(request, self).await
            } else {
                let value = (self.handler)(request).await?;
                Ok(match Response::from_envelope(&value) {
                    Some(response) => response,
                    None => Response::ok(value),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| match part.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(part.to_string()),
        })
        .collect()
}

struct Route {
    segments: Vec<Segment>,
    handler: Handler,
    middleware: Vec<Middleware>,
}

/// Maps (method, path) to a handler plus an ordered middleware chain and
/// normalizes every outcome into a response envelope. `handle` never fails:
/// routing errors, rate limiting, and handler errors all come back as
/// status-coded envelopes.
pub struct Router {
    routes: HashMap<(Method, String), Route>,
    global_middleware: Vec<Middleware>,
    rate_limiter: Option<RateLimiter>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            global_middleware: Vec::new(),
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Register a route. Re-registering the same (method, pattern) silently
    /// replaces the prior entry: last write wins.
    pub fn register(&mut self, method: Method, pattern: &str, handler: Handler) {
        self.register_with_middleware(method, pattern, handler, Vec::new());
    }

    pub fn register_with_middleware(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: Vec<Middleware>,
    ) {
        let route = Route {
            segments: parse_pattern(pattern),
            handler,
            middleware,
        };
        if self
            .routes
            .insert((method, pattern.to_string()), route)
            .is_some()
        {
            log::debug!("route {} {} replaced", method, pattern);
        }
    }

    /// Append a global middleware. Global middleware runs before any
    /// route-specific middleware, in registration order, for every request.
    pub fn use_middleware(&mut self, middleware: Middleware) {
        self.global_middleware.push(middleware);
    }

    /// Drop every route and middleware registration.
    pub fn reset(&mut self) {
        self.routes.clear();
        self.global_middleware.clear();
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub async fn handle(&self, mut request: Request) -> Response {
        if let Some(limiter) = &self.rate_limiter {
            let caller = request.header("x-forwarded-for").unwrap_or("anonymous");
            if !limiter.allow(caller) {
                return Response::error(429, ApiError::RateLimited.to_string())
                    .with_header("retry-after", limiter.retry_after_secs().to_string());
            }
        }

        let Some((route, params)) = self.match_route(request.method, &request.path) else {
            // a method mismatch on an existing path is reported the same way
            return Response::error(
                404,
                format!("no route for {} {}", request.method, request.path),
            );
        };
        request.params = params;

        let mut chain =
            Vec::with_capacity(self.global_middleware.len() + route.middleware.len());
        chain.extend(self.global_middleware.iter().cloned());
        chain.extend(route.middleware.iter().cloned());
        let next = Next {
            chain: Arc::new(chain),
            handler: route.handler.clone(),
            index: 0,
        };

        match next.run(request).await {
            Ok(response) => response,
            Err(err) => match err.downcast::<ApiError>() {
                Ok(api_err) => Response::error(api_err.status(), api_err.to_string()),
                Err(other) => {
                    log::error!("handler error: {:#}", other);
                    Response::error(500, "internal server error")
                }
            },
        }
    }

    fn match_route(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(&Route, HashMap<String, String>)> {
        // exact lookup first, pattern matching as the fallback
        if let Some(route) = self.routes.get(&(method, path.to_string())) {
            return Some((route, HashMap::new()));
        }

        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        for ((route_method, _), route) in &self.routes {
            if *route_method != method || route.segments.len() != parts.len() {
                continue;
            }
            if let Some(params) = match_segments(&route.segments, &parts) {
                return Some((route, params));
            }
        }
        None
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// A capture segment matches any single non-empty path segment; counts must
/// already agree before this is called.
fn match_segments(pattern: &[Segment], parts: &[&str]) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    for (segment, part) in pattern.iter().zip(parts) {
        match segment {
            Segment::Literal(literal) if literal == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), (*part).to_string());
            }
        }
    }
    Some(params)
}
