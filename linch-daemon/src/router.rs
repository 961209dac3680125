// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Path-based request dispatch.
//!
//! Patterns are compiled at registration into a slice of segment matchers;
//! `{name}` captures exactly one path segment. Matching is O(segments) per
//! route, the table is immutable once the server starts, and exact routes
//! take precedence over parameterized ones. Registrations that would leave
//! two routes racing for the same path are rejected at startup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::bail;
use linch_ipc::protocol::{IpcErrorCode, IpcRequest, IpcResponse};
use serde_json::json;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<IpcResponse>> + Send>>;
pub type Handler = Arc<dyn Fn(IpcRequest) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Clone, Debug)]
pub struct RoutePattern {
    method: String,
    pattern: String,
    segments: Vec<Segment>,
    param_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RouteConflict {
    Duplicate,
    Ambiguous,
}

impl RoutePattern {
    fn compile(method: &str, pattern: &str) -> anyhow::Result<Self> {
        if !pattern.starts_with('/') {
            bail!("route pattern must start with '/': {pattern:?}");
        }
        let mut segments = Vec::new();
        let mut param_count = 0;
        for part in pattern.split('/').skip(1) {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() {
                    bail!("empty parameter name in route pattern {pattern:?}");
                }
                segments.push(Segment::Param(name.to_string()));
                param_count += 1;
            } else if part.contains('{') || part.contains('}') {
                bail!("parameters must span a whole segment in route pattern {pattern:?}");
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(RoutePattern {
            method: method.to_string(),
            pattern: pattern.to_string(),
            segments,
            param_count,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, method: &str, path: &str) -> Option<HashMap<String, String>> {
        if method != self.method {
            return None;
        }
        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }

    /// Two compatible patterns conflict unless one's parameter positions
    /// are a subset of the other's; the subset relation is exactly what the
    /// exact-over-parameter precedence can order.
    fn conflict_with(&self, other: &RoutePattern) -> Option<RouteConflict> {
        if self.method != other.method || self.segments.len() != other.segments.len() {
            return None;
        }
        let mut params_a = Vec::new();
        let mut params_b = Vec::new();
        for (i, (a, b)) in self.segments.iter().zip(&other.segments).enumerate() {
            match (a, b) {
                (Segment::Literal(la), Segment::Literal(lb)) => {
                    if la != lb {
                        return None;
                    }
                }
                (Segment::Param(_), Segment::Param(_)) => {
                    params_a.push(i);
                    params_b.push(i);
                }
                (Segment::Param(_), Segment::Literal(_)) => params_a.push(i),
                (Segment::Literal(_), Segment::Param(_)) => params_b.push(i),
            }
        }
        if params_a == params_b {
            return Some(RouteConflict::Duplicate);
        }
        let subset = |small: &[usize], big: &[usize]| small.iter().all(|i| big.contains(i));
        if subset(&params_a, &params_b) || subset(&params_b, &params_a) {
            None
        } else {
            Some(RouteConflict::Ambiguous)
        }
    }
}

struct Route {
    pattern: RoutePattern,
    handler: Handler,
}

/// Routes registered under an optional path prefix. Routers nest through
/// [`Router::include`], concatenating prefixes.
#[derive(Default)]
pub struct Router {
    prefix: String,
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Router {
            prefix: prefix.trim_end_matches('/').to_string(),
            routes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn route(&mut self, method: &str, path: &str, handler: Handler) -> anyhow::Result<()> {
        let full = format!("{}{}", self.prefix, path);
        self.add(method, &full, handler)
    }

    fn add(&mut self, method: &str, full_path: &str, handler: Handler) -> anyhow::Result<()> {
        let pattern = RoutePattern::compile(method, full_path)?;
        for existing in &self.routes {
            match pattern.conflict_with(&existing.pattern) {
                Some(RouteConflict::Duplicate) => bail!(
                    "route {} {} is already registered as {}",
                    method,
                    full_path,
                    existing.pattern.pattern
                ),
                Some(RouteConflict::Ambiguous) => bail!(
                    "route {} {} is ambiguous with {}",
                    method,
                    full_path,
                    existing.pattern.pattern
                ),
                None => {}
            }
        }
        self.routes.push(Route { pattern, handler });
        // Exact matches win: fewer parameters sort first, stable within ties.
        self.routes.sort_by_key(|r| r.pattern.param_count);
        Ok(())
    }

    pub fn get<F, Fut>(&mut self, path: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<IpcResponse>> + Send + 'static,
    {
        self.route("GET", path, wrap(handler))
    }

    pub fn post<F, Fut>(&mut self, path: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<IpcResponse>> + Send + 'static,
    {
        self.route("POST", path, wrap(handler))
    }

    pub fn put<F, Fut>(&mut self, path: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<IpcResponse>> + Send + 'static,
    {
        self.route("PUT", path, wrap(handler))
    }

    pub fn delete<F, Fut>(&mut self, path: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<IpcResponse>> + Send + 'static,
    {
        self.route("DELETE", path, wrap(handler))
    }

    pub fn patch<F, Fut>(&mut self, path: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<IpcResponse>> + Send + 'static,
    {
        self.route("PATCH", path, wrap(handler))
    }

    /// Mounts every route of `other` under this router's prefix.
    pub fn include(&mut self, other: Router) -> anyhow::Result<()> {
        for route in other.routes {
            let full = format!("{}{}", self.prefix, route.pattern.pattern);
            self.add(&route.pattern.method, &full, route.handler)?;
        }
        Ok(())
    }

    fn find(&self, method: &str, path: &str) -> Option<(&Route, HashMap<String, String>)> {
        self.routes
            .iter()
            .find_map(|route| route.pattern.matches(method, path).map(|params| (route, params)))
    }

    /// Dispatches one request to the first matching route; a miss yields a
    /// well-formed `RESOURCE_NOT_FOUND` response rather than an error.
    pub async fn dispatch(&self, mut request: IpcRequest) -> anyhow::Result<IpcResponse> {
        match self.find(&request.method, &request.path) {
            Some((route, params)) => {
                request.path_params = params;
                (route.handler)(request).await
            }
            None => Ok(IpcResponse::error(
                IpcErrorCode::ResourceNotFound,
                format!("Route not found: {} {}", request.method, request.path),
                Some(json!({ "method": request.method, "path": request.path })),
                request.request_id.clone(),
            )),
        }
    }
}

fn wrap<F, Fut>(handler: F) -> Handler
where
    F: Fn(IpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<IpcResponse>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(handler(request)) as HandlerFuture)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(tag: &'static str) -> impl Fn(IpcRequest) -> HandlerFuture + Send + Sync {
        move |request| {
            Box::pin(async move {
                Ok(IpcResponse::success(
                    json!({ "tag": tag, "params": request.path_params }),
                    request.request_id,
                ))
            }) as HandlerFuture
        }
    }

    fn req(method: &str, path: &str) -> IpcRequest {
        IpcRequest::new(method, path)
    }

    #[tokio::test]
    async fn literal_routes_match_exactly() {
        let mut router = Router::new();
        router.get("/health", |r| async move {
            Ok(IpcResponse::success(json!({"status": "healthy"}), r.request_id))
        })
        .unwrap();

        let resp = router.dispatch(req("GET", "/health")).await.unwrap();
        assert!(resp.success);

        let resp = router.dispatch(req("POST", "/health")).await.unwrap();
        assert_eq!(resp.error_code(), Some("RESOURCE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn parameters_capture_single_segments() {
        let mut router = Router::new();
        router
            .route("GET", "/connectors/{id}/status", Arc::new(ok_handler("status")))
            .unwrap();

        let resp = router
            .dispatch(req("GET", "/connectors/clipboard/status"))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["params"]["id"], json!("clipboard"));

        // A parameter never spans a slash.
        let resp = router
            .dispatch(req("GET", "/connectors/a/b/status"))
            .await
            .unwrap();
        assert_eq!(resp.error_code(), Some("RESOURCE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn exact_routes_take_precedence_over_parameters() {
        let mut router = Router::new();
        router
            .route("GET", "/users/{id}", Arc::new(ok_handler("param")))
            .unwrap();
        router
            .route("GET", "/users/me", Arc::new(ok_handler("exact")))
            .unwrap();

        let resp = router.dispatch(req("GET", "/users/me")).await.unwrap();
        assert_eq!(resp.data.unwrap()["tag"], json!("exact"));

        let resp = router.dispatch(req("GET", "/users/42")).await.unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["tag"], json!("param"));
        assert_eq!(data["params"]["id"], json!("42"));
    }

    #[test]
    fn ambiguous_registrations_are_rejected() {
        let mut router = Router::new();
        router
            .route("GET", "/a/{x}/c", Arc::new(ok_handler("first")))
            .unwrap();
        assert!(router
            .route("GET", "/a/b/{y}", Arc::new(ok_handler("second")))
            .is_err());
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let mut router = Router::new();
        router
            .route("GET", "/items/{id}", Arc::new(ok_handler("first")))
            .unwrap();
        assert!(router
            .route("GET", "/items/{other}", Arc::new(ok_handler("second")))
            .is_err());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        let mut router = Router::new();
        assert!(router.route("GET", "no-slash", Arc::new(ok_handler("x"))).is_err());
        assert!(router.route("GET", "/a/{", Arc::new(ok_handler("x"))).is_err());
        assert!(router.route("GET", "/a/{}", Arc::new(ok_handler("x"))).is_err());
    }

    #[tokio::test]
    async fn nested_prefixes_concatenate() {
        let mut leaf = Router::with_prefix("/status");
        leaf.route("GET", "/{id}", Arc::new(ok_handler("leaf"))).unwrap();

        let mut middle = Router::with_prefix("/connectors");
        middle.include(leaf).unwrap();

        let mut root = Router::new();
        root.include(middle).unwrap();

        let resp = root
            .dispatch(req("GET", "/connectors/status/7"))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["params"]["id"], json!("7"));
    }

    #[tokio::test]
    async fn router_miss_reports_method_and_path() {
        let router = Router::new();
        let resp = router.dispatch(req("GET", "/nope")).await.unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, "RESOURCE_NOT_FOUND");
        assert_eq!(error.details.unwrap(), json!({"method": "GET", "path": "/nope"}));
    }
}
