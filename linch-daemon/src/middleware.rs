// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The middleware pipeline wrapping the router.
//!
//! Middlewares compose as an ordered slice; `Next` recurses by index into
//! the slice and bottoms out at the router, so there are no closure cycles
//! to build at startup. Any layer may short-circuit with a response, and
//! layers above it still observe that response.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use linch_ipc::protocol::{IpcErrorCode, IpcRequest, IpcResponse};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::router::Router;
use crate::routes::auth::HANDSHAKE_PATH;
use crate::security::firewall::ALLOWED_METHODS;
use crate::security::{RequestRejection, SecurityContext, SecurityManager};

/// Connection-scoped state threaded through the pipeline. Handlers never
/// see it; middlewares legitimately touch per-connection security state.
pub struct RequestContext {
    pub context: Arc<SecurityContext>,
    pub security: Arc<SecurityManager>,
}

pub type MiddlewareFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<IpcResponse>> + Send + 'a>>;

pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: IpcRequest,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a>;
}

/// The remainder of the pipeline below the current layer.
pub struct Next<'a> {
    stack: &'a [Arc<dyn Middleware>],
    router: &'a Router,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: &'a RequestContext, request: IpcRequest) -> MiddlewareFuture<'a> {
        match self.stack.split_first() {
            Some((middleware, rest)) => middleware.handle(
                ctx,
                request,
                Next {
                    stack: rest,
                    router: self.router,
                },
            ),
            None => Box::pin(self.router.dispatch(request)),
        }
    }
}

/// The router plus its middleware stack; one per server, immutable after
/// startup.
pub struct IpcApplication {
    middlewares: Vec<Arc<dyn Middleware>>,
    router: Router,
}

impl IpcApplication {
    pub fn new(router: Router, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        IpcApplication {
            middlewares,
            router,
        }
    }

    /// Runs one request through the full pipeline. Always produces a
    /// well-formed response; an error escaping the outermost layer is the
    /// backstop case.
    pub async fn handle(&self, ctx: &RequestContext, request: IpcRequest) -> IpcResponse {
        let request_id = request.request_id.clone();
        let next = Next {
            stack: &self.middlewares,
            router: &self.router,
        };
        match next.run(ctx, request).await {
            Ok(response) => response,
            Err(err) => {
                error!("IPC pipeline error escaped the error translator: {err:#}");
                IpcResponse::error(
                    IpcErrorCode::InternalError,
                    "Internal server error",
                    None,
                    request_id,
                )
            }
        }
    }
}

/// Outermost layer: maps handler errors and panics to well-formed
/// `INTERNAL_ERROR` responses. Detail strings only leak in debug mode.
pub struct ErrorTranslator {
    debug: bool,
}

impl ErrorTranslator {
    pub fn new(debug: bool) -> Self {
        ErrorTranslator { debug }
    }
}

impl Middleware for ErrorTranslator {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: IpcRequest,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        let request_id = request.request_id.clone();
        Box::pin(async move {
            match AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => {
                    error!("IPC handler error: {err:#}");
                    let details = self
                        .debug
                        .then(|| json!({ "detail": format!("{err:#}") }));
                    Ok(IpcResponse::error(
                        IpcErrorCode::InternalError,
                        "Internal server error",
                        details,
                        request_id,
                    ))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("IPC handler panicked: {message}");
                    let details = self.debug.then(|| json!({ "detail": message }));
                    Ok(IpcResponse::error(
                        IpcErrorCode::InternalError,
                        "Internal server error",
                        details,
                        request_id,
                    ))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Shape checks on the decoded request: payload size (the framer already
/// bounded the frame, this bounds the decoded `data` field), method
/// allow-list, path form.
pub struct RequestValidator {
    max_payload_bytes: usize,
}

impl RequestValidator {
    pub fn new(max_payload_bytes: usize) -> Self {
        RequestValidator { max_payload_bytes }
    }
}

impl Middleware for RequestValidator {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: IpcRequest,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        let request_id = request.request_id.clone();
        let size = request.data_len();
        if size > self.max_payload_bytes {
            let response = IpcResponse::error(
                IpcErrorCode::InvalidRequest,
                "Payload too large",
                Some(json!({ "max_size": self.max_payload_bytes, "actual_size": size })),
                request_id,
            );
            return Box::pin(async move { Ok(response) });
        }
        if !ALLOWED_METHODS.contains(&request.method.as_str()) {
            let response = IpcResponse::error(
                IpcErrorCode::InvalidRequest,
                format!("Method {} not allowed", request.method),
                Some(json!({ "allowed_methods": ALLOWED_METHODS })),
                request_id,
            );
            return Box::pin(async move { Ok(response) });
        }
        if !request.path.starts_with('/') {
            let response = IpcResponse::error(
                IpcErrorCode::InvalidRequest,
                "Invalid path format",
                Some(json!({ "path": request.path })),
                request_id,
            );
            return Box::pin(async move { Ok(response) });
        }
        next.run(ctx, request)
    }
}

/// Rejects anything on a non-authenticated connection except the handshake
/// itself. The connection stays open; the client may retry.
pub struct AuthEnforcer {
    require_authentication: bool,
}

impl AuthEnforcer {
    pub fn new(require_authentication: bool) -> Self {
        AuthEnforcer {
            require_authentication,
        }
    }
}

impl Middleware for AuthEnforcer {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: IpcRequest,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        if !self.require_authentication
            || ctx.context.is_authenticated()
            || request.path == HANDSHAKE_PATH
        {
            return next.run(ctx, request);
        }
        ctx.security
            .record_auth_required(&ctx.context, &request.method, &request.path);
        let response = IpcResponse::error(
            IpcErrorCode::AuthRequired,
            "Authentication required",
            None,
            request.request_id,
        );
        Box::pin(async move { Ok(response) })
    }
}

/// The per-request firewall and per-PID rate-limit gate. The handshake is
/// exempt: it is the one request a client must always be able to make.
pub struct RateLimit;

impl Middleware for RateLimit {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: IpcRequest,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        if request.path == HANDSHAKE_PATH {
            return next.run(ctx, request);
        }
        match ctx
            .security
            .validate_request(&ctx.context, &request.method, &request.path)
        {
            Ok(()) => next.run(ctx, request),
            Err(RequestRejection::RateLimited) => {
                let response = IpcResponse::error(
                    IpcErrorCode::RateLimited,
                    "Too many requests - rate limited",
                    None,
                    request.request_id,
                );
                Box::pin(async move { Ok(response) })
            }
            Err(rejection) => {
                let message = match rejection {
                    RequestRejection::MethodBlocked => "Method not allowed by firewall",
                    RequestRejection::SensitiveBlocked => {
                        "Path is restricted outside development mode"
                    }
                    _ => "Path is blocked",
                };
                let response = IpcResponse::error(
                    IpcErrorCode::InsufficientPermissions,
                    message,
                    Some(json!({ "method": request.method, "path": request.path })),
                    request.request_id,
                );
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// Innermost layer: one line per admitted request with size, outcome and
/// duration.
pub struct AccessLogger;

impl Middleware for AccessLogger {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: IpcRequest,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        let method = request.method.clone();
        let path = request.path.clone();
        let size_in = request.data_len();
        Box::pin(async move {
            let start = Instant::now();
            let result = next.run(ctx, request).await;
            let duration = start.elapsed().as_secs_f64();
            match &result {
                Ok(response) if response.success => info!(
                    "IPC request: {} {} - {} bytes in - ok - {:.3}s",
                    method, path, size_in, duration
                ),
                Ok(response) => warn!(
                    "IPC request: {} {} - {} bytes in - {} - {:.3}s",
                    method,
                    path,
                    size_in,
                    response.error_code().unwrap_or("error"),
                    duration
                ),
                Err(err) => error!(
                    "IPC request: {} {} - failed after {:.3}s: {err:#}",
                    method, path, duration
                ),
            }
            result
        })
    }
}

/// The default stack, outermost first.
pub fn default_middlewares(config: &Config) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(ErrorTranslator::new(config.debug)),
        Arc::new(RequestValidator::new(config.max_payload_bytes)),
        Arc::new(AuthEnforcer::new(config.auth.require_authentication)),
        Arc::new(RateLimit),
        Arc::new(AccessLogger),
    ]
}
