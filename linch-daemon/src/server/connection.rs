// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-connection request loop.
//!
//! One task owns one stream for its entire lifetime. Frames are processed
//! strictly in arrival order and responses written back in the same order;
//! concurrency happens across connections, never within one.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use linch_ipc::codec::{InboundFrame, ServerCodec};
use linch_ipc::protocol::{IpcErrorCode, IpcRequest, IpcResponse};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::middleware::{IpcApplication, RequestContext};
use crate::routes::auth::HANDSHAKE_PATH;
use crate::security::{SecurityContext, SecurityManager};

pub(crate) const CLIENT_PID_HEADER: &str = "x-client-pid";
pub(crate) const AUTHENTICATED_HEADER: &str = "x-authenticated";
pub(crate) const INTERNAL_CLIENT_HEADER: &str = "x-internal-client";

pub(crate) struct ConnectionHandler {
    pub(crate) ctx: Arc<SecurityContext>,
    pub(crate) app: Arc<IpcApplication>,
    pub(crate) security: Arc<SecurityManager>,
    pub(crate) max_payload: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub(crate) async fn serve<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(stream, ServerCodec::new(self.max_payload));
        let idle_timeout = self.idle_timeout;
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    // Best-effort notice; the client may already be gone.
                    let _ = framed.send(shutdown_response()).await;
                    break;
                }
                next = timeout(idle_timeout, framed.next()) => {
                    let frame = match next {
                        Err(_) => {
                            debug!(
                                "connection {} idle beyond timeout, closing",
                                self.ctx.connection_id()
                            );
                            break;
                        }
                        // EOF between frames, or mid-frame: close silently.
                        Ok(None) => break,
                        Ok(Some(frame)) => frame,
                    };
                    match frame {
                        Ok(InboundFrame::Frame(request)) => {
                            let response = self.process(request).await;
                            if framed.send(response).await.is_err() {
                                break;
                            }
                        }
                        Ok(InboundFrame::Oversize { len, max }) => {
                            let response = IpcResponse::error(
                                IpcErrorCode::InvalidRequest,
                                "Payload too large",
                                Some(json!({ "frame_length": len, "max_payload_bytes": max })),
                                None,
                            );
                            let _ = framed.send(response).await;
                            break;
                        }
                        Ok(InboundFrame::Empty) => {
                            let response = IpcResponse::error(
                                IpcErrorCode::InvalidRequest,
                                "Zero-length frame",
                                None,
                                None,
                            );
                            if framed.send(response).await.is_err() {
                                break;
                            }
                        }
                        Ok(InboundFrame::Malformed(e)) => {
                            let response = IpcResponse::error(
                                IpcErrorCode::InvalidRequest,
                                "Invalid JSON format",
                                Some(json!({ "parse_error": e.to_string() })),
                                None,
                            );
                            if framed.send(response).await.is_err() {
                                break;
                            }
                        }
                        // Covers mid-frame EOF as well: close silently.
                        Err(e) => {
                            debug!(
                                "connection {} stream error: {}",
                                self.ctx.connection_id(),
                                e
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, mut request: IpcRequest) -> IpcResponse {
        request.method = request.method.to_ascii_uppercase();

        if request.path == HANDSHAKE_PATH {
            return self.process_handshake(request).await;
        }

        if self.ctx.is_authenticated() {
            request.headers.insert(
                CLIENT_PID_HEADER.to_string(),
                self.ctx.client_pid().unwrap_or(0).to_string(),
            );
            request
                .headers
                .insert(AUTHENTICATED_HEADER.to_string(), "true".to_string());
            if self.ctx.is_internal() {
                request
                    .headers
                    .insert(INTERNAL_CLIENT_HEADER.to_string(), "true".to_string());
            }
        }

        let request_id = request.request_id.clone();
        self.dispatch(request, request_id).await
    }

    /// Runs the handshake through the pipeline like any other request, then
    /// inspects the response to decide whether this connection just became
    /// authenticated.
    async fn process_handshake(&self, mut request: IpcRequest) -> IpcResponse {
        let request_id = request.request_id.clone();
        let claimed_pid = request
            .data
            .as_ref()
            .and_then(|d| d.get("client_pid"))
            .and_then(|v| v.as_i64());
        for (name, value) in self.ctx.peer().to_headers() {
            request.headers.insert(name, value);
        }

        let response = self.dispatch(request, request_id).await;

        let authenticated = response.success
            && response
                .data
                .as_ref()
                .and_then(|d| d.get("authenticated"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
        if authenticated {
            if !self.ctx.is_authenticated() {
                let internal = response
                    .data
                    .as_ref()
                    .and_then(|d| d.get("client_type"))
                    .and_then(|v| v.as_str())
                    == Some("internal");
                let pid = claimed_pid.unwrap_or(0) as i32;
                self.ctx.mark_authenticated(pid, internal);
                info!(
                    "IPC client authenticated: connection={}, pid={}, internal={}",
                    self.ctx.connection_id(),
                    pid,
                    internal
                );
            }
        } else {
            self.security.record_auth_failure(&self.ctx, claimed_pid);
        }
        response
    }

    async fn dispatch(&self, request: IpcRequest, request_id: Option<String>) -> IpcResponse {
        let rc = RequestContext {
            context: self.ctx.clone(),
            security: self.security.clone(),
        };
        match self.request_timeout {
            Some(limit) => match timeout(limit, self.app.handle(&rc, request)).await {
                Ok(response) => response,
                Err(_) => IpcResponse::error(
                    IpcErrorCode::RequestTimeout,
                    "Request processing timed out",
                    Some(json!({ "timeout_ms": limit.as_millis() as u64 })),
                    request_id,
                ),
            },
            None => self.app.handle(&rc, request).await,
        }
    }
}

/// Waits until the watch channel's value becomes `true`, without holding the
/// channel's internal read guard across an await point (it is not `Send`).
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) fn shutdown_response() -> IpcResponse {
    IpcResponse::error(
        IpcErrorCode::ServiceUnavailable,
        "Server is shutting down",
        None,
        None,
    )
}

/// Writes one refusal frame and drops the stream; used when the concurrent
/// connection cap is hit.
pub(crate) async fn refuse<S>(stream: S, max_connections: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, ServerCodec::default());
    let response = IpcResponse::error(
        IpcErrorCode::ConnectionFailed,
        "Connection limit reached",
        Some(json!({ "max_connections": max_connections })),
        None,
    );
    let _ = framed.send(response).await;
}
