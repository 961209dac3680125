// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use linch_ipc::protocol::{IpcRequest, IpcResponse, PROTOCOL_VERSION, SERVICE_NAME};
use serde_json::json;

use crate::router::Router;

pub fn create_health_router() -> anyhow::Result<Router> {
    let mut router = Router::new();

    router.get("/", |request: IpcRequest| async move {
        Ok(IpcResponse::success(
            json!({
                "message": "Linch Mind IPC Service",
                "version": env!("CARGO_PKG_VERSION"),
                "status": "running",
                "protocol": "pure_ipc",
            }),
            request.request_id,
        ))
    })?;

    router.get("/health", |request: IpcRequest| async move {
        Ok(IpcResponse::success(
            json!({
                "status": "healthy",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "service": SERVICE_NAME,
                "protocol_version": PROTOCOL_VERSION,
            }),
            request.request_id,
        ))
    })?;

    router.get("/server/info", |request: IpcRequest| async move {
        Ok(IpcResponse::success(
            json!({
                "pid": std::process::id(),
                "platform": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
                "communication": "Pure IPC",
                "protocol_version": PROTOCOL_VERSION,
            }),
            request.request_id,
        ))
    })?;

    Ok(router)
}
