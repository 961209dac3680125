// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The authentication handshake.
//!
//! The handler is a plain route: it verifies the claim and reports the
//! outcome in its response. The connection loop watches for a successful
//! handshake response and flips the connection's authenticated flag; the
//! handler itself never touches connection state.

use std::sync::Arc;

use linch_ipc::platform::PeerCredentials;
use linch_ipc::protocol::{IpcErrorCode, IpcRequest, IpcResponse};
use serde_json::json;

use crate::router::Router;
use crate::security::{HandshakeClaim, SecurityManager};

pub const HANDSHAKE_PATH: &str = "/auth/handshake";

pub fn create_auth_router(security: Arc<SecurityManager>) -> anyhow::Result<Router> {
    let mut router = Router::new();

    router.post(HANDSHAKE_PATH, move |request: IpcRequest| {
        let security = security.clone();
        async move {
            let request_id = request.request_id.clone();
            let claimed = request
                .data
                .as_ref()
                .and_then(|d| d.get("client_pid"))
                .and_then(|v| v.as_i64());

            let Some(client_pid) = claimed else {
                return Ok(IpcResponse::error(
                    IpcErrorCode::InvalidRequest,
                    "Missing client_pid in authentication request",
                    Some(json!({ "required_field": "client_pid" })),
                    request_id,
                ));
            };

            // The connection loop injects the transport-reported peer
            // identity as headers; the claim is checked against it.
            let peer = PeerCredentials::from_headers(&request.headers);
            let claim = HandshakeClaim {
                client_pid: client_pid as i32,
            };
            let verification = security.verify_handshake(&claim, &peer);

            if verification.authenticated {
                Ok(IpcResponse::success(
                    json!({
                        "authenticated": true,
                        "message": format!(
                            "{} client authentication successful",
                            capitalize(verification.client_type.as_str())
                        ),
                        "server_pid": security.daemon_pid(),
                        "client_type": verification.client_type.as_str(),
                    }),
                    request_id,
                ))
            } else {
                Ok(IpcResponse::error(
                    IpcErrorCode::AuthFailed,
                    "Authentication failed",
                    Some(json!({ "client_pid": client_pid })),
                    request_id,
                ))
            }
        }
    })?;

    Ok(router)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn handshake_request(data: serde_json::Value) -> IpcRequest {
        IpcRequest::new("POST", HANDSHAKE_PATH).with_data(data)
    }

    #[tokio::test]
    async fn own_pid_yields_internal_client_type() {
        let security = Arc::new(SecurityManager::new(&Config::default()));
        let router = create_auth_router(security.clone()).unwrap();

        let resp = router
            .dispatch(handshake_request(json!({ "client_pid": std::process::id() })))
            .await
            .unwrap();
        assert!(resp.success);
        let data = resp.data.unwrap();
        assert_eq!(data["authenticated"], json!(true));
        assert_eq!(data["client_type"], json!("internal"));
        assert_eq!(data["server_pid"], json!(security.daemon_pid()));
    }

    #[tokio::test]
    async fn missing_client_pid_is_an_invalid_request() {
        let security = Arc::new(SecurityManager::new(&Config::default()));
        let router = create_auth_router(security).unwrap();

        let resp = router
            .dispatch(handshake_request(json!({})))
            .await
            .unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, "IPC_INVALID_REQUEST");
        assert_eq!(error.details.unwrap()["required_field"], json!("client_pid"));
    }
}
