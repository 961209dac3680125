// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use linch_ipc::protocol::{IpcRequest, IpcResponse};

use crate::router::Router;
use crate::security::SecurityManager;

/// Exposes the security event ring and connection accounting.
pub fn create_status_router(security: Arc<SecurityManager>) -> anyhow::Result<Router> {
    let mut router = Router::new();

    router.get("/server/security", move |request: IpcRequest| {
        let security = security.clone();
        async move {
            Ok(IpcResponse::success(
                security.security_status(),
                request.request_id,
            ))
        }
    })?;

    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    #[tokio::test]
    async fn security_status_is_served() {
        let security = Arc::new(SecurityManager::new(&Config::default()));
        let router = create_status_router(security).unwrap();

        let resp = router
            .dispatch(IpcRequest::new("GET", "/server/security"))
            .await
            .unwrap();
        assert!(resp.success);
        let data = resp.data.unwrap();
        assert_eq!(data["active_connections"], json!(0));
        assert_eq!(data["daemon_pid"], json!(std::process::id()));
    }
}
