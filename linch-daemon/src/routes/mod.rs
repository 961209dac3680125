// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The IPC-intrinsic routes. Everything else the daemon serves is
//! registered by external subsystems through [`crate::server::Server`].

pub mod auth;
pub mod health;
pub mod status;

use std::sync::Arc;

use crate::router::Router;
use crate::security::SecurityManager;

/// Builds the router with every route the IPC core itself mandates. These
/// must succeed even when every other subsystem is unhealthy, so none of
/// them reach outside this process.
pub fn register_all(security: Arc<SecurityManager>) -> anyhow::Result<Router> {
    let mut router = Router::new();
    router.include(auth::create_auth_router(security.clone())?)?;
    router.include(health::create_health_router()?)?;
    router.include(status::create_status_router(security)?)?;
    Ok(router)
}
