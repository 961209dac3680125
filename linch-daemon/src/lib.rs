// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The linch-mind daemon: a local IPC server for same-user processes.
//!
//! Clients connect over a Unix domain socket (POSIX) or a named pipe
//! (Windows), exchange length-prefixed JSON frames, authenticate through a
//! handshake, and talk to path-routed handlers behind a middleware
//! pipeline. See [`server::Server`] for the assembly.

pub mod config;
pub mod endpoint;
pub mod log;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod security;
pub mod server;
