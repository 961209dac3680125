// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use tracing::info;

use linch_daemon::config::Config;
use linch_daemon::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    linch_daemon::log::enable_logging(&config)?;

    let started = Instant::now();
    info!("Starting linch-mind daemon, pid: {}", std::process::id());

    let mut server = Server::new(config)?;
    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received, shutting down");
        handle.shutdown();
    });

    server.run().await?;

    info!(
        "linch-mind daemon stopped, total runtime: {:.3}s",
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::error;

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("could not install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(windows)]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
