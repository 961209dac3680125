// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogMethod};

/// Installs the global tracing subscriber according to the configured log
/// method and level. Returns quietly when logging is disabled or a
/// subscriber is already installed (tests).
pub fn enable_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match &config.log_method {
        LogMethod::Disabled => return Ok(()),
        LogMethod::Stdout => builder.with_writer(std::io::stdout).try_init(),
        LogMethod::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogMethod::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("could not open log file {}", path.display()))?;
            builder.with_writer(Arc::new(file)).try_init()
        }
    };

    // A second initialization only happens when embedding; keep the first.
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
    Ok(())
}
