// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Endpoint descriptor files.
//!
//! Once the daemon is listening it writes a JSON descriptor to
//! `<app_data>/daemon.socket` and a legacy `daemon.port` marker containing
//! `0:<pid>` (port zero signals IPC mode to old clients). Writing them is
//! the last startup step and the readiness signal; both are removed on
//! clean shutdown.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const SOCKET_FILE_NAME: &str = "daemon.socket";
pub const PORT_FILE_NAME: &str = "daemon.port";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub pid: u32,
    pub protocol: String,
}

impl EndpointDescriptor {
    pub fn unix_socket(path: &Path) -> Self {
        EndpointDescriptor {
            kind: "unix_socket".to_string(),
            path: path.to_string_lossy().into_owned(),
            pid: std::process::id(),
            protocol: "ipc".to_string(),
        }
    }

    pub fn named_pipe(full_name: &str) -> Self {
        EndpointDescriptor {
            kind: "named_pipe".to_string(),
            path: full_name.to_string(),
            pid: std::process::id(),
            protocol: "ipc".to_string(),
        }
    }
}

pub struct EndpointFiles {
    socket_file: PathBuf,
    port_file: PathBuf,
}

impl EndpointFiles {
    pub fn new(app_data_dir: &Path) -> Self {
        EndpointFiles {
            socket_file: app_data_dir.join(SOCKET_FILE_NAME),
            port_file: app_data_dir.join(PORT_FILE_NAME),
        }
    }

    pub fn socket_file(&self) -> &Path {
        &self.socket_file
    }

    pub fn port_file(&self) -> &Path {
        &self.port_file
    }

    pub fn write(&self, descriptor: &EndpointDescriptor) -> anyhow::Result<()> {
        if let Some(dir) = self.socket_file.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create app data directory {dir:?}"))?;
            restrict_permissions(dir, 0o700);
        }

        let mut file = fs::File::create(&self.socket_file)
            .with_context(|| format!("could not write {:?}", self.socket_file))?;
        file.write_all(serde_json::to_string_pretty(descriptor)?.as_bytes())?;
        restrict_permissions(&self.socket_file, 0o600);
        info!("endpoint descriptor written: {:?}", self.socket_file);

        match fs::write(&self.port_file, format!("0:{}", descriptor.pid)) {
            Ok(()) => {
                restrict_permissions(&self.port_file, 0o600);
                info!(
                    "legacy endpoint marker written: {:?} (port 0 = IPC mode)",
                    self.port_file
                );
            }
            Err(e) => warn!("could not write legacy endpoint marker: {e}"),
        }
        Ok(())
    }

    pub fn remove(&self) {
        for path in [&self.socket_file, &self.port_file] {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    warn!("could not remove endpoint file {path:?}: {e}");
                }
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!("could not restrict permissions on {path:?}: {e}");
    }
}

#[cfg(windows)]
fn restrict_permissions(_path: &Path, _mode: u32) {
    // Files under %LOCALAPPDATA% are already private to the user profile.
}
