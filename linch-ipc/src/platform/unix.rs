// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix domain socket endpoint: creation, permission hardening and peer
//! credential acquisition.
//!
//! The socket file is only reachable by the owning user: the parent
//! directory is created with mode 0700 and the socket itself chmod-ed to
//! 0600 immediately after bind.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::{PeerCredentials, PidConfidence, PidSource};

/// Default endpoint under the system temp directory, one per daemon process.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("linch-mind-{}.sock", std::process::id()))
}

pub fn secure_socket_directory(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    // System temp directories may refuse the chmod; that is fine, the socket
    // file mode is the enforcement that matters.
    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
        debug!("could not tighten socket directory {:?}: {}", dir, e);
    }
    Ok(())
}

pub fn secure_socket_file(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

/// Binds the listener, replacing any stale socket file left behind by a
/// previous daemon instance.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    if let Some(dir) = path.parent() {
        secure_socket_directory(dir)?;
    }
    let listener = UnixListener::bind(path)?;
    secure_socket_file(path)?;
    Ok(listener)
}

pub fn remove_socket(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}

/// Whether something is currently accepting on the socket path.
pub fn is_listening<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    if !path.as_ref().exists() {
        return Ok(false);
    }
    Ok(std::os::unix::net::UnixStream::connect(path).is_ok())
}

/// Reads `SO_PEERCRED` / `LOCAL_PEER*` for an accepted stream. The UID/GID
/// are always available on supported platforms; a missing PID degrades the
/// confidence tag rather than failing the accept.
pub fn peer_credentials(stream: &UnixStream) -> PeerCredentials {
    match stream.peer_cred() {
        Ok(cred) => {
            let pid = cred.pid();
            let source = if pid.is_some() {
                if cfg!(any(target_os = "linux", target_os = "android")) {
                    PidSource::SoPeercred
                } else {
                    PidSource::LocalPeer
                }
            } else {
                PidSource::Unavailable
            };
            PeerCredentials {
                pid,
                uid: Some(cred.uid()),
                gid: Some(cred.gid()),
                source,
                confidence: if pid.is_some() {
                    PidConfidence::High
                } else {
                    PidConfidence::Low
                },
            }
        }
        Err(e) => {
            debug!("could not read peer credentials: {}", e);
            PeerCredentials::unavailable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_hardens_and_replaces_stale_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockets").join("daemon.sock");

        let listener = bind_socket(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        // A second bind on the same path replaces the stale file.
        drop(listener);
        let _listener = bind_socket(&path).unwrap();
        assert!(is_listening(&path).unwrap());
    }

    #[tokio::test]
    async fn peer_credentials_identify_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        let listener = bind_socket(&path).unwrap();

        let client = UnixStream::connect(&path).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(client);

        let creds = peer_credentials(&server_side);
        assert_eq!(creds.uid, Some(unsafe { libc::getuid() }));
        #[cfg(target_os = "linux")]
        {
            assert_eq!(creds.pid, Some(std::process::id() as i32));
            assert_eq!(creds.source, PidSource::SoPeercred);
            assert_eq!(creds.confidence, PidConfidence::High);
        }
    }
}
