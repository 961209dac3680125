// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection security: peer verification, per-request firewall and rate
//! limit checks, and the bounded security event ring.

pub mod context;
pub mod events;
pub mod firewall;
pub mod rate_limiter;

pub use context::SecurityContext;
pub use events::{SecurityEvent, SecurityEventKind, SecurityEventLog};
pub use firewall::{Firewall, FirewallVerdict};
pub use rate_limiter::RateLimiter;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use linch_ipc::platform::{PeerCredentials, PidConfidence};
use linch_ipc::MutexExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Config;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientType {
    /// The daemon's own process talking to itself over the loopback
    /// endpoint.
    Internal,
    External,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Internal => "internal",
            ClientType::External => "external",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HandshakeClaim {
    pub client_pid: i32,
}

#[derive(Clone, Copy, Debug)]
pub struct Verification {
    pub authenticated: bool,
    pub client_type: ClientType,
}

/// Pluggable handshake policy. The default trusts the transport ACL as the
/// actual boundary and only corroborates: same-UID on POSIX, PID liveness on
/// Windows, immediate success for the daemon's own PID.
pub trait HandshakeVerifier: Send + Sync {
    fn verify(&self, claim: &HandshakeClaim, peer: &PeerCredentials) -> Verification;
}

struct DefaultVerifier {
    daemon_pid: i32,
    #[cfg(unix)]
    daemon_uid: u32,
}

impl HandshakeVerifier for DefaultVerifier {
    fn verify(&self, claim: &HandshakeClaim, peer: &PeerCredentials) -> Verification {
        if claim.client_pid == self.daemon_pid {
            return Verification {
                authenticated: true,
                client_type: ClientType::Internal,
            };
        }

        #[cfg(unix)]
        let authenticated = match peer.uid {
            Some(uid) => uid == self.daemon_uid,
            None => pid_alive(claim.client_pid),
        };

        #[cfg(windows)]
        let authenticated = {
            let _ = peer;
            claim.client_pid > 0 && linch_ipc::platform::windows::pid_alive(claim.client_pid as u32)
        };

        Verification {
            authenticated,
            client_type: ClientType::External,
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes for existence; EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestRejection {
    MethodBlocked,
    PathBlocked,
    SensitiveBlocked,
    RateLimited,
}

/// One manager per server: owns the firewall, the per-PID rate limiter, the
/// event ring and the registry of live connection contexts.
pub struct SecurityManager {
    daemon_pid: i32,
    daemon_uid: Option<u32>,
    firewall: Firewall,
    rate_limiter: RateLimiter,
    events: SecurityEventLog,
    verifier: Box<dyn HandshakeVerifier>,
    connections: Mutex<HashMap<u64, Arc<SecurityContext>>>,
}

impl SecurityManager {
    pub fn new(config: &Config) -> Self {
        let daemon_pid = std::process::id() as i32;
        #[cfg(unix)]
        let daemon_uid = Some(unsafe { libc::getuid() });
        #[cfg(windows)]
        let daemon_uid = None;

        SecurityManager {
            daemon_pid,
            daemon_uid,
            firewall: Firewall::new(&config.firewall, config.development_mode),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            events: SecurityEventLog::default(),
            verifier: Box::new(DefaultVerifier {
                daemon_pid,
                #[cfg(unix)]
                daemon_uid: daemon_uid.unwrap_or_default(),
            }),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn HandshakeVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn daemon_pid(&self) -> i32 {
        self.daemon_pid
    }

    pub fn register_connection(&self, ctx: Arc<SecurityContext>) {
        let id = ctx.connection_id();
        let pid = ctx.peer().pid;
        self.connections.lock_or_panic().insert(id, ctx);
        self.events.record(SecurityEvent::new(
            SecurityEventKind::ConnectionAttempt,
            id,
            pid,
        ));
        debug!("new IPC connection: id={}, peer_pid={:?}", id, pid);
    }

    pub fn close_connection(&self, connection_id: u64) {
        if let Some(ctx) = self.connections.lock_or_panic().remove(&connection_id) {
            self.events.record(
                SecurityEvent::new(
                    SecurityEventKind::ConnectionClosed,
                    connection_id,
                    ctx.client_pid().or(ctx.peer().pid),
                )
                .with_details(json!({
                    "request_count": ctx.request_count(),
                    "duration_seconds": ctx.connection_age().as_secs_f64(),
                })),
            );
            debug!(
                "IPC connection closed: id={}, requests={}",
                connection_id,
                ctx.request_count()
            );
        }
        self.rate_limiter.prune_idle();
    }

    /// Verifies a handshake claim. The peer-PID confidence recorded at
    /// accept time adjusts the logging severity, never the outcome.
    pub fn verify_handshake(
        &self,
        claim: &HandshakeClaim,
        peer: &PeerCredentials,
    ) -> Verification {
        let verification = self.verifier.verify(claim, peer);
        if verification.authenticated {
            match peer.confidence {
                PidConfidence::High | PidConfidence::Medium => info!(
                    "IPC peer verified: pid={}, type={}, source={}",
                    claim.client_pid,
                    verification.client_type.as_str(),
                    peer.source.as_str()
                ),
                _ => info!(
                    "IPC peer verified without trusted pid source: pid={}, type={}, confidence={}",
                    claim.client_pid,
                    verification.client_type.as_str(),
                    peer.confidence.as_str()
                ),
            }
        } else {
            warn!(
                "IPC peer verification failed: pid={}, source={}, confidence={}",
                claim.client_pid,
                peer.source.as_str(),
                peer.confidence.as_str()
            );
        }
        verification
    }

    pub fn record_auth_required(&self, ctx: &SecurityContext, method: &str, path: &str) {
        self.events.record(
            SecurityEvent::new(
                SecurityEventKind::AuthRequired,
                ctx.connection_id(),
                ctx.peer().pid,
            )
            .with_route(Some(method), Some(path)),
        );
    }

    pub fn record_auth_failure(&self, ctx: &SecurityContext, claimed_pid: Option<i64>) {
        self.events.record(
            SecurityEvent::new(
                SecurityEventKind::AuthFailed,
                ctx.connection_id(),
                ctx.peer().pid,
            )
            .with_details(json!({ "claimed_pid": claimed_pid })),
        );
    }

    /// The per-request firewall and rate-limit gate, plus request
    /// accounting. Every rejection lands in the event ring.
    pub fn validate_request(
        &self,
        ctx: &SecurityContext,
        method: &str,
        path: &str,
    ) -> Result<(), RequestRejection> {
        match self.firewall.check(method, path) {
            FirewallVerdict::Allowed => {}
            FirewallVerdict::MethodBlocked => {
                warn!(
                    "IPC method blocked: {} {} (pid={:?})",
                    method,
                    path,
                    ctx.client_pid()
                );
                self.events.record(
                    SecurityEvent::new(
                        SecurityEventKind::MethodBlocked,
                        ctx.connection_id(),
                        ctx.client_pid(),
                    )
                    .with_route(Some(method), Some(path)),
                );
                return Err(RequestRejection::MethodBlocked);
            }
            verdict => {
                warn!(
                    "IPC path blocked: {} (pid={:?})",
                    path,
                    ctx.client_pid()
                );
                self.events.record(
                    SecurityEvent::new(
                        SecurityEventKind::PathBlocked,
                        ctx.connection_id(),
                        ctx.client_pid(),
                    )
                    .with_route(Some(method), Some(path))
                    .with_details(json!({
                        "sensitive": verdict == FirewallVerdict::SensitiveBlocked,
                    })),
                );
                return Err(match verdict {
                    FirewallVerdict::SensitiveBlocked => RequestRejection::SensitiveBlocked,
                    _ => RequestRejection::PathBlocked,
                });
            }
        }

        let pid = ctx.effective_pid();
        if !self.rate_limiter.is_allowed(pid, path) {
            if !self.rate_limiter.is_exempt(path) {
                warn!("IPC client {} rate limited (path: {})", pid, path);
            }
            self.events.record(
                SecurityEvent::new(
                    SecurityEventKind::RateLimitExceeded,
                    ctx.connection_id(),
                    Some(pid),
                )
                .with_route(Some(method), Some(path)),
            );
            return Err(RequestRejection::RateLimited);
        }

        ctx.note_request();
        Ok(())
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock_or_panic().len()
    }

    pub fn events(&self) -> &SecurityEventLog {
        &self.events
    }

    /// Snapshot served by the status route: connection counts, policy and
    /// event statistics over the last hour.
    pub fn security_status(&self) -> Value {
        json!({
            "active_connections": self.active_connections(),
            "daemon_pid": self.daemon_pid,
            "daemon_uid": self.daemon_uid,
            "blocked_paths": self.firewall.blocked_paths(),
            "recent_events": self.events.recent_stats(chrono::Duration::hours(1)),
            "total_security_logs": self.events.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linch_ipc::platform::PidSource;

    fn manager() -> SecurityManager {
        SecurityManager::new(&Config::default())
    }

    fn own_uid() -> Option<u32> {
        #[cfg(unix)]
        {
            Some(unsafe { libc::getuid() })
        }
        #[cfg(windows)]
        {
            None
        }
    }

    fn ctx(id: u64, pid: i32) -> Arc<SecurityContext> {
        Arc::new(SecurityContext::new(
            id,
            PeerCredentials {
                pid: Some(pid),
                uid: own_uid(),
                gid: None,
                source: PidSource::SoPeercred,
                confidence: PidConfidence::High,
            },
        ))
    }

    #[test]
    fn own_pid_is_internal() {
        let manager = manager();
        let verification = manager.verify_handshake(
            &HandshakeClaim {
                client_pid: manager.daemon_pid(),
            },
            &PeerCredentials::unavailable(),
        );
        assert!(verification.authenticated);
        assert_eq!(verification.client_type, ClientType::Internal);
    }

    #[cfg(unix)]
    #[test]
    fn same_uid_external_client_is_verified() {
        let manager = manager();
        let verification = manager.verify_handshake(
            &HandshakeClaim { client_pid: 1 },
            &PeerCredentials {
                pid: Some(1),
                uid: Some(unsafe { libc::getuid() }),
                gid: None,
                source: PidSource::SoPeercred,
                confidence: PidConfidence::High,
            },
        );
        assert!(verification.authenticated);
        assert_eq!(verification.client_type, ClientType::External);
    }

    #[cfg(unix)]
    #[test]
    fn foreign_uid_is_rejected() {
        let manager = manager();
        let other_uid = unsafe { libc::getuid() }.wrapping_add(1);
        let verification = manager.verify_handshake(
            &HandshakeClaim { client_pid: 1 },
            &PeerCredentials {
                pid: Some(1),
                uid: Some(other_uid),
                gid: None,
                source: PidSource::SoPeercred,
                confidence: PidConfidence::High,
            },
        );
        assert!(!verification.authenticated);
    }

    #[test]
    fn firewall_rejections_emit_events() {
        let manager = manager();
        let ctx = ctx(1, 50);
        manager.register_connection(ctx.clone());

        assert_eq!(
            manager.validate_request(&ctx, "TRACE", "/health"),
            Err(RequestRejection::MethodBlocked)
        );
        assert_eq!(
            manager.validate_request(&ctx, "GET", "/internal/debug"),
            Err(RequestRejection::PathBlocked)
        );
        assert_eq!(
            manager.validate_request(&ctx, "GET", "/system-config/security"),
            Err(RequestRejection::SensitiveBlocked)
        );

        let stats = manager
            .events()
            .recent_stats(chrono::Duration::minutes(5));
        assert_eq!(stats.get(&SecurityEventKind::MethodBlocked), Some(&1));
        assert_eq!(stats.get(&SecurityEventKind::PathBlocked), Some(&2));
        // Rejections never advance the request counter.
        assert_eq!(ctx.request_count(), 0);
    }

    #[test]
    fn admitted_requests_are_counted() {
        let manager = manager();
        let ctx = ctx(1, 51);
        manager.register_connection(ctx.clone());
        assert!(manager.validate_request(&ctx, "GET", "/health").is_ok());
        assert_eq!(ctx.request_count(), 1);
        manager.close_connection(1);
        assert_eq!(manager.active_connections(), 0);
    }

    #[test]
    fn security_status_reports_the_ring() {
        let manager = manager();
        let ctx = ctx(3, 52);
        manager.register_connection(ctx.clone());
        let _ = manager.validate_request(&ctx, "TRACE", "/x");

        let status = manager.security_status();
        assert_eq!(status["active_connections"], json!(1));
        assert_eq!(status["daemon_pid"], json!(std::process::id()));
        assert!(status["total_security_logs"].as_u64().unwrap() >= 2);
    }
}
