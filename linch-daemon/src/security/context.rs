// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use linch_ipc::platform::PeerCredentials;

/// Per-connection authentication and accounting state.
///
/// Exactly one context exists per live connection; it is created on accept,
/// mutated by the handshake and by each validated request, and dropped with
/// the connection. The atomics exist because middleware runs with a shared
/// reference while the connection task owns the stream.
#[derive(Debug)]
pub struct SecurityContext {
    connection_id: u64,
    peer: PeerCredentials,
    connected_at: Instant,
    authenticated: AtomicBool,
    internal: AtomicBool,
    /// PID the client claimed in its handshake; 0 until authenticated.
    client_pid: AtomicI32,
    request_count: AtomicU64,
    /// Unix millis of the last validated request; 0 means none yet.
    last_request_millis: AtomicU64,
}

impl SecurityContext {
    pub fn new(connection_id: u64, peer: PeerCredentials) -> Self {
        SecurityContext {
            connection_id,
            peer,
            connected_at: Instant::now(),
            authenticated: AtomicBool::new(false),
            internal: AtomicBool::new(false),
            client_pid: AtomicI32::new(0),
            request_count: AtomicU64::new(0),
            last_request_millis: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer(&self) -> &PeerCredentials {
        &self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_internal(&self) -> bool {
        self.internal.load(Ordering::Relaxed)
    }

    pub fn mark_authenticated(&self, client_pid: i32, internal: bool) {
        self.client_pid.store(client_pid, Ordering::Relaxed);
        self.internal.store(internal, Ordering::Relaxed);
        self.authenticated.store(true, Ordering::Release);
    }

    /// The PID rate-limit buckets are keyed by: the handshake claim when
    /// authenticated, otherwise the transport-reported peer PID.
    pub fn effective_pid(&self) -> i32 {
        let claimed = self.client_pid.load(Ordering::Relaxed);
        if claimed != 0 {
            claimed
        } else {
            self.peer.pid.unwrap_or(0)
        }
    }

    pub fn client_pid(&self) -> Option<i32> {
        match self.client_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn note_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_request_millis.store(millis, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn last_request_millis(&self) -> Option<u64> {
        match self.last_request_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        }
    }

    pub fn connection_age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
