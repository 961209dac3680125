// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use linch_ipc::MutexExt;

pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    ConnectionAttempt,
    ConnectionClosed,
    AuthRequired,
    AuthFailed,
    RateLimitExceeded,
    PathBlocked,
    MethodBlocked,
}

#[derive(Clone, Debug, Serialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub connection_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, connection_id: u64, pid: Option<i32>) -> Self {
        SecurityEvent {
            kind,
            connection_id,
            pid,
            method: None,
            path: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_route(mut self, method: Option<&str>, path: Option<&str>) -> Self {
        self.method = method.map(str::to_string);
        self.path = path.map(str::to_string);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Bounded in-memory ring of security events; the oldest entry is dropped on
/// overflow. Appended from every connection task, so pushes are the only
/// work done under the lock.
pub struct SecurityEventLog {
    ring: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
}

impl Default for SecurityEventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl SecurityEventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        SecurityEventLog {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, event: SecurityEvent) {
        let mut ring = self.ring.lock_or_panic();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.ring.lock_or_panic().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock_or_panic().is_empty()
    }

    /// Event counts per kind within the trailing window.
    pub fn recent_stats(&self, window: chrono::Duration) -> HashMap<SecurityEventKind, usize> {
        let cutoff = Utc::now() - window;
        let ring = self.ring.lock_or_panic();
        let mut stats = HashMap::new();
        for event in ring.iter().filter(|e| e.timestamp >= cutoff) {
            *stats.entry(event.kind).or_insert(0) += 1;
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<SecurityEvent> {
        self.ring.lock_or_panic().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_the_oldest_entry() {
        let log = SecurityEventLog::with_capacity(3);
        for id in 0..5 {
            log.record(SecurityEvent::new(
                SecurityEventKind::ConnectionAttempt,
                id,
                None,
            ));
        }
        let events = log.snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].connection_id, 2);
        assert_eq!(events[2].connection_id, 4);
    }

    #[test]
    fn recent_stats_group_by_kind() {
        let log = SecurityEventLog::default();
        log.record(SecurityEvent::new(SecurityEventKind::AuthFailed, 1, None));
        log.record(SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            1,
            Some(9),
        ));
        log.record(SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            2,
            Some(9),
        ));

        let stats = log.recent_stats(chrono::Duration::hours(1));
        assert_eq!(stats.get(&SecurityEventKind::AuthFailed), Some(&1));
        assert_eq!(stats.get(&SecurityEventKind::RateLimitExceeded), Some(&2));
        assert_eq!(stats.get(&SecurityEventKind::PathBlocked), None);
    }

    #[test]
    fn kinds_serialize_as_snake_case() {
        let s = serde_json::to_string(&SecurityEventKind::RateLimitExceeded).unwrap();
        assert_eq!(s, "\"rate_limit_exceeded\"");
    }
}
