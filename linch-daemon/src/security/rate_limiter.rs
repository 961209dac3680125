// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-peer request rate limiting.
//!
//! Buckets are keyed by PID, not by connection, so a process cannot shard
//! its load across reconnects. Two thresholds apply together: a burst cap
//! over a short rolling window and a cap over any trailing 60 seconds.
//! Exempt path prefixes get both caps multiplied and a shorter burst reset.

use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use linch_ipc::MutexExt;
use zwohash::ZwoHasher;

use crate::config::RateLimitConfig;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const BURST_RESET_INTERVAL: Duration = Duration::from_secs(10);
const EXEMPT_BURST_RESET_INTERVAL: Duration = Duration::from_secs(5);
const EXEMPT_MULTIPLIER: u32 = 3;

#[derive(Debug)]
struct Bucket {
    /// Timestamps of admitted requests within the trailing minute.
    minute: VecDeque<Instant>,
    burst_count: u32,
    burst_window_start: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Bucket {
            minute: VecDeque::new(),
            burst_count: 0,
            burst_window_start: now,
        }
    }

    fn idle_since(&self, now: Instant) -> bool {
        self.minute.is_empty() && now.duration_since(self.burst_window_start) > MINUTE_WINDOW
    }
}

pub struct RateLimiter {
    max_requests_per_minute: u32,
    max_burst: u32,
    exempt_prefixes: Vec<String>,
    buckets: Mutex<HashMap<i32, Bucket, BuildHasherDefault<ZwoHasher>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        RateLimiter {
            max_requests_per_minute: config.max_requests_per_minute,
            max_burst: config.max_burst,
            exempt_prefixes: config.exempt_path_prefixes.clone(),
            buckets: Mutex::new(HashMap::default()),
        }
    }

    /// Admits or rejects one request. Tokens are only consumed on
    /// admission; a rejected request does not make the next one less
    /// likely to pass.
    pub fn is_allowed(&self, pid: i32, path: &str) -> bool {
        self.check(pid, path, Instant::now())
    }

    fn check(&self, pid: i32, path: &str, now: Instant) -> bool {
        let exempt = self.is_exempt(path);
        let (burst_limit, minute_limit, reset_interval) = if exempt {
            (
                self.max_burst.saturating_mul(EXEMPT_MULTIPLIER),
                self.max_requests_per_minute.saturating_mul(EXEMPT_MULTIPLIER),
                EXEMPT_BURST_RESET_INTERVAL,
            )
        } else {
            (
                self.max_burst,
                self.max_requests_per_minute,
                BURST_RESET_INTERVAL,
            )
        };

        let mut buckets = self.buckets.lock_or_panic();
        let bucket = buckets.entry(pid).or_insert_with(|| Bucket::new(now));

        if now.duration_since(bucket.burst_window_start) > reset_interval {
            bucket.burst_count = 0;
            bucket.burst_window_start = now;
        }
        if bucket.burst_count >= burst_limit {
            return false;
        }

        while let Some(&front) = bucket.minute.front() {
            if now.duration_since(front) > MINUTE_WINDOW {
                bucket.minute.pop_front();
            } else {
                break;
            }
        }
        if bucket.minute.len() >= minute_limit as usize {
            return false;
        }

        bucket.minute.push_back(now);
        bucket.burst_count += 1;
        true
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes.iter().any(|p| path.starts_with(p))
    }

    /// Drops buckets that have been idle beyond the longest window; called
    /// when connections close so the map does not grow with peer churn.
    pub fn prune_idle(&self) {
        let now = Instant::now();
        self.buckets
            .lock_or_panic()
            .retain(|_, bucket| !bucket.idle_since(now));
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock_or_panic().len()
    }
}
