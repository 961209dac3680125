// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use crate::config::FirewallConfig;

/// Methods the daemon understands at all; everything else is rejected
/// before it can reach a route.
pub const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallVerdict {
    Allowed,
    MethodBlocked,
    PathBlocked,
    /// The path is flagged sensitive and the daemon is not in development
    /// mode.
    SensitiveBlocked,
}

pub struct Firewall {
    blocked_paths: HashSet<String>,
    sensitive_paths: HashSet<String>,
    development_mode: bool,
}

impl Firewall {
    pub fn new(config: &FirewallConfig, development_mode: bool) -> Self {
        Firewall {
            blocked_paths: config.blocked_paths.iter().cloned().collect(),
            sensitive_paths: config.sensitive_paths.iter().cloned().collect(),
            development_mode,
        }
    }

    pub fn check(&self, method: &str, path: &str) -> FirewallVerdict {
        if !self.is_method_allowed(method) {
            return FirewallVerdict::MethodBlocked;
        }
        if self.blocked_paths.contains(path) {
            return FirewallVerdict::PathBlocked;
        }
        if self.sensitive_paths.contains(path) && !self.development_mode {
            return FirewallVerdict::SensitiveBlocked;
        }
        FirewallVerdict::Allowed
    }

    pub fn is_method_allowed(&self, method: &str) -> bool {
        ALLOWED_METHODS.contains(&method)
    }

    pub fn blocked_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.blocked_paths.iter().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firewall(development_mode: bool) -> Firewall {
        Firewall::new(&FirewallConfig::default(), development_mode)
    }

    #[test]
    fn known_methods_pass() {
        let fw = firewall(false);
        for method in ALLOWED_METHODS {
            assert_eq!(fw.check(method, "/health"), FirewallVerdict::Allowed);
        }
        assert_eq!(fw.check("TRACE", "/health"), FirewallVerdict::MethodBlocked);
        assert_eq!(fw.check("get", "/health"), FirewallVerdict::MethodBlocked);
    }

    #[test]
    fn blocked_paths_are_rejected() {
        let fw = firewall(false);
        assert_eq!(
            fw.check("GET", "/internal/debug"),
            FirewallVerdict::PathBlocked
        );
    }

    #[test]
    fn sensitive_paths_require_development_mode() {
        assert_eq!(
            firewall(false).check("GET", "/system-config/security"),
            FirewallVerdict::SensitiveBlocked
        );
        assert_eq!(
            firewall(true).check("GET", "/system-config/security"),
            FirewallVerdict::Allowed
        );
    }
}
