// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform endpoint helpers: Unix domain sockets on POSIX, named pipes on
//! Windows, plus the peer-credential model shared by both.

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

use std::collections::HashMap;

/// How trustworthy the peer PID is. The authentication decision itself stays
/// boolean; confidence only drives logging severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PidConfidence {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl PidConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            PidConfidence::High => "high",
            PidConfidence::Medium => "medium",
            PidConfidence::Low => "low",
            PidConfidence::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => PidConfidence::High,
            "medium" => PidConfidence::Medium,
            "low" => PidConfidence::Low,
            _ => PidConfidence::Unknown,
        }
    }
}

/// Where the peer PID came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PidSource {
    /// `SO_PEERCRED` on Linux.
    SoPeercred,
    /// `LOCAL_PEERPID` / `LOCAL_PEERCRED` on BSD-likes.
    LocalPeer,
    /// `GetNamedPipeClientProcessId` on Windows.
    PipeClient,
    #[default]
    Unavailable,
}

impl PidSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PidSource::SoPeercred => "SO_PEERCRED",
            PidSource::LocalPeer => "LOCAL_PEERPID",
            PidSource::PipeClient => "PIPE_CLIENT_PID",
            PidSource::Unavailable => "unavailable",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SO_PEERCRED" => PidSource::SoPeercred,
            "LOCAL_PEERPID" => PidSource::LocalPeer,
            "PIPE_CLIENT_PID" => PidSource::PipeClient,
            _ => PidSource::Unavailable,
        }
    }
}

/// OS-reported identity of the process at the other end of a connection,
/// captured once at accept time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub source: PidSource,
    pub confidence: PidConfidence,
}

pub const PEER_PID_HEADER: &str = "x-peer-pid";
pub const PEER_UID_HEADER: &str = "x-peer-uid";
pub const PEER_GID_HEADER: &str = "x-peer-gid";
pub const PEER_SOURCE_HEADER: &str = "x-peer-source";
pub const PEER_CONFIDENCE_HEADER: &str = "x-peer-confidence";

impl PeerCredentials {
    pub fn unavailable() -> Self {
        PeerCredentials::default()
    }

    /// Encodes the credentials as request headers so that route handlers can
    /// see them without the core handing out connection state.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (PEER_SOURCE_HEADER.to_string(), self.source.as_str().to_string()),
            (
                PEER_CONFIDENCE_HEADER.to_string(),
                self.confidence.as_str().to_string(),
            ),
        ];
        if let Some(pid) = self.pid {
            headers.push((PEER_PID_HEADER.to_string(), pid.to_string()));
        }
        if let Some(uid) = self.uid {
            headers.push((PEER_UID_HEADER.to_string(), uid.to_string()));
        }
        if let Some(gid) = self.gid {
            headers.push((PEER_GID_HEADER.to_string(), gid.to_string()));
        }
        headers
    }

    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        PeerCredentials {
            pid: headers.get(PEER_PID_HEADER).and_then(|v| v.parse().ok()),
            uid: headers.get(PEER_UID_HEADER).and_then(|v| v.parse().ok()),
            gid: headers.get(PEER_GID_HEADER).and_then(|v| v.parse().ok()),
            source: headers
                .get(PEER_SOURCE_HEADER)
                .map(|v| PidSource::parse(v))
                .unwrap_or_default(),
            confidence: headers
                .get(PEER_CONFIDENCE_HEADER)
                .map(|v| PidConfidence::parse(v))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_round_trip_through_headers() {
        let creds = PeerCredentials {
            pid: Some(4242),
            uid: Some(1000),
            gid: Some(1000),
            source: PidSource::SoPeercred,
            confidence: PidConfidence::High,
        };
        let headers: HashMap<String, String> = creds.to_headers().into_iter().collect();
        assert_eq!(PeerCredentials::from_headers(&headers), creds);
    }

    #[test]
    fn missing_headers_degrade_to_unknown() {
        let creds = PeerCredentials::from_headers(&HashMap::new());
        assert_eq!(creds.pid, None);
        assert_eq!(creds.source, PidSource::Unavailable);
        assert_eq!(creds.confidence, PidConfidence::Unknown);
    }
}
