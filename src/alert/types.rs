use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of alerts the pipeline can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    PacketLoss,
    HighLatency,
    HighJitter,
    ConnectionLost,
    MtuIssue,
    RouteChange,
    DnsFailure,
    IpChange,
    HopIssue,
    UpdateAvailable,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PacketLoss => "packet_loss",
            Self::HighLatency => "high_latency",
            Self::HighJitter => "high_jitter",
            Self::ConnectionLost => "connection_lost",
            Self::MtuIssue => "mtu_issue",
            Self::RouteChange => "route_change",
            Self::DnsFailure => "dns_failure",
            Self::IpChange => "ip_change",
            Self::HopIssue => "hop_issue",
            Self::UpdateAvailable => "update_available",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Alert lifecycle. Only `Active` is shown to the user; `Archived`
/// lives in bounded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    Pending,
    Active,
    Recovered,
    Archived,
}

/// Stable identity over (kind, normalized subject). Equal inputs always
/// produce equal fingerprints within a process run.
pub fn fingerprint(kind: AlertKind, subject: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.as_str().hash(&mut hasher);
    subject.trim().to_lowercase().hash(&mut hasher);
    hasher.finish()
}

/// One alert tracked by the smart pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEntity {
    pub kind: AlertKind,
    pub severity: Severity,
    pub priority: Priority,
    pub message: String,
    pub subject: String,
    pub fingerprint: u64,
    pub state: AlertState,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub suppress_count: u32,
    /// Consecutive evaluations where the underlying condition was false
    pub clear_streak: u32,
    pub group: Option<u64>,
}

impl AlertEntity {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        subject: &str,
        message: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity,
            priority: Priority::Medium,
            message,
            subject: subject.to_string(),
            fingerprint: fingerprint(kind, subject),
            state: AlertState::Pending,
            created_at: now,
            last_seen_at: now,
            suppress_count: 0,
            clear_streak: 0,
            group: None,
        }
    }

    /// Bump last-seen with monotonic protection against out-of-order readers
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = self.last_seen_at.max(now);
    }
}

/// Related alerts collapsed under a root cause
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertGroup {
    pub leader_fingerprint: u64,
    pub root_cause: AlertKind,
    pub members: Vec<u64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable_and_normalized() {
        let a = fingerprint(AlertKind::PacketLoss, "target 1.1.1.1");
        let b = fingerprint(AlertKind::PacketLoss, "  TARGET 1.1.1.1 ");
        let c = fingerprint(AlertKind::HighLatency, "target 1.1.1.1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let now = Utc::now();
        let mut alert = AlertEntity::new(AlertKind::DnsFailure, Severity::Warning, "dns", "m".into(), now);
        let earlier = now - chrono::Duration::seconds(30);
        alert.touch(earlier);
        assert_eq!(alert.last_seen_at, now);
        let later = now + chrono::Duration::seconds(30);
        alert.touch(later);
        assert_eq!(alert.last_seen_at, later);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert!(Priority::Critical > Priority::Low);
    }
}
