use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::alert::{AlertGroup, AlertKind};

/// Effects a root cause explains away. An active root-cause alert
/// absorbs these kinds into its group instead of letting them emit on
/// their own.
pub fn root_cause_effects(kind: AlertKind) -> &'static [AlertKind] {
    match kind {
        AlertKind::ConnectionLost => {
            &[AlertKind::PacketLoss, AlertKind::HighLatency, AlertKind::HighJitter]
        }
        AlertKind::MtuIssue => &[AlertKind::PacketLoss, AlertKind::HighLatency],
        AlertKind::RouteChange => &[AlertKind::HighLatency, AlertKind::PacketLoss],
        AlertKind::DnsFailure => &[AlertKind::ConnectionLost],
        _ => &[],
    }
}

/// Collapses related alerts into root-cause groups within a temporal
/// window.
#[derive(Debug)]
pub struct Grouper {
    window: ChronoDuration,
    groups: HashMap<u64, AlertGroup>,
}

impl Grouper {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: ChronoDuration::from_std(window)
                .unwrap_or_else(|_| ChronoDuration::seconds(600)),
            groups: HashMap::new(),
        }
    }

    /// Register an active root-cause alert so effects can join its group.
    pub fn touch_root(&mut self, fingerprint: u64, kind: AlertKind, now: DateTime<Utc>) {
        if root_cause_effects(kind).is_empty() {
            return;
        }
        let group = self.groups.entry(fingerprint).or_insert_with(|| AlertGroup {
            leader_fingerprint: fingerprint,
            root_cause: kind,
            members: Vec::new(),
            first_seen: now,
            last_seen: now,
        });
        group.last_seen = group.last_seen.max(now);
    }

    /// Find the group an alert of this kind should be absorbed into:
    /// some active root whose effect set contains the kind, within the
    /// grouping window.
    pub fn absorb(
        &mut self,
        kind: AlertKind,
        fingerprint: u64,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        self.evict(now);
        let group = self
            .groups
            .values_mut()
            .find(|g| root_cause_effects(g.root_cause).contains(&kind))?;
        if !group.members.contains(&fingerprint) {
            group.members.push(fingerprint);
        }
        group.last_seen = group.last_seen.max(now);
        Some(group.leader_fingerprint)
    }

    pub fn drop_root(&mut self, fingerprint: u64) {
        self.groups.remove(&fingerprint);
    }

    pub fn active_groups(&self) -> impl Iterator<Item = &AlertGroup> {
        self.groups.values()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.groups.retain(|_, g| now.signed_duration_since(g.last_seen) <= window);
    }
}
