use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::Config;
use crate::state::{
    DnsScoreBucket, Prediction, ProblemDiagnosis, ProblemKind, StatsSnapshot,
};

/// First-hop loss above this marks the problem as local
const FIRST_HOP_LOSS_PCT: f64 = 20.0;

/// Same-kind occurrences within the rolling hour that flag a recurring pattern
const RECURRENCE_THRESHOLD: usize = 3;

const HISTORY_CAP: usize = 100;

/// Turns raw repository signals into a single diagnosis. Evaluated
/// periodically and on demand after connection transitions; the table
/// is checked top-down and the first match wins.
pub struct ProblemClassifier {
    history: VecDeque<(ProblemKind, DateTime<Utc>)>,
    suppression: ChronoDuration,
    packet_loss_threshold: f64,
    consecutive_loss_threshold: u32,
}

impl ProblemClassifier {
    pub fn new(config: &Config) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAP),
            suppression: ChronoDuration::from_std(config.problem_suppression)
                .unwrap_or_else(|_| ChronoDuration::seconds(6000)),
            packet_loss_threshold: config.packet_loss_threshold,
            consecutive_loss_threshold: config.consecutive_loss_threshold,
        }
    }

    pub fn evaluate(&mut self, snap: &StatsSnapshot, now: DateTime<Utc>) -> ProblemDiagnosis {
        let loss30 = snap.recent_loss_pct();
        let first_hop_loss = snap.hops.first().map(|h| h.loss_pct()).unwrap_or(0.0);
        let dns_poor = matches!(
            snap.dns_bucket,
            Some(DnsScoreBucket::Poor) | Some(DnsScoreBucket::Critical)
        );

        let (kind, cause) = if snap.connection_lost
            || snap.counters.consecutive_lost >= self.consecutive_loss_threshold
        {
            (
                ProblemKind::Isp,
                format!("{} consecutive probes lost", snap.counters.consecutive_lost),
            )
        } else if loss30 > self.packet_loss_threshold && first_hop_loss > FIRST_HOP_LOSS_PCT {
            (
                ProblemKind::Local,
                format!("{loss30:.1}% loss with {first_hop_loss:.0}% loss at the first hop"),
            )
        } else if dns_poor && loss30 <= self.packet_loss_threshold {
            (
                ProblemKind::Dns,
                format!("dns score {:.0} with healthy ping", snap.dns_score.unwrap_or(0.0)),
            )
        } else if snap.mtu.issue && loss30 > 0.0 {
            (
                ProblemKind::Mtu,
                format!(
                    "path mtu {} below local {} with intermittent loss",
                    snap.mtu.path_mtu.unwrap_or(0),
                    snap.mtu.local_mtu.unwrap_or(0)
                ),
            )
        } else if loss30 > 0.0 {
            (ProblemKind::Unknown, format!("{loss30:.1}% loss without a clear cause"))
        } else {
            (ProblemKind::None, String::new())
        };

        if kind != ProblemKind::None {
            self.record(kind, now);
        }

        let recurring = self.has_recurring_pattern(now);
        let prediction = if kind != ProblemKind::None || recurring {
            Prediction::Risk
        } else {
            Prediction::Stable
        };

        ProblemDiagnosis { kind, prediction, recurring, evaluated_at: now, cause }
    }

    /// Append to the recurrence history unless the same kind was already
    /// recorded inside the suppression window. The check happens before
    /// appending so a sustained incident does not flood the history.
    fn record(&mut self, kind: ProblemKind, now: DateTime<Utc>) {
        if let Some((last_kind, last_at)) = self.history.back() {
            if *last_kind == kind && now.signed_duration_since(*last_at) < self.suppression {
                return;
            }
        }
        self.history.push_back((kind, now));
        if self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
    }

    /// Any non-none kind seen at least RECURRENCE_THRESHOLD times within
    /// the last rolling hour.
    fn has_recurring_pattern(&self, now: DateTime<Utc>) -> bool {
        let hour_ago = now - ChronoDuration::hours(1);
        let mut counts = std::collections::HashMap::new();
        for (kind, at) in &self.history {
            if *at >= hour_ago {
                *counts.entry(*kind).or_insert(0usize) += 1;
            }
        }
        counts.values().any(|c| *c >= RECURRENCE_THRESHOLD)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Periodic re-evaluation; connection transitions also trigger one
/// synchronously from the ping worker.
pub async fn run_classifier_worker(ctx: crate::app::EngineContext) {
    let period = ctx.config.problem_analysis_interval;
    let cancel = ctx.cancel.clone();
    crate::sched::run_periodic("classifier", period, cancel, move || {
        let ctx = ctx.clone();
        async move {
            ctx.reclassify_now();
            Ok(())
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Sample, StatsRepository};

    fn classifier() -> ProblemClassifier {
        let mut config = Config::default();
        config.problem_suppression = std::time::Duration::from_secs(1);
        ProblemClassifier::new(&config)
    }

    fn snapshot_after(ok: usize, lost: usize) -> StatsSnapshot {
        let repo = StatsRepository::new(&Config::default());
        for _ in 0..ok {
            repo.record_ping_result(Sample::ok(Utc::now(), 20.0));
        }
        for _ in 0..lost {
            repo.record_ping_result(Sample::failed(
                Utc::now(),
                crate::state::ErrorKind::TransientIo,
            ));
        }
        repo.snapshot()
    }

    #[test]
    fn test_stable_link_is_none() {
        let mut clf = classifier();
        let diag = clf.evaluate(&snapshot_after(100, 0), Utc::now());
        assert_eq!(diag.kind, ProblemKind::None);
        assert_eq!(diag.prediction, Prediction::Stable);
        assert!(!diag.recurring);
    }

    #[test]
    fn test_consecutive_losses_classify_isp() {
        let mut clf = classifier();
        let diag = clf.evaluate(&snapshot_after(100, 6), Utc::now());
        assert_eq!(diag.kind, ProblemKind::Isp);
        assert_eq!(diag.prediction, Prediction::Risk);
    }

    #[test]
    fn test_dns_degradation_without_loss() {
        let mut clf = classifier();
        let mut snap = snapshot_after(100, 0);
        snap.dns_score = Some(30.0);
        snap.dns_bucket = Some(DnsScoreBucket::Poor);
        let diag = clf.evaluate(&snap, Utc::now());
        assert_eq!(diag.kind, ProblemKind::Dns);
    }

    #[test]
    fn test_isp_outranks_dns() {
        // table is evaluated top-down: a dead link wins over a bad score
        let mut clf = classifier();
        let mut snap = snapshot_after(100, 6);
        snap.dns_bucket = Some(DnsScoreBucket::Critical);
        let diag = clf.evaluate(&snap, Utc::now());
        assert_eq!(diag.kind, ProblemKind::Isp);
    }

    #[test]
    fn test_mtu_with_intermittent_loss() {
        let mut clf = classifier();
        let mut snap = snapshot_after(199, 1);
        snap.mtu.issue = true;
        snap.mtu.local_mtu = Some(1500);
        snap.mtu.path_mtu = Some(1300);
        let diag = clf.evaluate(&snap, Utc::now());
        assert_eq!(diag.kind, ProblemKind::Mtu);
    }

    #[test]
    fn test_unclear_loss_is_unknown() {
        let mut clf = classifier();
        let snap = snapshot_after(199, 1);
        let diag = clf.evaluate(&snap, Utc::now());
        assert_eq!(diag.kind, ProblemKind::Unknown);
    }

    #[test]
    fn test_recurrence_flags_risk_after_recovery() {
        let mut clf = classifier();
        let bad = snapshot_after(100, 6);
        let good = snapshot_after(100, 0);
        let base = Utc::now();
        // three separate incidents inside the rolling hour
        for i in 0..3 {
            clf.evaluate(&bad, base + ChronoDuration::minutes(i * 10));
        }
        let diag = clf.evaluate(&good, base + ChronoDuration::minutes(35));
        assert_eq!(diag.kind, ProblemKind::None);
        assert!(diag.recurring);
        assert_eq!(diag.prediction, Prediction::Risk);
    }

    #[test]
    fn test_suppression_window_limits_history() {
        let mut config = Config::default();
        config.problem_suppression = std::time::Duration::from_secs(600);
        let mut clf = ProblemClassifier::new(&config);
        let bad = snapshot_after(100, 6);
        let base = Utc::now();
        // five evaluations one minute apart, all inside the window
        for i in 0..5 {
            clf.evaluate(&bad, base + ChronoDuration::minutes(i));
        }
        assert_eq!(clf.history_len(), 1);
    }
}
