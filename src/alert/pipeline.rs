use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::alert::{
    fingerprint, AdaptiveBaseline, AlertEntity, AlertKind, AlertState, Deduplicator, DedupDecision,
    FatigueTracker, Grouper, Priority, Severity, TokenBucket,
};
use crate::app::EngineContext;
use crate::config::{Config, QuietHours, SmartAlertConfig};
use crate::sched::worker_interval;
use crate::state::{DnsScoreBucket, StatsSnapshot};

/// Consecutive clear evaluations before an active alert auto-recovers
const RECOVERY_CLEAR_EVALS: u32 = 3;

/// One threshold crossing observed this evaluation
struct Condition {
    kind: AlertKind,
    severity: Severity,
    message: String,
}

/// What one evaluation produced
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Alerts that became visible (or re-emitted) this evaluation
    pub emitted: Vec<AlertEntity>,
    /// Kinds whose sound should fire (quiet hours already applied)
    pub sounds: Vec<AlertKind>,
    /// Current alert set for the repository board
    pub active: Vec<AlertEntity>,
    /// Alerts that recovered and moved to history this evaluation
    pub archived: Vec<AlertEntity>,
}

/// Transforms raw threshold crossings into a low-noise alert stream.
/// Stages per evaluation: adaptive thresholds, per-fingerprint rate
/// limit, priority scoring, dedup, root-cause grouping, recovery,
/// fatigue suppression and quiet hours.
pub struct SmartAlertPipeline {
    smart: SmartAlertConfig,
    quiet_hours: Option<QuietHours>,
    sound_enabled: bool,
    target: String,

    static_latency: f64,
    static_jitter: f64,
    static_loss: f64,

    latency_baseline: AdaptiveBaseline,
    jitter_baseline: AdaptiveBaseline,
    loss_baseline: AdaptiveBaseline,

    dedup: Deduplicator,
    grouper: Grouper,
    fatigue: FatigueTracker,
    buckets: HashMap<u64, TokenBucket>,
    alerts: HashMap<u64, AlertEntity>,
}

impl SmartAlertPipeline {
    pub fn new(config: &Config) -> Self {
        let smart = config.smart.clone();
        Self {
            quiet_hours: config.quiet_hours,
            sound_enabled: config.enable_sound_alerts,
            target: config.target.clone(),
            static_latency: config.avg_latency_threshold,
            static_jitter: config.jitter_threshold,
            static_loss: config.packet_loss_threshold,
            latency_baseline: AdaptiveBaseline::new(smart.baseline_window_hours, smart.min_samples),
            jitter_baseline: AdaptiveBaseline::new(smart.baseline_window_hours, smart.min_samples),
            loss_baseline: AdaptiveBaseline::new(smart.baseline_window_hours, smart.min_samples),
            dedup: Deduplicator::new(smart.dedup_window, smart.similarity_threshold),
            grouper: Grouper::new(smart.group_window),
            fatigue: FatigueTracker::default(),
            buckets: HashMap::new(),
            alerts: HashMap::new(),
            smart,
        }
    }

    pub fn evaluate(&mut self, snap: &StatsSnapshot, now: DateTime<Utc>) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::default();

        // 1. adaptive thresholds: feed the baselines, then derive bounds
        let loss30 = snap.recent_loss_pct();
        let avg_latency = snap.avg_latency_ms();
        if snap.counters.ok > 0 {
            self.latency_baseline.push(now, avg_latency);
            self.jitter_baseline.push(now, snap.jitter_ms);
        }
        if snap.counters.sent > 0 {
            self.loss_baseline.push(now, loss30);
        }
        let latency_thr =
            self.latency_baseline.threshold_sigma(self.static_latency, self.smart.adaptive_sigma);
        let jitter_thr =
            self.jitter_baseline.threshold_sigma(self.static_jitter, self.smart.adaptive_sigma);
        let loss_thr = self.loss_baseline.threshold_p95(self.static_loss);

        let conditions = self.derive_conditions(snap, loss30, avg_latency, latency_thr, jitter_thr, loss_thr);
        let active_kinds: HashSet<AlertKind> = conditions.iter().map(|c| c.kind).collect();

        // root causes register first so effects can group this same tick
        for cond in &conditions {
            let fp = fingerprint(cond.kind, &self.target);
            self.grouper.touch_root(fp, cond.kind, now);
        }

        for cond in conditions {
            self.apply_condition(cond, now, &mut outcome);
        }

        // 6. recovery: three consecutive clear evaluations end the incident
        let mut recovered: Vec<u64> = Vec::new();
        for (fp, alert) in self.alerts.iter_mut() {
            if active_kinds.contains(&alert.kind) {
                continue;
            }
            alert.clear_streak += 1;
            if alert.clear_streak >= RECOVERY_CLEAR_EVALS {
                recovered.push(*fp);
            }
        }
        for fp in recovered {
            if let Some(mut alert) = self.alerts.remove(&fp) {
                alert.state = AlertState::Recovered;
                self.fatigue.reset(fp);
                self.dedup.forget(fp);
                self.grouper.drop_root(fp);
                debug!(kind = alert.kind.as_str(), "alert recovered");
                let mut archived = alert;
                archived.state = AlertState::Archived;
                outcome.archived.push(archived);
            }
        }

        // 3. re-score active alerts with their real age so the time
        // term grows with the incident; entries past the escalation
        // threshold move one further level. Priority never drops while
        // the incident lasts.
        for alert in self.alerts.values_mut() {
            if alert.state != AlertState::Active {
                continue;
            }
            let age = now.signed_duration_since(alert.created_at);
            let mut scored = score_priority(alert.kind, age, &self.smart);
            if age.to_std().unwrap_or_default() >= self.smart.escalation_after {
                scored = bump(scored);
            }
            alert.priority = alert.priority.max(scored);
        }

        let mut active: Vec<AlertEntity> = self.alerts.values().cloned().collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.severity.cmp(&a.severity)));
        outcome.active = active;
        outcome
    }

    fn apply_condition(&mut self, cond: Condition, now: DateTime<Utc>, outcome: &mut PipelineOutcome) {
        let fp = fingerprint(cond.kind, &self.target);
        let decision = self.dedup.observe(fp, cond.kind, &cond.message, now);

        if let Some(state) = self.alerts.get(&fp).map(|a| a.state) {
            // 7. fatigue: re-emission only on the escalation schedule,
            // then the rate limiter takes its token
            let emit = match state {
                AlertState::Active => self.fatigue.should_emit(fp, now) && self.bucket(fp, now),
                // a rate-limited newcomer gets promoted once capacity frees up
                AlertState::Pending => self.bucket(fp, now) && self.fatigue.should_emit(fp, now),
                _ => false,
            };

            // 4. duplicate of an ongoing incident: bump instead of emit
            let alert = self.alerts.get_mut(&fp).expect("checked above");
            alert.touch(now);
            alert.clear_streak = 0;
            alert.severity = alert.severity.max(cond.severity);
            alert.message = cond.message;
            if let DedupDecision::Duplicate(count) = decision {
                alert.suppress_count = count;
            }
            if emit {
                alert.state = AlertState::Active;
                let (snapshot, severity, kind) = (alert.clone(), alert.severity, alert.kind);
                outcome.emitted.push(snapshot);
                self.push_sound(severity, kind, now, outcome);
            }
            return;
        }

        // fresh incident
        let mut alert = AlertEntity::new(cond.kind, cond.severity, &self.target, cond.message, now);
        // 3. priority scoring
        alert.priority = score_priority(cond.kind, chrono::Duration::zero(), &self.smart);

        // 5. grouping: an active root cause absorbs its effects
        if let Some(leader) = self.grouper.absorb(cond.kind, fp, now) {
            alert.group = Some(leader);
            alert.state = AlertState::Active;
            alert.suppress_count += 1;
            self.alerts.insert(fp, alert);
            return;
        }

        // near-duplicate of some other live alert text: record, stay quiet
        if matches!(decision, DedupDecision::Duplicate(_)) {
            alert.suppress_count += 1;
            alert.state = AlertState::Pending;
            self.alerts.insert(fp, alert);
            return;
        }

        // 2. rate limit gate for the first emission
        if self.bucket(fp, now) && self.fatigue.should_emit(fp, now) {
            alert.state = AlertState::Active;
            outcome.emitted.push(alert.clone());
            self.push_sound(alert.severity, alert.kind, now, outcome);
        } else {
            alert.state = AlertState::Pending;
        }
        self.alerts.insert(fp, alert);
    }

    fn derive_conditions(
        &self,
        snap: &StatsSnapshot,
        loss30: f64,
        avg_latency: f64,
        latency_thr: f64,
        jitter_thr: f64,
        loss_thr: f64,
    ) -> Vec<Condition> {
        let mut conditions = Vec::new();
        if snap.connection_lost {
            conditions.push(Condition {
                kind: AlertKind::ConnectionLost,
                severity: Severity::Critical,
                message: format!(
                    "connection lost: {} consecutive probes failed",
                    snap.counters.consecutive_lost
                ),
            });
        }
        if snap.counters.sent > 0 && loss30 > loss_thr {
            conditions.push(Condition {
                kind: AlertKind::PacketLoss,
                severity: Severity::Warning,
                message: format!("packet loss {loss30:.1}% over the recent window"),
            });
        }
        if snap.counters.ok > 0 && avg_latency > latency_thr {
            conditions.push(Condition {
                kind: AlertKind::HighLatency,
                severity: Severity::Warning,
                message: format!("average latency {avg_latency:.1} ms above {latency_thr:.0} ms"),
            });
        }
        if snap.counters.ok > 0 && snap.jitter_ms > jitter_thr {
            conditions.push(Condition {
                kind: AlertKind::HighJitter,
                severity: Severity::Warning,
                message: format!("jitter {:.1} ms above {jitter_thr:.0} ms", snap.jitter_ms),
            });
        }
        if snap.mtu.issue {
            conditions.push(Condition {
                kind: AlertKind::MtuIssue,
                severity: Severity::Warning,
                message: format!(
                    "path MTU {} below local MTU {}",
                    snap.mtu.path_mtu.unwrap_or(0),
                    snap.mtu.local_mtu.unwrap_or(0)
                ),
            });
        }
        if matches!(snap.dns_bucket, Some(DnsScoreBucket::Poor) | Some(DnsScoreBucket::Critical)) {
            conditions.push(Condition {
                kind: AlertKind::DnsFailure,
                severity: Severity::Warning,
                message: format!("dns health degraded, score {:.0}", snap.dns_score.unwrap_or(0.0)),
            });
        }
        conditions
    }

    fn bucket(&mut self, fp: u64, now: DateTime<Utc>) -> bool {
        let smart = &self.smart;
        self.buckets
            .entry(fp)
            .or_insert_with(|| TokenBucket::new(smart.rate_limit_per_minute, smart.rate_limit_burst, now))
            .try_take(now)
    }

    /// 8. quiet hours mute sound; visual entries are unaffected
    fn push_sound(
        &self,
        severity: Severity,
        kind: AlertKind,
        now: DateTime<Utc>,
        outcome: &mut PipelineOutcome,
    ) {
        if severity < Severity::Critical || !self.sound_enabled {
            return;
        }
        if let Some(quiet) = self.quiet_hours {
            use chrono::Timelike;
            if quiet.contains(now.hour()) {
                return;
            }
        }
        outcome.sounds.push(kind);
    }

    pub fn active_len(&self) -> usize {
        self.alerts.len()
    }
}

fn bump(priority: Priority) -> Priority {
    match priority {
        Priority::Low => Priority::Medium,
        Priority::Medium => Priority::High,
        Priority::High | Priority::Critical => Priority::Critical,
    }
}

/// `0.4·business + 0.3·user + 0.2·service-criticality + 0.1·time`
fn score_priority(kind: AlertKind, age: chrono::Duration, smart: &SmartAlertConfig) -> Priority {
    let (business, user) = match kind {
        AlertKind::ConnectionLost => (1.0, 1.0),
        AlertKind::PacketLoss => (0.7, 0.8),
        AlertKind::HighLatency => (0.6, 0.7),
        AlertKind::HighJitter => (0.5, 0.6),
        AlertKind::MtuIssue => (0.5, 0.6),
        AlertKind::RouteChange => (0.4, 0.3),
        AlertKind::DnsFailure => (0.8, 0.9),
        AlertKind::IpChange => (0.3, 0.2),
        AlertKind::HopIssue => (0.5, 0.4),
        AlertKind::UpdateAvailable => (0.1, 0.1),
    };
    let criticality = match kind {
        AlertKind::ConnectionLost | AlertKind::PacketLoss | AlertKind::HighLatency
        | AlertKind::HighJitter => 1.0,
        AlertKind::DnsFailure => 0.8,
        AlertKind::RouteChange => 0.7,
        AlertKind::MtuIssue | AlertKind::HopIssue => 0.6,
        AlertKind::IpChange => 0.5,
        AlertKind::UpdateAvailable => 0.2,
    };
    let escalation_secs = smart.escalation_after.as_secs_f64().max(1.0);
    let time_factor = (age.num_seconds().max(0) as f64 / escalation_secs).min(1.0);
    let score = 0.4 * business + 0.3 * user + 0.2 * criticality + 0.1 * time_factor;
    if score >= 0.8 {
        Priority::Critical
    } else if score >= 0.6 {
        Priority::High
    } else if score >= 0.4 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Periodic evaluation against fresh snapshots; publishes the visible
/// set to the repository board and fires sounds.
pub async fn run_alert_worker(ctx: EngineContext) {
    let mut pipeline = SmartAlertPipeline::new(&ctx.config);
    let mut ticker = worker_interval(ctx.config.alert_cooldown);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !ctx.config.smart.enabled {
                    continue;
                }
                let now = Utc::now();
                let snap = ctx.repo.snapshot();
                let outcome = pipeline.evaluate(&snap, now);
                for kind in &outcome.sounds {
                    ctx.repo.trigger_alert_sound(*kind);
                }
                ctx.repo.publish_alerts(outcome.active, outcome.archived);
                ctx.repo.clean_old_alerts(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ErrorKind, Sample, StatsRepository};
    use chrono::Duration as ChronoDuration;

    fn pipeline() -> SmartAlertPipeline {
        SmartAlertPipeline::new(&Config::default())
    }

    fn snapshot(ok: usize, lost: usize) -> StatsSnapshot {
        let repo = StatsRepository::new(&Config::default());
        for _ in 0..ok {
            repo.record_ping_result(Sample::ok(Utc::now(), 20.0));
        }
        for _ in 0..lost {
            repo.record_ping_result(Sample::failed(Utc::now(), ErrorKind::TransientIo));
        }
        repo.snapshot()
    }

    #[test]
    fn test_healthy_snapshot_no_alerts() {
        let mut p = pipeline();
        let outcome = p.evaluate(&snapshot(600, 0), Utc::now());
        assert!(outcome.emitted.is_empty());
        assert!(outcome.active.is_empty());
    }

    #[test]
    fn test_connection_lost_emits_critical() {
        let mut p = pipeline();
        let outcome = p.evaluate(&snapshot(100, 6), Utc::now());
        let lost: Vec<_> = outcome
            .emitted
            .iter()
            .filter(|a| a.kind == AlertKind::ConnectionLost)
            .collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].severity, Severity::Critical);
        assert_eq!(lost[0].priority, Priority::Critical);
        assert_eq!(outcome.sounds, vec![AlertKind::ConnectionLost]);
    }

    #[test]
    fn test_connection_lost_groups_packet_loss() {
        let mut p = pipeline();
        // heavy loss: both conditions fire, loss joins the root group
        let outcome = p.evaluate(&snapshot(10, 30), Utc::now());
        let loss = outcome.active.iter().find(|a| a.kind == AlertKind::PacketLoss).unwrap();
        let root = outcome.active.iter().find(|a| a.kind == AlertKind::ConnectionLost).unwrap();
        assert_eq!(loss.group, Some(root.fingerprint));
        // the grouped effect never emitted on its own
        assert!(outcome.emitted.iter().all(|a| a.kind != AlertKind::PacketLoss));
    }

    #[test]
    fn test_fatigue_limits_re_emissions() {
        let mut p = pipeline();
        let snap = snapshot(100, 10);
        let base = Utc::now();
        let mut emissions = 0;
        // a 30-minute outage evaluated every 5 seconds
        for tick in 0..360 {
            let outcome = p.evaluate(&snap, base + ChronoDuration::seconds(tick * 5));
            emissions += outcome
                .emitted
                .iter()
                .filter(|a| a.kind == AlertKind::ConnectionLost)
                .count();
        }
        assert!(emissions <= 6, "got {emissions} visible emissions");
        assert!(emissions >= 2);
    }

    #[test]
    fn test_recovery_after_three_clear_evaluations() {
        let mut p = pipeline();
        let base = Utc::now();
        p.evaluate(&snapshot(100, 6), base);
        assert_eq!(p.active_len(), 1);

        let healthy = snapshot(600, 0);
        let o1 = p.evaluate(&healthy, base + ChronoDuration::seconds(5));
        assert!(o1.archived.is_empty());
        let o2 = p.evaluate(&healthy, base + ChronoDuration::seconds(10));
        assert!(o2.archived.is_empty());
        let o3 = p.evaluate(&healthy, base + ChronoDuration::seconds(15));
        assert_eq!(o3.archived.len(), 1);
        assert_eq!(o3.archived[0].state, AlertState::Archived);
        assert_eq!(p.active_len(), 0);
    }

    #[test]
    fn test_recovered_incident_can_fire_again() {
        let mut p = pipeline();
        let base = Utc::now();
        p.evaluate(&snapshot(100, 6), base);
        let healthy = snapshot(600, 0);
        for i in 1..=3 {
            p.evaluate(&healthy, base + ChronoDuration::seconds(i * 5));
        }
        // a new outage an hour later emits immediately again
        let outcome = p.evaluate(&snapshot(100, 6), base + ChronoDuration::hours(1));
        assert_eq!(
            outcome.emitted.iter().filter(|a| a.kind == AlertKind::ConnectionLost).count(),
            1
        );
    }

    #[test]
    fn test_quiet_hours_mute_sound_keep_visual() {
        let mut config = Config::default();
        config.quiet_hours = Some(QuietHours { start_hour: 0, end_hour: 24 });
        let mut p = SmartAlertPipeline::new(&config);
        let outcome = p.evaluate(&snapshot(100, 6), Utc::now());
        assert!(outcome.sounds.is_empty());
        assert!(!outcome.emitted.is_empty());
    }

    #[test]
    fn test_dns_degradation_single_alert() {
        let mut p = pipeline();
        let mut snap = snapshot(600, 0);
        snap.dns_score = Some(20.0);
        snap.dns_bucket = Some(DnsScoreBucket::Poor);
        let base = Utc::now();
        let first = p.evaluate(&snap, base);
        assert_eq!(first.emitted.len(), 1);
        assert_eq!(first.emitted[0].kind, AlertKind::DnsFailure);
        // repeats collapse into the same entity
        let second = p.evaluate(&snap, base + ChronoDuration::seconds(5));
        assert!(second.emitted.is_empty());
        assert_eq!(second.active.len(), 1);
        assert!(second.active[0].suppress_count >= 1);
    }

    #[test]
    fn test_priority_scores() {
        let smart = SmartAlertConfig::default();
        assert_eq!(
            score_priority(AlertKind::ConnectionLost, chrono::Duration::zero(), &smart),
            Priority::Critical
        );
        assert_eq!(
            score_priority(AlertKind::PacketLoss, chrono::Duration::zero(), &smart),
            Priority::High
        );
        assert_eq!(
            score_priority(AlertKind::UpdateAvailable, chrono::Duration::zero(), &smart),
            Priority::Low
        );
    }

    #[test]
    fn test_time_term_raises_score_with_age() {
        let smart = SmartAlertConfig::default();
        let full_age = chrono::Duration::from_std(smart.escalation_after).unwrap();
        // at age zero the loss alert scores High; a full escalation
        // window of age pushes the time term to 1 and the score past
        // the critical bound
        assert_eq!(
            score_priority(AlertKind::PacketLoss, chrono::Duration::zero(), &smart),
            Priority::High
        );
        assert_eq!(score_priority(AlertKind::PacketLoss, full_age, &smart), Priority::Critical);
        // half the window is not enough to cross it
        assert_eq!(score_priority(AlertKind::PacketLoss, full_age / 2, &smart), Priority::High);
    }

    #[test]
    fn test_escalation_bumps_priority() {
        let mut config = Config::default();
        config.smart.escalation_after = std::time::Duration::from_secs(60);
        let mut p = SmartAlertPipeline::new(&config);
        let base = Utc::now();
        let mut snap = snapshot(600, 0);
        snap.mtu.issue = true;
        snap.mtu.local_mtu = Some(1500);
        snap.mtu.path_mtu = Some(1300);

        let first = p.evaluate(&snap, base);
        let before = first.active[0].priority;
        let later = p.evaluate(&snap, base + ChronoDuration::seconds(120));
        let after = later.active[0].priority;
        assert!(after > before, "{before:?} -> {after:?}");
    }
}
