use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::alert::{AlertEntity, AlertKind, AlertState, Severity};
use crate::config::Config;
use crate::state::snapshot::StatsSnapshot;
use crate::state::types::{
    Counters, DnsBenchmarkStats, DnsRecordStatus, DnsScoreBucket, ErrorKind, HopStatus, MtuState,
    ProblemDiagnosis, PublicIp, Route, RouteStats, Sample, TtlState,
};

/// Smoothing factor for the exponential-moving-average jitter
const JITTER_ALPHA: f64 = 0.1;

/// How long direct (worker-raised) info alerts stay visible
const INFO_ALERT_DISPLAY_SECS: i64 = 60;

/// Connection state flip observed while committing a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTransition {
    Lost,
    Recovered,
}

#[derive(Debug)]
struct StatsInner {
    target: String,
    started_at: DateTime<Utc>,
    counters: Counters,
    last_ok: Option<bool>,
    last_rtt_ms: Option<f64>,
    last_sample_at: Option<DateTime<Utc>>,
    first_tick_done: bool,
    connection_lost: bool,

    min_latency_ms: Option<f64>,
    max_latency_ms: Option<f64>,
    latency_sum_ms: f64,
    latencies: VecDeque<f64>,
    jitter_ms: f64,
    jitter_history: VecDeque<f64>,
    recent_results: VecDeque<bool>,

    public_ip: PublicIp,
    mtu: MtuState,
    ttl: TtlState,

    route: Option<Route>,
    route_changed: bool,
    route_change_count: u64,
    route_problematic_hop: Option<u32>,
    route_candidate_fp: Option<u64>,
    route_candidate_run: u32,
    hops: Vec<HopStatus>,
    hops_discovering: bool,
    route_stats: RouteStats,

    dns_records: Vec<DnsRecordStatus>,
    dns_benchmark: Vec<DnsBenchmarkStats>,
    dns_score: Option<f64>,
    dns_bucket: Option<DnsScoreBucket>,

    problem: ProblemDiagnosis,

    latest_version: Option<String>,
    update_available: bool,
}

#[derive(Debug, Default)]
struct AlertBoard {
    active: Vec<AlertEntity>,
    history: VecDeque<AlertEntity>,
    sounds_emitted: u64,
    last_sound: Option<(AlertKind, DateTime<Utc>)>,
}

/// Single source of truth for all monitoring state. Every mutator takes
/// the write lock for a short critical section and never performs I/O
/// while holding it; readers get deep `StatsSnapshot` copies.
///
/// The alert sub-state sits behind its own finer-grained mutex so the
/// alert pipeline can publish without contending with probe commits.
pub struct StatsRepository {
    inner: RwLock<StatsInner>,
    alerts: Mutex<AlertBoard>,
    latency_window: usize,
    loss_window: usize,
    consecutive_loss_threshold: u32,
    mtu_issue_consecutive: u32,
    mtu_clear_consecutive: u32,
    route_change_consecutive: u32,
    max_alerts_history: usize,
}

impl StatsRepository {
    pub fn new(config: &Config) -> Self {
        let now = Utc::now();
        Self {
            inner: RwLock::new(StatsInner {
                target: config.target.clone(),
                started_at: now,
                counters: Counters::default(),
                last_ok: None,
                last_rtt_ms: None,
                last_sample_at: None,
                first_tick_done: false,
                connection_lost: false,
                min_latency_ms: None,
                max_latency_ms: None,
                latency_sum_ms: 0.0,
                latencies: VecDeque::with_capacity(config.latency_window.min(1024)),
                jitter_ms: 0.0,
                jitter_history: VecDeque::with_capacity(config.latency_window.min(1024)),
                recent_results: VecDeque::with_capacity(config.window_size.min(4096)),
                public_ip: PublicIp::default(),
                mtu: MtuState::default(),
                ttl: TtlState::default(),
                route: None,
                route_changed: false,
                route_change_count: 0,
                route_problematic_hop: None,
                route_candidate_fp: None,
                route_candidate_run: 0,
                hops: Vec::new(),
                hops_discovering: false,
                route_stats: RouteStats::empty(now),
                dns_records: Vec::new(),
                dns_benchmark: Vec::new(),
                dns_score: None,
                dns_bucket: None,
                problem: ProblemDiagnosis::none(now),
                latest_version: None,
                update_available: false,
            }),
            alerts: Mutex::new(AlertBoard::default()),
            latency_window: config.latency_window,
            loss_window: config.window_size,
            consecutive_loss_threshold: config.consecutive_loss_threshold,
            mtu_issue_consecutive: config.mtu_issue_consecutive,
            mtu_clear_consecutive: config.mtu_clear_consecutive,
            route_change_consecutive: config.route_change_consecutive,
            max_alerts_history: config.max_alerts_history,
        }
    }

    /// Commit one ping sample: counters, latency window, EMA jitter,
    /// consecutive-loss state and the connection-lost flag, atomically.
    /// Returns the connection transition when the flag flipped.
    pub fn record_ping_result(&self, sample: Sample) -> Option<ConnectionTransition> {
        let mut inner = self.inner.write();
        inner.last_sample_at = Some(sample.at);
        inner.first_tick_done = true;

        if sample.error == Some(ErrorKind::Cancelled) {
            // Recorded for liveness, but never counted as packet loss
            return None;
        }

        inner.counters.sent += 1;
        inner.last_ok = Some(sample.ok);

        let mut transition = None;
        if sample.ok {
            inner.counters.ok += 1;
            inner.counters.consecutive_lost = 0;
            if inner.connection_lost {
                inner.connection_lost = false;
                transition = Some(ConnectionTransition::Recovered);
            }

            if let Some(rtt) = sample.rtt_ms {
                let rtt = if rtt < 0.0 {
                    warn!(rtt, "negative rtt clamped to zero");
                    0.0
                } else {
                    rtt
                };
                inner.last_rtt_ms = Some(rtt);
                inner.latency_sum_ms += rtt;
                inner.min_latency_ms = Some(inner.min_latency_ms.map_or(rtt, |m| m.min(rtt)));
                inner.max_latency_ms = Some(inner.max_latency_ms.map_or(rtt, |m| m.max(rtt)));

                if let Some(&prev) = inner.latencies.back() {
                    let diff = (rtt - prev).abs();
                    inner.jitter_ms = JITTER_ALPHA * diff + (1.0 - JITTER_ALPHA) * inner.jitter_ms;
                }
                inner.latencies.push_back(rtt);
                if inner.latencies.len() > self.latency_window {
                    inner.latencies.pop_front();
                }
                let jitter = inner.jitter_ms;
                inner.jitter_history.push_back(jitter);
                if inner.jitter_history.len() > self.latency_window {
                    inner.jitter_history.pop_front();
                }
            } else {
                inner.last_rtt_ms = None;
            }
        } else {
            inner.counters.lost += 1;
            inner.counters.consecutive_lost += 1;
            inner.counters.max_consecutive_lost = inner
                .counters
                .max_consecutive_lost
                .max(inner.counters.consecutive_lost);
            inner.last_rtt_ms = None;

            if !inner.connection_lost
                && inner.counters.consecutive_lost >= self.consecutive_loss_threshold
            {
                inner.connection_lost = true;
                transition = Some(ConnectionTransition::Lost);
            }
        }

        inner.recent_results.push_back(sample.ok);
        if inner.recent_results.len() > self.loss_window {
            inner.recent_results.pop_front();
        }

        debug_assert_eq!(inner.counters.sent, inner.counters.ok + inner.counters.lost);
        transition
    }

    pub fn record_ttl(&self, ttl: Option<u32>, estimated_hops: Option<u32>) {
        let mut inner = self.inner.write();
        if ttl.is_some() {
            inner.ttl.last_ttl = ttl;
            inner.ttl.estimated_hops = estimated_hops;
        }
    }

    /// Record the measured MTU values without touching the issue flag.
    pub fn update_mtu_values(&self, local_mtu: Option<u32>, path_mtu: Option<u32>) {
        let mut inner = self.inner.write();
        inner.mtu.local_mtu = local_mtu;
        inner.mtu.path_mtu = path_mtu;
    }

    /// Feed one MTU observation through the hysteresis state machine.
    /// Returns `(state_changed, new_state)`. The very first observation
    /// publishes immediately so the UI shows a value without waiting for
    /// the consecutive run.
    pub fn update_mtu_hysteresis(&self, issue_now: bool) -> (bool, bool) {
        let mut inner = self.inner.write();
        let now = Utc::now();

        if !inner.mtu.probed {
            inner.mtu.probed = true;
            inner.mtu.consecutive_issue = u32::from(issue_now);
            inner.mtu.consecutive_clear = u32::from(!issue_now);
            let changed = inner.mtu.issue != issue_now;
            inner.mtu.issue = issue_now;
            if changed {
                inner.mtu.last_change = Some(now);
            }
            return (changed, issue_now);
        }

        if issue_now {
            inner.mtu.consecutive_issue += 1;
            inner.mtu.consecutive_clear = 0;
            if !inner.mtu.issue && inner.mtu.consecutive_issue >= self.mtu_issue_consecutive {
                inner.mtu.issue = true;
                inner.mtu.last_change = Some(now);
                return (true, true);
            }
        } else {
            inner.mtu.consecutive_clear += 1;
            inner.mtu.consecutive_issue = 0;
            if inner.mtu.issue && inner.mtu.consecutive_clear >= self.mtu_clear_consecutive {
                inner.mtu.issue = false;
                inner.mtu.last_change = Some(now);
                return (true, false);
            }
        }
        (false, inner.mtu.issue)
    }

    /// Feed one route fingerprint through the hysteresis state machine.
    /// A change is committed only after the configured number of
    /// consecutive identical detections. Returns `(committed, run)`.
    pub fn update_route_hysteresis(&self, new_fingerprint: u64) -> (bool, u32) {
        let mut inner = self.inner.write();

        let committed = inner.route.as_ref().map(|r| r.fingerprint);
        match committed {
            None => {
                // first discovery commits unconditionally
                inner.route_candidate_fp = None;
                inner.route_candidate_run = 0;
                (true, 0)
            }
            Some(fp) if fp == new_fingerprint => {
                inner.route_candidate_fp = None;
                inner.route_candidate_run = 0;
                if inner.route_changed {
                    inner.route_changed = false;
                }
                (false, 0)
            }
            Some(_) => {
                if inner.route_candidate_fp == Some(new_fingerprint) {
                    inner.route_candidate_run += 1;
                } else {
                    inner.route_candidate_fp = Some(new_fingerprint);
                    inner.route_candidate_run = 1;
                }
                let run = inner.route_candidate_run;
                if run >= self.route_change_consecutive {
                    inner.route_candidate_fp = None;
                    inner.route_candidate_run = 0;
                    inner.route_changed = true;
                    inner.route_change_count += 1;
                    (true, run)
                } else {
                    (false, run)
                }
            }
        }
    }

    pub fn update_route(&self, route: Route, problematic_hop: Option<u32>) {
        let mut inner = self.inner.write();
        inner.route = Some(route);
        inner.route_problematic_hop = problematic_hop;
    }

    pub fn set_route_problematic(&self, hop: Option<u32>) {
        self.inner.write().route_problematic_hop = hop;
    }

    pub fn update_hops(&self, hops: Vec<HopStatus>, discovering: bool) {
        let mut inner = self.inner.write();
        inner.hops = hops;
        inner.hops_discovering = discovering;
    }

    pub fn update_route_stats(&self, stats: RouteStats) {
        self.inner.write().route_stats = stats;
    }

    pub fn update_dns_records(&self, records: Vec<DnsRecordStatus>) {
        self.inner.write().dns_records = records;
    }

    pub fn update_dns_benchmark(&self, benchmark: Vec<DnsBenchmarkStats>) {
        self.inner.write().dns_benchmark = benchmark;
    }

    pub fn set_dns_score(&self, score: f64, bucket: DnsScoreBucket) {
        let mut inner = self.inner.write();
        let clamped = score.clamp(0.0, 100.0);
        if clamped != score {
            warn!(score, "dns score clamped into 0..=100");
        }
        inner.dns_score = Some(clamped);
        inner.dns_bucket = Some(bucket);
    }

    /// Accept a validated public IP observation. Returns `(old, new)`
    /// when the address actually changed.
    pub fn update_public_ip(
        &self,
        ip: std::net::IpAddr,
        country: Option<String>,
        country_code: Option<String>,
        provider: String,
    ) -> Option<(std::net::IpAddr, std::net::IpAddr)> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let change = match inner.public_ip.ip {
            Some(old) if old != ip => Some((old, ip)),
            _ => None,
        };
        if let Some((old, _)) = change {
            inner.public_ip.previous = Some(old);
            inner.public_ip.changed_at = Some(now);
        }
        inner.public_ip.ip = Some(ip);
        inner.public_ip.country = country;
        inner.public_ip.country_code = country_code;
        inner.public_ip.provider = Some(provider);
        inner.public_ip.fetched_at = Some(now);
        change
    }

    pub fn update_problem(&self, diagnosis: ProblemDiagnosis) {
        self.inner.write().problem = diagnosis;
    }

    pub fn set_latest_version(&self, latest: Option<String>, up_to_date: bool) {
        let mut inner = self.inner.write();
        inner.update_available = latest.is_some() && !up_to_date;
        inner.latest_version = latest;
    }

    pub fn connection_lost(&self) -> bool {
        self.inner.read().connection_lost
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.inner.read().counters.consecutive_lost
    }

    // ── Alert board ──

    /// Direct path for worker-raised notifications (IP change, route
    /// change, traceroute saved, update available). Merges by
    /// fingerprint so repeats bump last-seen instead of stacking.
    pub fn add_alert(&self, kind: AlertKind, severity: Severity, message: &str) {
        let now = Utc::now();
        let mut board = self.alerts.lock();
        let fp = crate::alert::fingerprint(kind, message);
        if let Some(existing) = board.active.iter_mut().find(|a| a.fingerprint == fp) {
            existing.touch(now);
            existing.suppress_count += 1;
            return;
        }
        let mut alert = AlertEntity::new(kind, severity, message, message.to_string(), now);
        alert.state = AlertState::Active;
        board.active.push(alert);
    }

    /// Replace the pipeline-owned portion of the board. Direct
    /// worker-raised entries are kept.
    pub fn publish_alerts(&self, active: Vec<AlertEntity>, newly_archived: Vec<AlertEntity>) {
        let mut board = self.alerts.lock();
        let pipeline_kinds: Vec<u64> = active.iter().map(|a| a.fingerprint).collect();
        board.active.retain(|a| !pipeline_kinds.contains(&a.fingerprint));
        board.active.extend(active);
        for alert in newly_archived {
            let fp = alert.fingerprint;
            board.active.retain(|a| a.fingerprint != fp);
            board.history.push_back(alert);
        }
        let cap = self.max_alerts_history;
        while board.history.len() > cap {
            board.history.pop_front();
        }
    }

    /// Record an audible alert. Sound policy (enable flag, quiet hours)
    /// is decided by the caller; the repository only keeps the trace.
    pub fn trigger_alert_sound(&self, kind: AlertKind) {
        let mut board = self.alerts.lock();
        board.sounds_emitted += 1;
        board.last_sound = Some((kind, Utc::now()));
    }

    pub fn sounds_emitted(&self) -> u64 {
        self.alerts.lock().sounds_emitted
    }

    /// Expire stale direct info alerts and trim history.
    pub fn clean_old_alerts(&self, now: DateTime<Utc>) {
        let mut board = self.alerts.lock();
        let cutoff = now - ChronoDuration::seconds(INFO_ALERT_DISPLAY_SECS);
        let mut expired: Vec<AlertEntity> = Vec::new();
        board.active.retain(|a| {
            let stale = a.severity == Severity::Info && a.last_seen_at < cutoff;
            if stale {
                let mut archived = a.clone();
                archived.state = AlertState::Archived;
                expired.push(archived);
            }
            !stale
        });
        board.history.extend(expired);
        let cap = self.max_alerts_history;
        while board.history.len() > cap {
            board.history.pop_front();
        }
    }

    pub fn active_alerts(&self) -> Vec<AlertEntity> {
        self.alerts.lock().active.clone()
    }

    // ── Snapshot ──

    /// Consistent deep copy of all reader-visible state.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        let active_alerts = self.alerts.lock().active.clone();
        StatsSnapshot {
            target: inner.target.clone(),
            started_at: inner.started_at,
            counters: inner.counters,
            last_ok: inner.last_ok,
            last_rtt_ms: inner.last_rtt_ms,
            last_sample_at: inner.last_sample_at,
            first_tick_done: inner.first_tick_done,
            connection_lost: inner.connection_lost,
            min_latency_ms: inner.min_latency_ms,
            max_latency_ms: inner.max_latency_ms,
            latency_sum_ms: inner.latency_sum_ms,
            latencies: inner.latencies.iter().copied().collect(),
            jitter_ms: inner.jitter_ms,
            jitter_history: inner.jitter_history.iter().copied().collect(),
            recent_results: inner.recent_results.iter().copied().collect(),
            public_ip: inner.public_ip.clone(),
            mtu: inner.mtu.clone(),
            ttl: inner.ttl,
            route: inner.route.clone(),
            route_changed: inner.route_changed,
            route_change_count: inner.route_change_count,
            route_problematic_hop: inner.route_problematic_hop,
            hops: inner.hops.clone(),
            hops_discovering: inner.hops_discovering,
            route_stats: inner.route_stats.clone(),
            dns_records: inner.dns_records.clone(),
            dns_benchmark: inner.dns_benchmark.clone(),
            dns_score: inner.dns_score,
            dns_bucket: inner.dns_bucket,
            problem: inner.problem.clone(),
            active_alerts,
            latest_version: inner.latest_version.clone(),
            update_available: inner.update_available,
        }
    }
}
