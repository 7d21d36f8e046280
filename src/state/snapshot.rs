use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::{AlertEntity, AlertState};
use crate::state::types::{
    Counters, DnsBenchmarkStats, DnsRecordStatus, DnsScoreBucket, HopStatus, MtuState,
    ProblemDiagnosis, PublicIp, Route, RouteStats, TtlState,
};

/// Immutable view over the whole repository. This is the only object
/// shared with the UI, the metrics exporter and the health endpoint;
/// mutating a snapshot can never affect subsequent repository reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub counters: Counters,
    pub last_ok: Option<bool>,
    pub last_rtt_ms: Option<f64>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub first_tick_done: bool,
    pub connection_lost: bool,

    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub latency_sum_ms: f64,
    pub latencies: Vec<f64>,
    pub jitter_ms: f64,
    pub jitter_history: Vec<f64>,
    /// true = ok, false = lost; bounded by WINDOW_SIZE (the 30-minute view)
    pub recent_results: Vec<bool>,

    pub public_ip: PublicIp,
    pub mtu: MtuState,
    pub ttl: TtlState,

    pub route: Option<Route>,
    pub route_changed: bool,
    pub route_change_count: u64,
    pub route_problematic_hop: Option<u32>,
    pub hops: Vec<HopStatus>,
    pub hops_discovering: bool,
    pub route_stats: RouteStats,

    pub dns_records: Vec<DnsRecordStatus>,
    pub dns_benchmark: Vec<DnsBenchmarkStats>,
    pub dns_score: Option<f64>,
    pub dns_bucket: Option<DnsScoreBucket>,

    pub problem: ProblemDiagnosis,
    pub active_alerts: Vec<AlertEntity>,

    pub latest_version: Option<String>,
    pub update_available: bool,
}

impl StatsSnapshot {
    /// Average latency over all successful pings
    pub fn avg_latency_ms(&self) -> f64 {
        if self.counters.ok == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.counters.ok as f64
        }
    }

    /// Loss percentage over the bounded recent window (the 30-minute view)
    pub fn recent_loss_pct(&self) -> f64 {
        if self.recent_results.is_empty() {
            return 0.0;
        }
        let lost = self.recent_results.iter().filter(|ok| !**ok).count();
        lost as f64 / self.recent_results.len() as f64 * 100.0
    }

    /// Liveness rule for the health surface: at least one sample within
    /// the given window.
    pub fn is_live(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.last_sample_at {
            Some(at) => now.signed_duration_since(at) <= window,
            None => false,
        }
    }

    pub fn visible_alerts(&self) -> impl Iterator<Item = &AlertEntity> {
        self.active_alerts.iter().filter(|a| a.state == AlertState::Active)
    }
}
