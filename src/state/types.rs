use std::collections::VecDeque;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a probe or lookup failed. Workers tag failures instead of
/// propagating errors; the taxonomy decides retry and alert behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Single probe failed (timeout, 5xx, subprocess timeout); retried next tick
    TransientIo,
    /// Missing binary or unresolvable config; fatal at startup
    PermanentIo,
    /// Unexpected tool output; counted as a failed sample
    ParseError,
    /// External input failed a structural check; sample dropped
    ValidationError,
    /// Shutdown-signalled I/O; recorded but not counted as packet loss
    Cancelled,
    /// Internal check failed; state clamped, never a crash
    InvariantViolated,
}

/// One ping result, immutable once recorded
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub rtt_ms: Option<f64>,
    pub error: Option<ErrorKind>,
}

impl Sample {
    pub fn ok(at: DateTime<Utc>, rtt_ms: f64) -> Self {
        Self { at, ok: true, rtt_ms: Some(rtt_ms), error: None }
    }

    pub fn failed(at: DateTime<Utc>, error: ErrorKind) -> Self {
        Self { at, ok: false, rtt_ms: None, error: Some(error) }
    }

    /// Cancelled probes are recorded but never counted as packet loss
    pub fn counts_as_loss(&self) -> bool {
        !self.ok && self.error != Some(ErrorKind::Cancelled)
    }
}

/// Target ping counters. `sent == ok + lost` holds by construction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub sent: u64,
    pub ok: u64,
    pub lost: u64,
    pub consecutive_lost: u32,
    pub max_consecutive_lost: u32,
}

/// Public IP with geo attribution and change tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicIp {
    pub ip: Option<IpAddr>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub provider: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub previous: Option<IpAddr>,
    pub changed_at: Option<DateTime<Utc>>,
}

/// MTU state under hysteresis: the issue flag only flips after the
/// configured number of consecutive observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtuState {
    pub local_mtu: Option<u32>,
    pub path_mtu: Option<u32>,
    pub issue: bool,
    pub consecutive_issue: u32,
    pub consecutive_clear: u32,
    pub last_change: Option<DateTime<Utc>>,
    /// First probe publishes immediately, bypassing hysteresis
    pub probed: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TtlState {
    pub last_ttl: Option<u32>,
    pub estimated_hops: Option<u32>,
}

/// A hop parsed out of traceroute output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteHop {
    pub index: u32,
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    pub latencies_ms: Vec<f64>,
    pub timeout: bool,
}

/// A captured route with its identity fingerprint (hash of ordered hop IPs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub hops: Vec<RouteHop>,
    pub captured_at: DateTime<Utc>,
    pub fingerprint: u64,
}

pub const HOP_LATENCY_HISTORY: usize = 30;
pub const HOP_SPARKLINE_SOURCE: usize = 10;
pub const HOP_SPARKLINE_BINS: u8 = 5;

/// Live status of a single monitored hop. Recreated on every route
/// re-discovery, so all counters restart from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopStatus {
    pub index: u32,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub last_rtt_ms: Option<f64>,
    pub avg_rtt_ms: f64,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: f64,
    /// Standard deviation over the latency history
    pub jitter_ms: f64,
    /// Change vs the previous successful ping
    pub delta_ms: f64,
    pub sent: u64,
    pub lost: u64,
    pub last_ok: bool,
    pub history: VecDeque<f64>,
    /// Last ~10 samples normalized to 0..5 levels for the UI sparkline
    pub sparkline: Vec<u8>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub asn: Option<String>,
}

impl HopStatus {
    pub fn new(index: u32, ip: IpAddr) -> Self {
        Self {
            index,
            ip,
            hostname: None,
            last_rtt_ms: None,
            avg_rtt_ms: 0.0,
            min_rtt_ms: None,
            max_rtt_ms: 0.0,
            jitter_ms: 0.0,
            delta_ms: 0.0,
            sent: 0,
            lost: 0,
            last_ok: true,
            history: VecDeque::with_capacity(HOP_LATENCY_HISTORY),
            sparkline: Vec::new(),
            country: None,
            country_code: None,
            asn: None,
        }
    }

    /// Fold one ping result into the hop stats
    pub fn record(&mut self, rtt_ms: Option<f64>) {
        self.sent += 1;
        match rtt_ms {
            Some(rtt) => {
                let rtt = rtt.max(0.0);
                self.last_ok = true;
                if let Some(prev) = self.last_rtt_ms {
                    self.delta_ms = rtt - prev;
                }
                self.last_rtt_ms = Some(rtt);

                self.history.push_back(rtt);
                if self.history.len() > HOP_LATENCY_HISTORY {
                    self.history.pop_front();
                }

                self.min_rtt_ms = Some(self.min_rtt_ms.map_or(rtt, |m| m.min(rtt)));
                self.max_rtt_ms = self.max_rtt_ms.max(rtt);
                self.avg_rtt_ms = self.history.iter().sum::<f64>() / self.history.len() as f64;
                self.jitter_ms = stdev(self.history.iter().copied());
            }
            None => {
                self.lost += 1;
                self.last_ok = false;
                self.last_rtt_ms = None;
                self.delta_ms = 0.0;
            }
        }
        self.rebuild_sparkline();
    }

    pub fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64 * 100.0
        }
    }

    fn rebuild_sparkline(&mut self) {
        let recent: Vec<f64> = self
            .history
            .iter()
            .rev()
            .take(HOP_SPARKLINE_SOURCE)
            .rev()
            .copied()
            .collect();
        if recent.is_empty() {
            self.sparkline.clear();
            return;
        }
        let max = recent.iter().cloned().fold(f64::MIN, f64::max).max(1e-9);
        self.sparkline = recent
            .iter()
            .map(|v| ((v / max) * (HOP_SPARKLINE_BINS - 1) as f64).round() as u8)
            .collect();
    }
}

/// Overall route health rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteHealth {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

/// Compact summary of the monitored route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStats {
    pub hop_count: usize,
    pub responding_hops: usize,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_loss_pct: f64,
    pub worst_hop: u32,
    pub worst_hop_loss_pct: f64,
    pub problem_hops: Vec<u32>,
    pub health: RouteHealth,
    pub updated_at: DateTime<Utc>,
}

impl RouteStats {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            hop_count: 0,
            responding_hops: 0,
            avg_latency_ms: 0.0,
            max_latency_ms: 0.0,
            avg_loss_pct: 0.0,
            worst_hop: 0,
            worst_hop_loss_pct: 0.0,
            problem_hops: Vec::new(),
            health: RouteHealth::Unknown,
            updated_at: now,
        }
    }
}

/// DNS record types the monitor can query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Ns,
}

impl RecordKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "AAAA" => Some(Self::Aaaa),
            "CNAME" => Some(Self::Cname),
            "MX" => Some(Self::Mx),
            "TXT" => Some(Self::Txt),
            "NS" => Some(Self::Ns),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Mx => "MX",
            Self::Txt => "TXT",
            Self::Ns => "NS",
        }
    }
}

/// Latest result for one (record type, server) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecordStatus {
    pub kind: RecordKind,
    pub ok: bool,
    pub rtt_ms: Option<f64>,
    pub record_count: usize,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DnsTestKind {
    Cached,
    Uncached,
    DotCom,
}

impl DnsTestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Uncached => "uncached",
            Self::DotCom => "dotcom",
        }
    }
}

/// Bounded statistics window for one (server, test kind) benchmark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsBenchmarkStats {
    pub server: String,
    pub kind: DnsTestKind,
    pub queries: u64,
    pub ok: u64,
    pub history: VecDeque<f64>,
    pub history_cap: usize,
    pub last_ms: Option<f64>,
    pub last_error: Option<String>,
}

impl DnsBenchmarkStats {
    pub fn new(server: String, kind: DnsTestKind, history_cap: usize) -> Self {
        Self {
            server,
            kind,
            queries: 0,
            ok: 0,
            history: VecDeque::with_capacity(history_cap.min(64)),
            history_cap,
            last_ms: None,
            last_error: None,
        }
    }

    pub fn record(&mut self, rtt_ms: Option<f64>, error: Option<String>) {
        self.queries += 1;
        self.last_error = error;
        match rtt_ms {
            Some(rtt) => {
                self.ok += 1;
                self.last_ms = Some(rtt);
                self.history.push_back(rtt);
                if self.history.len() > self.history_cap {
                    self.history.pop_front();
                }
            }
            None => self.last_ms = None,
        }
    }

    /// Success rate in [0, 1]
    pub fn reliability(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.ok as f64 / self.queries as f64
        }
    }

    pub fn min_ms(&self) -> Option<f64> {
        self.history.iter().cloned().reduce(f64::min)
    }

    pub fn max_ms(&self) -> Option<f64> {
        self.history.iter().cloned().reduce(f64::max)
    }

    pub fn avg_ms(&self) -> Option<f64> {
        if self.history.is_empty() {
            None
        } else {
            Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
        }
    }

    pub fn stdev_ms(&self) -> Option<f64> {
        if self.history.len() < 2 {
            None
        } else {
            Some(stdev(self.history.iter().copied()))
        }
    }
}

/// Quality bucket for the composite DNS score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DnsScoreBucket {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl DnsScoreBucket {
    /// Score is on a 0..=100 scale
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 75.0 {
            Self::Good
        } else if score >= 50.0 {
            Self::Fair
        } else if score >= 25.0 {
            Self::Poor
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProblemKind {
    None,
    Isp,
    Local,
    Dns,
    Mtu,
    Unknown,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Isp => "isp",
            Self::Local => "local",
            Self::Dns => "dns",
            Self::Mtu => "mtu",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prediction {
    Stable,
    Risk,
}

/// Result of one classifier evaluation, written back atomically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDiagnosis {
    pub kind: ProblemKind,
    pub prediction: Prediction,
    pub recurring: bool,
    pub evaluated_at: DateTime<Utc>,
    pub cause: String,
}

impl ProblemDiagnosis {
    pub fn none(now: DateTime<Utc>) -> Self {
        Self {
            kind: ProblemKind::None,
            prediction: Prediction::Stable,
            recurring: false,
            evaluated_at: now,
            cause: String::new(),
        }
    }
}

/// Population standard deviation
pub fn stdev(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_hop_status_records_latency() {
        let mut hop = HopStatus::new(1, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        hop.record(Some(10.0));
        hop.record(Some(20.0));
        hop.record(Some(30.0));

        assert_eq!(hop.sent, 3);
        assert_eq!(hop.lost, 0);
        assert_eq!(hop.min_rtt_ms, Some(10.0));
        assert_eq!(hop.max_rtt_ms, 30.0);
        assert!((hop.avg_rtt_ms - 20.0).abs() < 1e-9);
        assert!((hop.delta_ms - 10.0).abs() < 1e-9);
        assert!(hop.jitter_ms > 8.0 && hop.jitter_ms < 8.5);
    }

    #[test]
    fn test_hop_status_loss() {
        let mut hop = HopStatus::new(2, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        for _ in 0..5 {
            hop.record(Some(5.0));
        }
        for _ in 0..5 {
            hop.record(None);
        }
        assert_eq!(hop.sent, 10);
        assert_eq!(hop.lost, 5);
        assert!((hop.loss_pct() - 50.0).abs() < 1e-9);
        assert!(!hop.last_ok);
    }

    #[test]
    fn test_hop_history_bounded() {
        let mut hop = HopStatus::new(1, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        for i in 0..100 {
            hop.record(Some(i as f64));
        }
        assert_eq!(hop.history.len(), HOP_LATENCY_HISTORY);
        assert!(hop.sparkline.len() <= HOP_SPARKLINE_SOURCE);
        assert!(hop.sparkline.iter().all(|&b| b < HOP_SPARKLINE_BINS));
    }

    #[test]
    fn test_benchmark_window_stats() {
        let mut stats = DnsBenchmarkStats::new("system".into(), DnsTestKind::Cached, 3);
        stats.record(Some(10.0), None);
        stats.record(Some(20.0), None);
        stats.record(None, Some("timeout".into()));
        stats.record(Some(30.0), None);
        stats.record(Some(40.0), None);

        // window of 3 keeps the newest entries only
        assert_eq!(stats.history.len(), 3);
        assert_eq!(stats.min_ms(), Some(20.0));
        assert_eq!(stats.max_ms(), Some(40.0));
        assert_eq!(stats.queries, 5);
        assert_eq!(stats.ok, 4);
        assert!((stats.reliability() - 0.8).abs() < 1e-9);
        assert!(stats.stdev_ms().unwrap() > 0.0);
    }

    #[test]
    fn test_score_buckets() {
        assert_eq!(DnsScoreBucket::from_score(95.0), DnsScoreBucket::Excellent);
        assert_eq!(DnsScoreBucket::from_score(80.0), DnsScoreBucket::Good);
        assert_eq!(DnsScoreBucket::from_score(60.0), DnsScoreBucket::Fair);
        assert_eq!(DnsScoreBucket::from_score(30.0), DnsScoreBucket::Poor);
        assert_eq!(DnsScoreBucket::from_score(5.0), DnsScoreBucket::Critical);
    }

    #[test]
    fn test_cancelled_sample_is_not_loss() {
        let s = Sample::failed(Utc::now(), ErrorKind::Cancelled);
        assert!(!s.counts_as_loss());
        let s = Sample::failed(Utc::now(), ErrorKind::TransientIo);
        assert!(s.counts_as_loss());
    }
}
