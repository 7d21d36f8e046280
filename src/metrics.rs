use std::collections::HashMap;

use anyhow::Result;
use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::state::{ProblemKind, StatsSnapshot};

/// Prometheus view over the repository. Gauges are refreshed from a
/// snapshot at scrape time, so the exporter never holds engine locks.
pub struct EngineMetrics {
    registry: Registry,

    ping_sent: IntGauge,
    ping_ok: IntGauge,
    ping_lost: IntGauge,
    consecutive_lost: IntGauge,
    connection_lost: IntGauge,

    last_rtt_ms: Gauge,
    avg_rtt_ms: Gauge,
    min_rtt_ms: Gauge,
    max_rtt_ms: Gauge,
    jitter_ms: Gauge,
    recent_loss_pct: Gauge,

    dns_score: Gauge,
    dns_record_ok: IntGaugeVec,
    dns_record_latency_ms: GaugeVec,
    dns_bench_avg_ms: GaugeVec,
    dns_bench_reliability: GaugeVec,

    mtu_local: IntGauge,
    mtu_path: IntGauge,
    mtu_issue: IntGauge,
    ttl_last: IntGauge,
    ttl_hops: IntGauge,

    route_changed: IntGauge,
    route_changes_total: IntGauge,
    route_hop_count: IntGauge,
    hop_latency_ms: GaugeVec,
    hop_loss_pct: GaugeVec,

    problem: IntGaugeVec,
    prediction_risk: IntGauge,
    active_alerts: IntGaugeVec,
    update_available: IntGauge,
}

impl EngineMetrics {
    pub fn new(target: &str) -> Result<Self> {
        let labels = HashMap::from([("target".to_string(), target.to_string())]);
        let registry = Registry::new_custom(Some("pathwatch".into()), Some(labels))?;

        let int_gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(name.to_string(), help.to_string())?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let gauge = Gauge::new(name.to_string(), help.to_string())?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let int_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntGaugeVec> {
            let vec = IntGaugeVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };
        let gauge_vec = |name: &str, help: &str, labels: &[&str]| -> Result<GaugeVec> {
            let vec = GaugeVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let ping_sent = int_gauge("ping_sent_total", "Probes sent")?;
        let ping_ok = int_gauge("ping_ok_total", "Probes answered")?;
        let ping_lost = int_gauge("ping_lost_total", "Probes lost")?;
        let consecutive_lost = int_gauge("ping_consecutive_lost", "Current consecutive losses")?;
        let connection_lost =
            int_gauge("connection_lost", "1 while the connection is considered lost")?;
        let last_rtt_ms = gauge("ping_last_rtt_ms", "Latest round-trip time")?;
        let avg_rtt_ms = gauge("ping_avg_rtt_ms", "Average round-trip time")?;
        let min_rtt_ms = gauge("ping_min_rtt_ms", "Minimum round-trip time")?;
        let max_rtt_ms = gauge("ping_max_rtt_ms", "Maximum round-trip time")?;
        let jitter_ms = gauge("ping_jitter_ms", "Smoothed jitter")?;
        let recent_loss_pct = gauge("ping_recent_loss_pct", "Loss over the recent window")?;
        let dns_score = gauge("dns_score", "Composite DNS health score 0-100")?;
        let dns_record_ok =
            int_vec("dns_record_ok", "Last check per record type", &["record_type"])?;
        let dns_record_latency_ms =
            gauge_vec("dns_record_latency_ms", "Last latency per record type", &["record_type"])?;
        let dns_bench_avg_ms =
            gauge_vec("dns_benchmark_avg_ms", "Benchmark average latency", &["server", "test_kind"])?;
        let dns_bench_reliability = gauge_vec(
            "dns_benchmark_reliability",
            "Benchmark success ratio",
            &["server", "test_kind"],
        )?;
        let mtu_local = int_gauge("mtu_local_bytes", "Local interface MTU")?;
        let mtu_path = int_gauge("mtu_path_bytes", "Discovered path MTU")?;
        let mtu_issue = int_gauge("mtu_issue", "1 while an MTU issue is present")?;
        let ttl_last = int_gauge("ttl_last", "Last observed TTL")?;
        let ttl_hops = int_gauge("ttl_estimated_hops", "Estimated hop count from TTL")?;
        let route_changed = int_gauge("route_changed", "1 while the route differs from baseline")?;
        let route_changes_total = int_gauge("route_changes_total", "Committed route changes")?;
        let route_hop_count = int_gauge("route_hop_count", "Hops on the committed route")?;
        let hop_latency_ms =
            gauge_vec("hop_avg_latency_ms", "Per-hop average latency", &["hop_index"])?;
        let hop_loss_pct = gauge_vec("hop_loss_pct", "Per-hop loss percentage", &["hop_index"])?;
        let problem = int_vec("problem_active", "1 for the diagnosed problem kind", &["kind"])?;
        let prediction_risk = int_gauge("problem_prediction_risk", "1 when the prediction is risk")?;
        let active_alerts = int_vec("alerts_active", "Active alerts by priority", &["priority"])?;
        let update_available = int_gauge("update_available", "1 when a newer release exists")?;

        Ok(Self {
            registry,
            ping_sent,
            ping_ok,
            ping_lost,
            consecutive_lost,
            connection_lost,
            last_rtt_ms,
            avg_rtt_ms,
            min_rtt_ms,
            max_rtt_ms,
            jitter_ms,
            recent_loss_pct,
            dns_score,
            dns_record_ok,
            dns_record_latency_ms,
            dns_bench_avg_ms,
            dns_bench_reliability,
            mtu_local,
            mtu_path,
            mtu_issue,
            ttl_last,
            ttl_hops,
            route_changed,
            route_changes_total,
            route_hop_count,
            hop_latency_ms,
            hop_loss_pct,
            problem,
            prediction_risk,
            active_alerts,
            update_available,
        })
    }

    /// Refresh every gauge from a snapshot.
    pub fn update_from(&self, snap: &StatsSnapshot) {
        self.ping_sent.set(snap.counters.sent as i64);
        self.ping_ok.set(snap.counters.ok as i64);
        self.ping_lost.set(snap.counters.lost as i64);
        self.consecutive_lost.set(snap.counters.consecutive_lost as i64);
        self.connection_lost.set(i64::from(snap.connection_lost));

        self.last_rtt_ms.set(snap.last_rtt_ms.unwrap_or(0.0));
        self.avg_rtt_ms.set(snap.avg_latency_ms());
        self.min_rtt_ms.set(snap.min_latency_ms.unwrap_or(0.0));
        self.max_rtt_ms.set(snap.max_latency_ms.unwrap_or(0.0));
        self.jitter_ms.set(snap.jitter_ms);
        self.recent_loss_pct.set(snap.recent_loss_pct());

        self.dns_score.set(snap.dns_score.unwrap_or(0.0));
        for record in &snap.dns_records {
            let label = &[record.kind.as_str()];
            self.dns_record_ok.with_label_values(label).set(i64::from(record.ok));
            self.dns_record_latency_ms
                .with_label_values(label)
                .set(record.rtt_ms.unwrap_or(0.0));
        }
        for bench in &snap.dns_benchmark {
            let labels = &[bench.server.as_str(), bench.kind.as_str()];
            self.dns_bench_avg_ms
                .with_label_values(labels)
                .set(bench.avg_ms().unwrap_or(0.0));
            self.dns_bench_reliability.with_label_values(labels).set(bench.reliability());
        }

        self.mtu_local.set(snap.mtu.local_mtu.unwrap_or(0) as i64);
        self.mtu_path.set(snap.mtu.path_mtu.unwrap_or(0) as i64);
        self.mtu_issue.set(i64::from(snap.mtu.issue));
        self.ttl_last.set(snap.ttl.last_ttl.unwrap_or(0) as i64);
        self.ttl_hops.set(snap.ttl.estimated_hops.unwrap_or(0) as i64);

        self.route_changed.set(i64::from(snap.route_changed));
        self.route_changes_total.set(snap.route_change_count as i64);
        self.route_hop_count
            .set(snap.route.as_ref().map(|r| r.hops.len()).unwrap_or(0) as i64);
        for hop in &snap.hops {
            let index = hop.index.to_string();
            self.hop_latency_ms.with_label_values(&[&index]).set(hop.avg_rtt_ms);
            self.hop_loss_pct.with_label_values(&[&index]).set(hop.loss_pct());
        }

        for kind in [
            ProblemKind::None,
            ProblemKind::Isp,
            ProblemKind::Local,
            ProblemKind::Dns,
            ProblemKind::Mtu,
            ProblemKind::Unknown,
        ] {
            self.problem
                .with_label_values(&[kind.as_str()])
                .set(i64::from(snap.problem.kind == kind));
        }
        self.prediction_risk
            .set(i64::from(snap.problem.prediction == crate::state::Prediction::Risk));

        for priority in ["low", "medium", "high", "critical"] {
            let count = snap
                .visible_alerts()
                .filter(|a| format!("{:?}", a.priority).to_lowercase() == priority)
                .count();
            self.active_alerts.with_label_values(&[priority]).set(count as i64);
        }
        self.update_available.set(i64::from(snap.update_available));
    }

    /// Encode the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::{Sample, StatsRepository};
    use chrono::Utc;

    #[test]
    fn test_metrics_render_from_snapshot() {
        let repo = StatsRepository::new(&Config::default());
        for _ in 0..10 {
            repo.record_ping_result(Sample::ok(Utc::now(), 20.0));
        }
        repo.record_ping_result(Sample::failed(Utc::now(), crate::state::ErrorKind::TransientIo));

        let metrics = EngineMetrics::new("1.1.1.1").unwrap();
        metrics.update_from(&repo.snapshot());
        let body = metrics.render();

        assert!(body.contains("pathwatch_ping_sent_total"));
        assert!(body.contains("target=\"1.1.1.1\""));
        assert!(body.contains("pathwatch_ping_ok_total{target=\"1.1.1.1\"} 10"));
        assert!(body.contains("pathwatch_ping_lost_total{target=\"1.1.1.1\"} 1"));
        assert!(body.contains("pathwatch_problem_active"));
    }

    #[test]
    fn test_metrics_reflect_problem_kind() {
        let repo = StatsRepository::new(&Config::default());
        let metrics = EngineMetrics::new("1.1.1.1").unwrap();
        let mut snap = repo.snapshot();
        snap.problem.kind = ProblemKind::Isp;
        metrics.update_from(&snap);
        let body = metrics.render();
        let isp_line = body
            .lines()
            .find(|l| l.starts_with("pathwatch_problem_active") && l.contains("kind=\"isp\""))
            .unwrap();
        assert!(isp_line.ends_with(" 1"), "line: {isp_line}");
        let none_line = body
            .lines()
            .find(|l| l.starts_with("pathwatch_problem_active") && l.contains("kind=\"none\""))
            .unwrap();
        assert!(none_line.ends_with(" 0"), "line: {none_line}");
    }
}
