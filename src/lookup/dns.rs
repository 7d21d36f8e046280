use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::app::EngineContext;
use crate::sched::run_periodic;
use crate::state::{
    DnsBenchmarkStats, DnsRecordStatus, DnsScoreBucket, DnsTestKind, RecordKind,
};

/// Every resolver call is bounded so the scheduler is never blocked
const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

fn resolver_opts() -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.timeout = DNS_QUERY_TIMEOUT;
    opts.attempts = 1;
    opts
}

/// Resolver against the default configuration
pub fn default_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio(ResolverConfig::default(), resolver_opts())
}

/// Resolver pinned to one specific upstream server
pub fn resolver_for_server(ip: IpAddr) -> TokioAsyncResolver {
    let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
    let config = ResolverConfig::from_parts(None, vec![], group);
    TokioAsyncResolver::tokio(config, resolver_opts())
}

fn record_type(kind: RecordKind) -> RecordType {
    match kind {
        RecordKind::A => RecordType::A,
        RecordKind::Aaaa => RecordType::AAAA,
        RecordKind::Cname => RecordType::CNAME,
        RecordKind::Mx => RecordType::MX,
        RecordKind::Txt => RecordType::TXT,
        RecordKind::Ns => RecordType::NS,
    }
}

/// Periodic resolver checks for every configured record type
pub struct DnsMonitor {
    resolver: TokioAsyncResolver,
}

impl DnsMonitor {
    pub fn new() -> Self {
        Self { resolver: default_resolver() }
    }

    /// Resolve the test domain for each record type in parallel.
    pub async fn check_records(&self, domain: &str, kinds: &[RecordKind]) -> Vec<DnsRecordStatus> {
        let queries = kinds.iter().map(|kind| self.query_one(domain, *kind));
        join_all(queries).await
    }

    async fn query_one(&self, domain: &str, kind: RecordKind) -> DnsRecordStatus {
        let start = Instant::now();
        match self.resolver.lookup(domain, record_type(kind)).await {
            Ok(lookup) => DnsRecordStatus {
                kind,
                ok: true,
                rtt_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                record_count: lookup.iter().count(),
                error: None,
                checked_at: Utc::now(),
            },
            Err(err) => DnsRecordStatus {
                kind,
                ok: false,
                rtt_ms: None,
                record_count: 0,
                error: Some(err.to_string()),
                checked_at: Utc::now(),
            },
        }
    }
}

impl Default for DnsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

struct BenchServer {
    name: String,
    resolver: TokioAsyncResolver,
}

/// Cached / uncached / dotcom latency benchmark against each configured
/// server, with an independent bounded statistics window per test kind.
pub struct DnsBenchmark {
    servers: Vec<BenchServer>,
    windows: HashMap<(String, DnsTestKind), DnsBenchmarkStats>,
    history_cap: usize,
}

impl DnsBenchmark {
    pub fn new(server_specs: &[String], history_cap: usize) -> Self {
        let servers = server_specs
            .iter()
            .map(|spec| {
                let resolver = match spec.parse::<IpAddr>() {
                    Ok(ip) => resolver_for_server(ip),
                    Err(_) => default_resolver(),
                };
                BenchServer { name: spec.clone(), resolver }
            })
            .collect();
        Self { servers, windows: HashMap::new(), history_cap }
    }

    /// Run all three test kinds against every server and return the
    /// updated windows.
    pub async fn run_once(&mut self, test_domain: &str, dotcom_domain: &str) -> Vec<DnsBenchmarkStats> {
        let mut results = Vec::new();
        for i in 0..self.servers.len() {
            let cached = self.test_cached(i, test_domain).await;
            self.fold(i, DnsTestKind::Cached, cached);
            let uncached = self.test_uncached(i, test_domain).await;
            self.fold(i, DnsTestKind::Uncached, uncached);
            let dotcom = self.test_dotcom(i, dotcom_domain).await;
            self.fold(i, DnsTestKind::DotCom, dotcom);
        }
        for server in &self.servers {
            for kind in [DnsTestKind::Cached, DnsTestKind::Uncached, DnsTestKind::DotCom] {
                if let Some(stats) = self.windows.get(&(server.name.clone(), kind)) {
                    results.push(stats.clone());
                }
            }
        }
        results
    }

    /// Two sequential queries for the same name; the second one should
    /// come out of the resolver cache and is the one we time.
    async fn test_cached(&self, server: usize, domain: &str) -> Result<f64, String> {
        let resolver = &self.servers[server].resolver;
        let _ = timed_a_query(resolver, domain, false).await;
        timed_a_query(resolver, domain, false).await
    }

    /// A freshly generated random label forces recursion. NXDOMAIN is a
    /// perfectly good answer here: the time to produce it is the
    /// recursion cost we are measuring. Single attempt, no retry.
    async fn test_uncached(&self, server: usize, parent: &str) -> Result<f64, String> {
        let label: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        let name = format!("{label}.{parent}");
        timed_a_query(&self.servers[server].resolver, &name, true).await
    }

    async fn test_dotcom(&self, server: usize, domain: &str) -> Result<f64, String> {
        timed_a_query(&self.servers[server].resolver, domain, false).await
    }

    fn fold(&mut self, server: usize, kind: DnsTestKind, outcome: Result<f64, String>) {
        let name = self.servers[server].name.clone();
        let cap = self.history_cap;
        let stats = self
            .windows
            .entry((name.clone(), kind))
            .or_insert_with(|| DnsBenchmarkStats::new(name, kind, cap));
        match outcome {
            Ok(ms) => stats.record(Some(ms), None),
            Err(err) => stats.record(None, Some(err)),
        }
    }
}

async fn timed_a_query(
    resolver: &TokioAsyncResolver,
    name: &str,
    nxdomain_ok: bool,
) -> Result<f64, String> {
    let start = Instant::now();
    match resolver.lookup(name, RecordType::A).await {
        Ok(_) => Ok(start.elapsed().as_secs_f64() * 1000.0),
        Err(err) => match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } if nxdomain_ok => {
                Ok(start.elapsed().as_secs_f64() * 1000.0)
            }
            _ => Err(err.to_string()),
        },
    }
}

/// Composite DNS health score on a 0..=100 scale:
/// 40% record success rate, 30% benchmark reliability, 30% latency
/// headroom against the slow threshold.
pub fn dns_score(
    records: &[DnsRecordStatus],
    benchmark: &[DnsBenchmarkStats],
    slow_threshold_ms: f64,
) -> Option<(f64, DnsScoreBucket)> {
    if records.is_empty() && benchmark.is_empty() {
        return None;
    }

    let record_success = if records.is_empty() {
        1.0
    } else {
        records.iter().filter(|r| r.ok).count() as f64 / records.len() as f64
    };

    let measured: Vec<&DnsBenchmarkStats> =
        benchmark.iter().filter(|b| b.queries > 0).collect();
    let reliability = if measured.is_empty() {
        1.0
    } else {
        measured.iter().map(|b| b.reliability()).sum::<f64>() / measured.len() as f64
    };

    // uncached windows carry the honest recursion cost; fall back to
    // whatever latency data exists
    let latency_ms = avg_latency(&measured, Some(DnsTestKind::Uncached))
        .or_else(|| avg_latency(&measured, None))
        .or_else(|| {
            let oks: Vec<f64> = records.iter().filter_map(|r| r.rtt_ms).collect();
            (!oks.is_empty()).then(|| oks.iter().sum::<f64>() / oks.len() as f64)
        });
    let latency_term = match latency_ms {
        Some(ms) => 1.0 - (ms / slow_threshold_ms).min(1.0),
        None => 0.0,
    };

    let score =
        (0.40 * record_success + 0.30 * reliability + 0.30 * latency_term) * 100.0;
    let score = score.clamp(0.0, 100.0);
    Some((score, DnsScoreBucket::from_score(score)))
}

fn avg_latency(windows: &[&DnsBenchmarkStats], kind: Option<DnsTestKind>) -> Option<f64> {
    let values: Vec<f64> = windows
        .iter()
        .filter(|w| kind.map_or(true, |k| w.kind == k))
        .filter_map(|w| w.avg_ms())
        .collect();
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Resolve the test domain for every configured record type and store
/// per-type status plus the refreshed composite score.
pub async fn run_dns_monitor_worker(ctx: EngineContext) {
    let monitor = std::sync::Arc::new(DnsMonitor::new());
    let period = ctx.config.dns_check_interval;
    let cancel = ctx.cancel.clone();
    run_periodic("dns-monitor", period, cancel, move || {
        let ctx = ctx.clone();
        let monitor = monitor.clone();
        async move {
            let records = monitor
                .check_records(&ctx.config.dns_test_domain, &ctx.config.dns_record_types)
                .await;
            let snap = ctx.repo.snapshot();
            if let Some((score, bucket)) =
                dns_score(&records, &snap.dns_benchmark, ctx.config.dns_slow_threshold)
            {
                ctx.repo.set_dns_score(score, bucket);
            }
            ctx.repo.update_dns_records(records);
            Ok(())
        }
    })
    .await;
}

/// Run the three benchmark kinds against each configured server.
pub async fn run_dns_benchmark_worker(ctx: EngineContext) {
    let mut benchmark = DnsBenchmark::new(
        &ctx.config.dns_benchmark_servers,
        ctx.config.dns_benchmark_history_size,
    );
    let mut ticker = crate::sched::worker_interval(ctx.config.dns_check_interval);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let windows = benchmark
                    .run_once(&ctx.config.dns_test_domain, &ctx.config.dns_benchmark_dotcom_domain)
                    .await;
                let snap = ctx.repo.snapshot();
                if let Some((score, bucket)) =
                    dns_score(&snap.dns_records, &windows, ctx.config.dns_slow_threshold)
                {
                    ctx.repo.set_dns_score(score, bucket);
                }
                ctx.repo.update_dns_benchmark(windows);
            }
        }
    }
    debug!("dns benchmark worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ok: bool, rtt: Option<f64>) -> DnsRecordStatus {
        DnsRecordStatus {
            kind: RecordKind::A,
            ok,
            rtt_ms: rtt,
            record_count: usize::from(ok),
            error: (!ok).then(|| "Timeout".to_string()),
            checked_at: Utc::now(),
        }
    }

    fn window(kind: DnsTestKind, oks: &[f64], failures: u64) -> DnsBenchmarkStats {
        let mut stats = DnsBenchmarkStats::new("system".into(), kind, 50);
        for ms in oks {
            stats.record(Some(*ms), None);
        }
        for _ in 0..failures {
            stats.record(None, Some("Timeout".into()));
        }
        stats
    }

    #[test]
    fn test_score_perfect_health() {
        let records = vec![record(true, Some(10.0)); 6];
        let bench = vec![window(DnsTestKind::Uncached, &[10.0, 12.0], 0)];
        let (score, bucket) = dns_score(&records, &bench, 100.0).unwrap();
        assert!(score > 90.0, "score {score}");
        assert_eq!(bucket, DnsScoreBucket::Excellent);
    }

    #[test]
    fn test_score_low_reliability_degrades() {
        let records = vec![record(true, Some(10.0)); 6];
        // reliability 0.3: 3 ok out of 10
        let bench = vec![window(DnsTestKind::Uncached, &[20.0, 20.0, 20.0], 7)];
        let (score, bucket) = dns_score(&records, &bench, 100.0).unwrap();
        assert!(score < 75.0, "score {score}");
        assert!(bucket >= DnsScoreBucket::Fair);
    }

    #[test]
    fn test_score_total_failure_is_critical() {
        let records = vec![record(false, None); 6];
        let bench = vec![window(DnsTestKind::Uncached, &[], 10)];
        let (score, bucket) = dns_score(&records, &bench, 100.0).unwrap();
        assert!(score < 25.0, "score {score}");
        assert_eq!(bucket, DnsScoreBucket::Critical);
    }

    #[test]
    fn test_score_always_in_bounds() {
        let combos: Vec<(Vec<DnsRecordStatus>, Vec<DnsBenchmarkStats>)> = vec![
            (vec![], vec![window(DnsTestKind::Cached, &[100_000.0], 0)]),
            (vec![record(true, Some(0.0))], vec![]),
            (vec![record(false, None)], vec![window(DnsTestKind::Uncached, &[], 100)]),
            (
                vec![record(true, Some(5.0)), record(false, None)],
                vec![
                    window(DnsTestKind::Cached, &[1.0], 0),
                    window(DnsTestKind::Uncached, &[5000.0], 3),
                ],
            ),
        ];
        for (records, bench) in combos {
            let (score, _) = dns_score(&records, &bench, 100.0).unwrap();
            assert!((0.0..=100.0).contains(&score), "score {score}");
        }
    }

    #[test]
    fn test_score_none_without_data() {
        assert!(dns_score(&[], &[], 100.0).is_none());
    }

    #[test]
    fn test_benchmark_windows_are_independent() {
        let mut bench = DnsBenchmark::new(&["system".to_string()], 10);
        bench.fold(0, DnsTestKind::Cached, Ok(5.0));
        bench.fold(0, DnsTestKind::Uncached, Err("Timeout".into()));
        bench.fold(0, DnsTestKind::DotCom, Ok(8.0));

        let cached = bench.windows.get(&("system".into(), DnsTestKind::Cached)).unwrap();
        let uncached = bench.windows.get(&("system".into(), DnsTestKind::Uncached)).unwrap();
        assert_eq!(cached.ok, 1);
        assert_eq!(uncached.ok, 0);
        assert_eq!(uncached.queries, 1);
        assert_eq!(uncached.last_error.as_deref(), Some("Timeout"));
    }

    #[test]
    fn test_record_kind_roundtrip() {
        for kind in [
            RecordKind::A,
            RecordKind::Aaaa,
            RecordKind::Cname,
            RecordKind::Mx,
            RecordKind::Txt,
            RecordKind::Ns,
        ] {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("SOA"), None);
    }
}
