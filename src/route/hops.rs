use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::app::EngineContext;
use crate::lookup::{GeoClient, ReverseDns};
use crate::probe::{build_ping_args, interpret_ping};
use crate::proc::ProcessSupervisor;
use crate::sched::worker_interval;
use crate::state::{HopStatus, Route, RouteHealth, RouteStats};

/// Cap on concurrent hop pings so a long route cannot starve the
/// target ping of subprocess slots
const MAX_CONCURRENT_HOP_PINGS: usize = 20;

/// Loss above this marks a hop as a problem hop
const PROBLEM_HOP_LOSS_PCT: f64 = 5.0;

/// Hostname lookups per tick; the rest catch up on later ticks
const HOSTNAME_BATCH: usize = 10;

/// Maintains per-hop statistics for the committed route. The table is
/// rebuilt (fresh counters, empty history) on every route re-discovery.
pub struct HopMonitor {
    hops: Vec<HopStatus>,
}

impl HopMonitor {
    pub fn new() -> Self {
        Self { hops: Vec::new() }
    }

    /// Replace the hop table with the hops of a newly committed route.
    pub fn rebuild(&mut self, route: &Route) {
        self.hops = route
            .hops
            .iter()
            .filter_map(|hop| hop.ip.map(|ip| HopStatus::new(hop.index, ip)))
            .collect();
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hops(&self) -> Vec<HopStatus> {
        self.hops.clone()
    }

    /// Ping every hop in parallel and fold the results in. Each probe is
    /// a separate subprocess bounded by the hop timeout.
    pub async fn ping_all(&mut self, procs: &ProcessSupervisor, timeout: Duration) {
        if self.hops.is_empty() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_HOP_PINGS));
        let probes = self.hops.iter().map(|hop| {
            let ip = hop.ip;
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                (ip, ping_hop(procs, ip, timeout).await)
            }
        });
        let results: Vec<(IpAddr, Option<f64>)> = join_all(probes).await;
        for (ip, rtt) in results {
            if let Some(hop) = self.hops.iter_mut().find(|h| h.ip == ip) {
                hop.record(rtt);
            }
        }
    }

    /// Fill missing hostnames through the cached reverse resolver.
    pub async fn fill_hostnames(&mut self, rdns: &ReverseDns) {
        let pending: Vec<IpAddr> = self
            .hops
            .iter()
            .filter(|h| h.hostname.is_none())
            .map(|h| h.ip)
            .take(HOSTNAME_BATCH)
            .collect();
        if pending.is_empty() {
            return;
        }
        let lookups = pending.iter().map(|&ip| async move { (ip, rdns.lookup(ip).await) });
        for (ip, hostname) in join_all(lookups).await {
            if let (Some(hostname), Some(hop)) =
                (hostname, self.hops.iter_mut().find(|h| h.ip == ip))
            {
                hop.hostname = Some(hostname);
            }
        }
    }

    /// Fill missing geo data. The geo client rate-limits itself, so
    /// only a couple of hops make progress per tick; the rest follow.
    pub async fn fill_geo(&mut self, geo: &GeoClient) {
        let pending: Vec<IpAddr> = self
            .hops
            .iter()
            .filter(|h| h.country_code.is_none())
            .map(|h| h.ip)
            .collect();
        for ip in pending {
            let Some(info) = geo.lookup(ip).await else { continue };
            if let Some(hop) = self.hops.iter_mut().find(|h| h.ip == ip) {
                hop.country = info.country;
                hop.country_code = info.country_code;
                hop.asn = info.asn;
            }
        }
    }

    /// Aggregate the hop table into the compact route summary.
    pub fn route_stats(&self) -> RouteStats {
        let now = Utc::now();
        if self.hops.is_empty() {
            return RouteStats::empty(now);
        }

        let mut total_loss = 0.0;
        let mut total_latency = 0.0;
        let mut max_latency: f64 = 0.0;
        let mut responding = 0usize;
        let mut worst_hop = 0u32;
        let mut worst_loss = 0.0;
        let mut problem_hops = Vec::new();

        for hop in &self.hops {
            let loss = hop.loss_pct();
            total_loss += loss;
            if hop.avg_rtt_ms > 0.0 {
                total_latency += hop.avg_rtt_ms;
                responding += 1;
            }
            max_latency = max_latency.max(hop.max_rtt_ms);
            if loss > worst_loss {
                worst_loss = loss;
                worst_hop = hop.index;
            }
            if loss > PROBLEM_HOP_LOSS_PCT {
                problem_hops.push(hop.index);
            }
        }

        let avg_loss = total_loss / self.hops.len() as f64;
        let avg_latency = if responding > 0 { total_latency / responding as f64 } else { 0.0 };
        let health = if responding == 0 {
            RouteHealth::Unknown
        } else if avg_loss < 1.0 && problem_hops.is_empty() {
            RouteHealth::Healthy
        } else if avg_loss < 5.0 && problem_hops.len() <= 1 {
            RouteHealth::Degraded
        } else {
            RouteHealth::Critical
        };

        RouteStats {
            hop_count: self.hops.len(),
            responding_hops: responding,
            avg_latency_ms: avg_latency,
            max_latency_ms: max_latency,
            avg_loss_pct: avg_loss,
            worst_hop,
            worst_hop_loss_pct: worst_loss,
            problem_hops,
            health,
            updated_at: now,
        }
    }
}

impl Default for HopMonitor {
    fn default() -> Self {
        Self::new()
    }
}

async fn ping_hop(procs: &ProcessSupervisor, ip: IpAddr, timeout: Duration) -> Option<f64> {
    let args = build_ping_args(&ip.to_string(), ip.is_ipv6(), timeout);
    let output = procs.run("hop-ping", &args, timeout + Duration::from_millis(500)).await;
    interpret_ping(&output).ok().map(|reply| reply.rtt_ms)
}

/// Ping all committed hops each tick; rebuild the table when the route
/// detector (or the IP worker) requests it.
pub async fn run_hop_monitor_worker(ctx: EngineContext) {
    let mut monitor = HopMonitor::new();
    let rdns = ReverseDns::new();
    let geo = GeoClient::new();
    let mut ticker = worker_interval(ctx.config.hop_ping_interval);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let rebuild_requested = ctx.hop_rediscover.swap(false, Ordering::SeqCst);
                if rebuild_requested || monitor.is_empty() {
                    let snap = ctx.repo.snapshot();
                    if let Some(route) = snap.route {
                        debug!(hops = route.hops.len(), "rebuilding hop table");
                        ctx.repo.update_hops(Vec::new(), true);
                        monitor.rebuild(&route);
                        ctx.repo.update_hops(monitor.hops(), false);
                        ctx.repo.update_route_stats(monitor.route_stats());
                    }
                    // nothing to ping until the detector commits a route
                    if monitor.is_empty() {
                        continue;
                    }
                }

                monitor.ping_all(&ctx.procs, ctx.config.hop_ping_timeout).await;
                monitor.fill_hostnames(&rdns).await;
                monitor.fill_geo(&geo).await;
                ctx.repo.update_hops(monitor.hops(), false);
                ctx.repo.update_route_stats(monitor.route_stats());
            }
        }
    }
}
