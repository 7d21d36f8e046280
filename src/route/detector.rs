use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alert::{AlertKind, Severity};
use crate::app::EngineContext;
use crate::probe::{
    build_traceroute_args, parse_traceroute, problematic_hop, route_diff_count, route_fingerprint,
};
use crate::sched::worker_interval;
use crate::state::{Route, RouteHop};

/// Hard cap on one traceroute run
const TRACEROUTE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the detector checks whether a run is due
const POLL_PERIOD: Duration = Duration::from_secs(5);

/// Watches the route: traceroute on the long analysis interval, plus
/// out-of-schedule runs requested by the ping worker on loss
/// escalation and by the IP worker on address changes, both bounded by
/// the cooldown. A change only commits after the configured number of
/// consecutive identical detections.
pub async fn run_route_detector_worker(ctx: EngineContext) {
    let mut last_run: Option<Instant> = None;
    let mut ticker = worker_interval(POLL_PERIOD);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let due = last_run
                    .map_or(true, |at| at.elapsed() >= ctx.config.route_analysis_interval);
                let requested = ctx.traceroute_request.load(Ordering::SeqCst);
                if !due && !requested {
                    continue;
                }
                // escalation runs respect the cooldown; scheduled runs always go
                if !due {
                    if let Some(at) = last_run {
                        if at.elapsed() < ctx.config.traceroute_cooldown {
                            continue;
                        }
                    }
                }
                ctx.traceroute_request.store(false, Ordering::SeqCst);
                last_run = Some(Instant::now());

                detect_once(&ctx, requested).await;
            }
        }
    }
}

async fn detect_once(ctx: &EngineContext, escalation: bool) {
    let args = build_traceroute_args(&ctx.config.target, ctx.config.traceroute_max_hops);
    let output = ctx.procs.run("traceroute", &args, TRACEROUTE_TIMEOUT).await;
    if output.kind != crate::proc::SpawnKind::Ok {
        debug!(kind = ?output.kind, "traceroute did not complete");
        return;
    }

    let hops = parse_traceroute(&output.stdout);
    if hops.is_empty() {
        debug!("traceroute produced no hops");
        return;
    }

    let problem = problematic_hop(&hops, ctx.config.hop_timeout_threshold);
    ctx.repo.set_route_problematic(problem);
    if let Some(index) = problem {
        ctx.repo.add_alert(
            AlertKind::HopIssue,
            Severity::Warning,
            &format!("problematic hop {index} on route to {}", ctx.config.target),
        );
    }

    // insignificant diffs (local-network noise, too few positions) are
    // treated as the same route for hysteresis purposes
    let committed = ctx.repo.snapshot().route;
    let fingerprint = match &committed {
        Some(route) => {
            let diff = route_diff_count(&hops, &route.hops, ctx.config.route_ignore_first_hops);
            if diff >= ctx.config.route_change_hop_diff {
                route_fingerprint(&hops)
            } else {
                route.fingerprint
            }
        }
        None => route_fingerprint(&hops),
    };

    let (committed_now, run) = ctx.repo.update_route_hysteresis(fingerprint);
    debug!(fingerprint, committed_now, run, "route detection");

    if committed_now {
        let first_discovery = committed.is_none();
        ctx.repo.update_route(
            Route { hops, captured_at: Utc::now(), fingerprint },
            problem,
        );
        ctx.hop_rediscover.store(true, Ordering::SeqCst);

        if !first_discovery {
            info!(fingerprint, "route change committed");
            ctx.repo.add_alert(AlertKind::RouteChange, Severity::Info, "network route changed");
            if ctx.config.enable_sound_alerts {
                ctx.repo.trigger_alert_sound(AlertKind::RouteChange);
            }
            save_snapshot(&ctx.config.snapshot_dir, &ctx.config.target, &output.stdout).await;
        }
    } else if escalation {
        // a loss-triggered run is a connection incident worth keeping
        save_snapshot(&ctx.config.snapshot_dir, &ctx.config.target, &output.stdout).await;
    }
}

/// Persist raw traceroute output as `traceroute_<UTC-ISO>.txt`.
async fn save_snapshot(dir: &Path, target: &str, output: &str) {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("traceroute_{stamp}.txt"));
    let body = format!("Traceroute to {target}\nTime: {}\n{}\n{output}", Utc::now(), "=".repeat(70));
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        warn!(error = %err, "could not create traceroute snapshot dir");
        return;
    }
    match tokio::fs::write(&path, body).await {
        Ok(()) => info!(path = %path.display(), "traceroute snapshot saved"),
        Err(err) => warn!(error = %err, "could not save traceroute snapshot"),
    }
}

/// Convenience for tests: a route built from bare IPs.
pub fn route_from_ips(ips: &[&str]) -> Vec<RouteHop> {
    ips.iter()
        .enumerate()
        .map(|(i, ip)| RouteHop {
            index: i as u32 + 1,
            ip: ip.parse().ok(),
            hostname: None,
            latencies_ms: vec![1.0],
            timeout: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::StatsRepository;

    #[test]
    fn test_insignificant_diff_keeps_committed_fingerprint() {
        // mirrors the fingerprint-selection logic in detect_once
        let config = Config::default();
        let repo = StatsRepository::new(&config);

        let old_hops = route_from_ips(&["192.168.1.1", "10.0.0.1", "172.16.0.1", "1.1.1.1"]);
        let old_fp = route_fingerprint(&old_hops);
        repo.update_route_hysteresis(old_fp);
        repo.update_route(
            Route { hops: old_hops.clone(), captured_at: Utc::now(), fingerprint: old_fp },
            None,
        );

        // only the first hop differs: ignored positions, same route
        let new_hops = route_from_ips(&["192.168.1.254", "10.0.0.1", "172.16.0.1", "1.1.1.1"]);
        let diff = route_diff_count(&new_hops, &old_hops, config.route_ignore_first_hops);
        assert!(diff < config.route_change_hop_diff);

        let (committed, _) = repo.update_route_hysteresis(old_fp);
        assert!(!committed);
        assert!(!repo.snapshot().route_changed);
    }

    #[test]
    fn test_significant_diff_commits_after_consecutive() {
        let config = Config::default();
        let repo = StatsRepository::new(&config);

        let old_hops = route_from_ips(&["192.168.1.1", "10.0.0.1", "172.16.0.1", "1.1.1.1"]);
        let old_fp = route_fingerprint(&old_hops);
        repo.update_route_hysteresis(old_fp);
        repo.update_route(
            Route { hops: old_hops.clone(), captured_at: Utc::now(), fingerprint: old_fp },
            None,
        );

        let new_hops = route_from_ips(&["192.168.1.1", "10.0.0.1", "172.99.0.1", "9.9.9.9"]);
        let diff = route_diff_count(&new_hops, &old_hops, config.route_ignore_first_hops);
        assert!(diff >= config.route_change_hop_diff);
        let new_fp = route_fingerprint(&new_hops);

        assert_eq!(repo.update_route_hysteresis(new_fp), (false, 1));
        assert_eq!(repo.update_route_hysteresis(new_fp), (true, 2));
        assert!(repo.snapshot().route_changed);
    }
}
