use std::time::Duration;

use crate::proc::ProcessSupervisor;
use crate::probe::ping::build_df_ping_args;

/// Search bounds for path-MTU payloads (ICMP payload bytes)
const PMTU_LOW: u32 = 500;
const PMTU_HIGH: u32 = 1500;

/// Per-probe cap; the whole binary search finishes in a few seconds
const DF_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pull the first plausible MTU out of `ip link` output
pub fn parse_link_mtu(output: &str) -> Option<u32> {
    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        // skip the loopback device, it reports 65536
        if lower.contains("lo:") || lower.contains("loopback") {
            continue;
        }
        if let Some(pos) = lower.find("mtu ") {
            let rest = &lower[pos + 4..];
            let num: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(mtu) = num.parse::<u32>() {
                if (500..=9000).contains(&mtu) {
                    return Some(mtu);
                }
            }
        }
    }
    None
}

/// Pull an MTU column out of `netsh interface ipv4 show subinterface`
pub fn parse_netsh_mtu(output: &str) -> Option<u32> {
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('-') {
            continue;
        }
        if let Some(first) = line.split_whitespace().next() {
            if let Ok(mtu) = first.parse::<u32>() {
                if (500..=9000).contains(&mtu) {
                    return Some(mtu);
                }
            }
        }
    }
    None
}

/// MTU of the primary interface, via the platform tool
pub async fn local_mtu(procs: &ProcessSupervisor) -> Option<u32> {
    #[cfg(not(windows))]
    {
        let argv = vec!["ip".to_string(), "link".into(), "show".into()];
        let out = procs.run("ip-link", &argv, Duration::from_secs(5)).await;
        if !out.success() {
            return None;
        }
        parse_link_mtu(&out.stdout)
    }
    #[cfg(windows)]
    {
        let argv: Vec<String> = ["netsh", "interface", "ipv4", "show", "subinterface"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = procs.run("netsh", &argv, Duration::from_secs(5)).await;
        if !out.success() {
            return None;
        }
        parse_netsh_mtu(&out.stdout)
    }
}

/// Binary-search the path MTU with don't-fragment pings. Returns the
/// largest payload size that still gets through, or None when even the
/// lower bound fails.
pub async fn discover_path_mtu(procs: &ProcessSupervisor, target: &str, ipv6: bool) -> Option<u32> {
    let (mut low, mut high) = (PMTU_LOW, PMTU_HIGH);
    while low <= high {
        let mid = low + (high - low) / 2;
        let argv = build_df_ping_args(target, ipv6, mid);
        let out = procs.run("df-ping", &argv, DF_PING_TIMEOUT).await;
        if out.success() {
            low = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            high = mid - 1;
        }
    }
    (high >= PMTU_LOW).then_some(high)
}

/// Decide whether the measured pair constitutes an MTU issue: a path
/// well below the local interface, or outright fragmentation territory.
pub fn is_mtu_issue(local: Option<u32>, path: Option<u32>, diff_threshold: u32) -> bool {
    match (local, path) {
        (Some(local), Some(path)) => {
            path < 1000 || (local > path && local - path >= diff_threshold)
        }
        _ => false,
    }
}

/// Measure local and path MTU, then feed the observation through the
/// repository hysteresis. The first run publishes immediately so the
/// UI shows a value without waiting for the consecutive rule.
pub async fn run_mtu_worker(ctx: crate::app::EngineContext) {
    use tracing::info;

    let mut ticker = crate::sched::worker_interval(ctx.config.mtu_check_interval);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let local = local_mtu(&ctx.procs).await;
                let path = match local {
                    Some(_) => {
                        discover_path_mtu(&ctx.procs, &ctx.config.target, ctx.target_is_ipv6).await
                    }
                    None => None,
                };
                ctx.repo.update_mtu_values(local, path);

                let issue = is_mtu_issue(local, path, ctx.config.mtu_diff_threshold);
                let (changed, state) = ctx.repo.update_mtu_hysteresis(issue);
                if changed {
                    info!(local, path, issue = state, "mtu state changed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_LINK: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT";

    const NETSH: &str = "\
   MTU  MediaSenseState   Bytes In  Bytes Out  Interface
------  ---------------  ---------  ---------  -------------
  1500                1     361236     131231  Ethernet";

    #[test]
    fn test_parse_ip_link_skips_loopback() {
        assert_eq!(parse_link_mtu(IP_LINK), Some(1500));
    }

    #[test]
    fn test_parse_netsh() {
        assert_eq!(parse_netsh_mtu(NETSH), Some(1500));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_link_mtu("no interfaces here"), None);
        assert_eq!(parse_netsh_mtu("-------"), None);
    }

    #[test]
    fn test_issue_classification() {
        // healthy: local == path
        assert!(!is_mtu_issue(Some(1500), Some(1500), 50));
        // small clamp below the threshold is fine
        assert!(!is_mtu_issue(Some(1500), Some(1460), 50));
        // big gap is an issue
        assert!(is_mtu_issue(Some(1500), Some(1400), 50));
        // fragmentation territory is always an issue
        assert!(is_mtu_issue(Some(1500), Some(900), 50));
        // missing data is never an issue
        assert!(!is_mtu_issue(None, Some(1400), 50));
        assert!(!is_mtu_issue(Some(1500), None, 50));
    }
}
