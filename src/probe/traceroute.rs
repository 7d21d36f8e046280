use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::state::{stdev, RouteHop};

/// Build the platform traceroute command. DNS resolution is disabled on
/// the command line; hostnames are filled in asynchronously afterwards.
#[cfg(not(windows))]
pub fn build_traceroute_args(target: &str, max_hops: u32) -> Vec<String> {
    vec![
        "traceroute".into(),
        "-n".into(),
        "-m".into(),
        max_hops.to_string(),
        "-w".into(),
        "1".into(),
        target.to_string(),
    ]
}

#[cfg(windows)]
pub fn build_traceroute_args(target: &str, max_hops: u32) -> Vec<String> {
    vec![
        "tracert".into(),
        "-d".into(),
        "-h".into(),
        max_hops.to_string(),
        "-w".into(),
        "500".into(),
        target.to_string(),
    ]
}

/// Parse traceroute/tracert output into hop records. Lines that do not
/// start with a hop number (banners, blank lines) are skipped.
pub fn parse_traceroute(output: &str) -> Vec<RouteHop> {
    let mut hops = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else { continue };
        let Ok(index) = first.parse::<u32>() else { continue };

        let rest: Vec<&str> = parts.collect();
        let ip = rest.iter().find_map(|tok| {
            let tok = tok.trim_matches(|c| c == '[' || c == ']' || c == '(' || c == ')');
            tok.parse::<IpAddr>().ok()
        });

        let mut latencies_ms = Vec::new();
        for (i, tok) in rest.iter().enumerate() {
            // "12.3 ms" pairs and the glued "12.3ms" form
            if let Some(num) = tok.strip_suffix("ms") {
                if let Ok(v) = num.trim_end_matches('<').parse::<f64>() {
                    latencies_ms.push(v);
                }
            } else if *tok == "ms" && i > 0 {
                if let Ok(v) = rest[i - 1].trim_start_matches('<').parse::<f64>() {
                    latencies_ms.push(v);
                }
            }
        }

        let timeout = rest.iter().any(|tok| *tok == "*");
        hops.push(RouteHop { index, ip, hostname: None, latencies_ms, timeout });
    }
    hops
}

/// Stable identity over the ordered hop IPs. Hops that never answered
/// contribute a placeholder so a responder appearing at that position
/// still flips the fingerprint.
pub fn route_fingerprint(hops: &[RouteHop]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for hop in hops {
        match hop.ip {
            Some(ip) => ip.hash(&mut hasher),
            None => "*".hash(&mut hasher),
        }
    }
    hasher.finish()
}

/// Find the first genuinely problematic hop. A single all-timeout hop is
/// common (routers that ignore probes) and is not problematic on its
/// own; two or more consecutive ones are. High average latency or high
/// per-hop variance also qualifies.
pub fn problematic_hop(hops: &[RouteHop], latency_threshold_ms: f64) -> Option<u32> {
    let mut consecutive_timeouts = 0u32;
    for hop in hops {
        if hop.timeout && hop.latencies_ms.is_empty() {
            consecutive_timeouts += 1;
            if consecutive_timeouts >= 2 {
                return Some(hop.index);
            }
            continue;
        }
        consecutive_timeouts = 0;

        if !hop.latencies_ms.is_empty() {
            let avg = hop.latencies_ms.iter().sum::<f64>() / hop.latencies_ms.len() as f64;
            if avg > latency_threshold_ms {
                return Some(hop.index);
            }
            if hop.latencies_ms.len() >= 2 && stdev(hop.latencies_ms.iter().copied()) > 100.0 {
                return Some(hop.index);
            }
        }
    }
    None
}

/// Count hop positions whose IP differs between two routes, skipping the
/// first `ignore_first` hops (local network noise). Length differences
/// count per extra position.
pub fn route_diff_count(a: &[RouteHop], b: &[RouteHop], ignore_first: usize) -> usize {
    let common = a.len().min(b.len());
    let mut diff = 0;
    for i in ignore_first..common {
        if a[i].ip != b[i].ip {
            diff += 1;
        }
    }
    let longest = a.len().max(b.len());
    diff + longest.saturating_sub(common.max(ignore_first))
}
