use std::time::Duration;

use crate::proc::{ProcessSupervisor, SpawnKind, SpawnOutput};
use crate::state::ErrorKind;

/// Parsed reply of a single successful ping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingReply {
    pub rtt_ms: f64,
    pub ttl: Option<u32>,
}

/// Build the platform ping command: one echo request, numeric output,
/// per-probe timeout no longer than the tick interval.
#[cfg(not(windows))]
pub fn build_ping_args(target: &str, ipv6: bool, timeout: Duration) -> Vec<String> {
    let wait = format!("{:.1}", timeout.as_secs_f64().max(0.1));
    let mut args = vec!["ping".to_string()];
    if ipv6 {
        args.push("-6".into());
    }
    args.extend(["-n".into(), "-c".into(), "1".into(), "-W".into(), wait, target.to_string()]);
    args
}

#[cfg(windows)]
pub fn build_ping_args(target: &str, _ipv6: bool, timeout: Duration) -> Vec<String> {
    let wait_ms = timeout.as_millis().max(100).to_string();
    vec!["ping".into(), "-n".into(), "1".into(), "-w".into(), wait_ms, target.to_string()]
}

/// Build a don't-fragment ping with an explicit payload size (PMTU probing)
#[cfg(not(windows))]
pub fn build_df_ping_args(target: &str, ipv6: bool, payload: u32) -> Vec<String> {
    let mut args = vec!["ping".to_string()];
    if ipv6 {
        args.push("-6".into());
    }
    args.extend([
        "-n".into(),
        "-c".into(),
        "1".into(),
        "-W".into(),
        "2".into(),
        "-M".into(),
        "do".into(),
        "-s".into(),
        payload.to_string(),
        target.to_string(),
    ]);
    args
}

#[cfg(windows)]
pub fn build_df_ping_args(target: &str, _ipv6: bool, payload: u32) -> Vec<String> {
    vec![
        "ping".into(),
        "-n".into(),
        "1".into(),
        "-w".into(),
        "2000".into(),
        "-f".into(),
        "-l".into(),
        payload.to_string(),
        target.to_string(),
    ]
}

/// Interpret a finished ping run. A non-zero exit code means failure
/// even when latency-looking numbers appear in the output (some
/// platforms print `time=0ms` on timeout).
pub fn interpret_ping(output: &SpawnOutput) -> Result<PingReply, ErrorKind> {
    match output.kind {
        SpawnKind::Ok => {}
        SpawnKind::Timeout => return Err(ErrorKind::TransientIo),
        SpawnKind::Killed => return Err(ErrorKind::Cancelled),
        SpawnKind::SpawnError => return Err(ErrorKind::PermanentIo),
    }
    if output.exit_code != Some(0) {
        return Err(ErrorKind::TransientIo);
    }
    match parse_rtt_ms(&output.stdout) {
        Some(rtt_ms) => Ok(PingReply { rtt_ms, ttl: parse_ttl(&output.stdout) }),
        None => Err(ErrorKind::ParseError),
    }
}

/// Extract the round-trip time from ping stdout. Tolerates comma
/// decimals and the `time<1ms` form.
pub fn parse_rtt_ms(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        let lower = line.to_ascii_lowercase();
        let Some(pos) = lower.find("time") else { continue };
        let after = &lower[pos + 4..];
        let below = after.trim_start().starts_with('<');
        let rest = after.trim_start_matches(['=', '<', '>', ' ']);
        let num: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
            .collect();
        if num.is_empty() {
            continue;
        }
        if let Ok(v) = num.replace(',', ".").parse::<f64>() {
            // `time<1ms` rounds down to half a millisecond
            return Some(if below && v <= 1.0 { 0.5 } else { v });
        }
    }
    None
}

/// Extract the TTL field (`ttl=57` / `TTL=57`)
pub fn parse_ttl(stdout: &str) -> Option<u32> {
    let lower = stdout.to_ascii_lowercase();
    let pos = lower.find("ttl")?;
    let rest = &lower[pos + 3..];
    let rest = rest.trim_start_matches(['=', ':', ' ']);
    let num: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    num.parse().ok()
}

/// Estimate hop count from an observed TTL by assuming the sender
/// started from the nearest common initial value.
pub fn estimate_hops(ttl: u32) -> Option<u32> {
    for initial in [64u32, 128, 255] {
        if ttl <= initial {
            return Some(initial - ttl);
        }
    }
    None
}

/// Check at startup whether the system ping binary exists at all.
pub fn ping_binary_available() -> bool {
    which("ping")
}

/// Check whether traceroute (or tracert) is present.
pub fn traceroute_binary_available() -> bool {
    #[cfg(windows)]
    {
        which("tracert")
    }
    #[cfg(not(windows))]
    {
        which("traceroute")
    }
}

fn which(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(binary);
        #[cfg(windows)]
        let candidate = candidate.with_extension("exe");
        candidate.is_file()
    })
}

/// Ping one host once through the supervisor and classify the result.
pub async fn ping_once(
    procs: &ProcessSupervisor,
    target: &str,
    ipv6: bool,
    timeout: Duration,
) -> Result<PingReply, ErrorKind> {
    let args = build_ping_args(target, ipv6, timeout);
    // hard cap slightly above the ping's own wait so the tool, not the
    // supervisor, is what normally reports the timeout
    let output = procs.run("ping", &args, timeout + Duration::from_millis(500)).await;
    interpret_ping(&output)
}

/// The core probe loop: one ping per tick, committed to the
/// repository. TTL updates piggyback on the same output every
/// `TTL_CHECK_INTERVAL` ticks, and connection transitions re-run the
/// classifier synchronously so the diagnosis is never stale while the
/// UI shows DISCONNECTED.
pub async fn run_ping_worker(ctx: crate::app::EngineContext) {
    use std::sync::atomic::Ordering;

    use chrono::Utc;
    use tracing::{info, warn};

    let mut ticker = crate::sched::worker_interval(ctx.config.interval);
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                ticks = ticks.wrapping_add(1);
                let result = ping_once(
                    &ctx.procs,
                    &ctx.config.target,
                    ctx.target_is_ipv6,
                    ctx.config.ping_timeout(),
                )
                .await;
                let now = Utc::now();

                let sample = match result {
                    Ok(reply) => {
                        if ticks == 1 || ticks % ctx.config.ttl_check_interval == 0 {
                            if let Some(ttl) = reply.ttl {
                                ctx.repo.record_ttl(Some(ttl), estimate_hops(ttl));
                            }
                        }
                        crate::state::Sample::ok(now, reply.rtt_ms)
                    }
                    Err(kind) => crate::state::Sample::failed(now, kind),
                };

                let lost = sample.counts_as_loss();
                if let Some(transition) = ctx.repo.record_ping_result(sample) {
                    match transition {
                        crate::state::ConnectionTransition::Lost => {
                            warn!(target = %ctx.config.target, "connection lost");
                        }
                        crate::state::ConnectionTransition::Recovered => {
                            info!(target = %ctx.config.target, "connection recovered");
                        }
                    }
                    ctx.reclassify_now();
                }

                if lost
                    && ctx.config.enable_auto_traceroute
                    && ctx.repo.consecutive_losses() >= ctx.config.traceroute_trigger_losses
                {
                    ctx.traceroute_request.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OK: &str = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.
64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.4 ms

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 12.394/12.394/12.394/0.000 ms";

    const WINDOWS_OK: &str = "\
Pinging 1.1.1.1 with 32 bytes of data:
Reply from 1.1.1.1: bytes=32 time=14ms TTL=57

Ping statistics for 1.1.1.1:
    Packets: Sent = 1, Received = 1, Lost = 0 (0% loss)";

    const WINDOWS_SUB_MS: &str = "Reply from 192.168.1.1: bytes=32 time<1ms TTL=64";

    const COMMA_DECIMAL: &str = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=8,3 ms";

    fn spawn_ok(stdout: &str, code: i32) -> SpawnOutput {
        SpawnOutput { stdout: stdout.to_string(), exit_code: Some(code), kind: SpawnKind::Ok }
    }

    #[test]
    fn test_parse_linux_output() {
        assert_eq!(parse_rtt_ms(LINUX_OK), Some(12.4));
        assert_eq!(parse_ttl(LINUX_OK), Some(57));
    }

    #[test]
    fn test_parse_windows_output() {
        assert_eq!(parse_rtt_ms(WINDOWS_OK), Some(14.0));
        assert_eq!(parse_ttl(WINDOWS_OK), Some(57));
    }

    #[test]
    fn test_parse_sub_millisecond() {
        assert_eq!(parse_rtt_ms(WINDOWS_SUB_MS), Some(0.5));
    }

    #[test]
    fn test_parse_comma_decimal() {
        assert_eq!(parse_rtt_ms(COMMA_DECIMAL), Some(8.3));
    }

    #[test]
    fn test_nonzero_exit_is_failure_despite_time_text() {
        // some platforms print time=0ms on timeout; the exit code wins
        let out = spawn_ok("Reply from 1.1.1.1: time=0ms TTL=57", 1);
        assert_eq!(interpret_ping(&out), Err(ErrorKind::TransientIo));
    }

    #[test]
    fn test_interpret_ok() {
        let out = spawn_ok(LINUX_OK, 0);
        let reply = interpret_ping(&out).unwrap();
        assert_eq!(reply.rtt_ms, 12.4);
        assert_eq!(reply.ttl, Some(57));
    }

    #[test]
    fn test_interpret_kinds() {
        let timeout = SpawnOutput { stdout: String::new(), exit_code: None, kind: SpawnKind::Timeout };
        assert_eq!(interpret_ping(&timeout), Err(ErrorKind::TransientIo));
        let killed = SpawnOutput { stdout: String::new(), exit_code: None, kind: SpawnKind::Killed };
        assert_eq!(interpret_ping(&killed), Err(ErrorKind::Cancelled));
        let nospawn = SpawnOutput { stdout: String::new(), exit_code: None, kind: SpawnKind::SpawnError };
        assert_eq!(interpret_ping(&nospawn), Err(ErrorKind::PermanentIo));
    }

    #[test]
    fn test_unparsable_success_is_parse_error() {
        let out = spawn_ok("nothing useful here", 0);
        assert_eq!(interpret_ping(&out), Err(ErrorKind::ParseError));
    }

    #[test]
    fn test_estimate_hops() {
        assert_eq!(estimate_hops(57), Some(7));
        assert_eq!(estimate_hops(118), Some(10));
        assert_eq!(estimate_hops(250), Some(5));
        assert_eq!(estimate_hops(300), None);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_ping_args_shape() {
        let args = build_ping_args("1.1.1.1", false, Duration::from_secs(1));
        assert_eq!(args[0], "ping");
        assert!(args.contains(&"-n".to_string()));
        assert!(args.contains(&"-c".to_string()));
        assert_eq!(args.last().unwrap(), "1.1.1.1");

        let v6 = build_ping_args("2606:4700::1111", true, Duration::from_secs(1));
        assert!(v6.contains(&"-6".to_string()));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_df_ping_args_shape() {
        let args = build_df_ping_args("1.1.1.1", false, 1472);
        assert!(args.contains(&"-M".to_string()));
        assert!(args.contains(&"do".to_string()));
        assert!(args.contains(&"1472".to_string()));
    }
}
