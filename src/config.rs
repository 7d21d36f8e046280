use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::state::RecordKind;

/// Time window during which audio alerts are muted (visual entries still recorded)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl QuietHours {
    /// Check whether the given hour-of-day falls inside the window.
    /// Windows may wrap midnight (e.g. 23..7).
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Smart alert pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartAlertConfig {
    pub enabled: bool,
    pub dedup_window: Duration,
    pub group_window: Duration,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub escalation_after: Duration,
    pub adaptive_sigma: f64,
    pub baseline_window_hours: u32,
    pub min_samples: usize,
    pub similarity_threshold: f64,
}

impl Default for SmartAlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_window: Duration::from_secs(300),
            group_window: Duration::from_secs(600),
            rate_limit_per_minute: 10,
            rate_limit_burst: 5,
            escalation_after: Duration::from_secs(30 * 60),
            adaptive_sigma: 2.0,
            baseline_window_hours: 24,
            min_samples: 5,
            similarity_threshold: 0.85,
        }
    }
}

/// Runtime configuration, read from environment variables with built-in
/// defaults. Every numeric option is clamped to a sane range rather than
/// rejected; structural problems (bad bind address, insecure bind without
/// credentials) are startup errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: String,
    pub interval: Duration,
    pub window_size: usize,
    pub latency_window: usize,

    pub packet_loss_threshold: f64,
    pub avg_latency_threshold: f64,
    pub jitter_threshold: f64,
    pub consecutive_loss_threshold: u32,

    pub enable_sound_alerts: bool,
    pub alert_cooldown: Duration,
    pub quiet_hours: Option<QuietHours>,
    pub max_alerts_history: usize,
    pub smart: SmartAlertConfig,

    pub enable_dns_monitoring: bool,
    pub dns_test_domain: String,
    pub dns_record_types: Vec<RecordKind>,
    pub dns_check_interval: Duration,
    pub dns_slow_threshold: f64,
    pub enable_dns_benchmark: bool,
    pub dns_benchmark_servers: Vec<String>,
    pub dns_benchmark_dotcom_domain: String,
    pub dns_benchmark_history_size: usize,

    pub enable_mtu_monitoring: bool,
    pub mtu_check_interval: Duration,
    pub mtu_issue_consecutive: u32,
    pub mtu_clear_consecutive: u32,
    pub mtu_diff_threshold: u32,

    pub enable_hop_monitoring: bool,
    pub hop_ping_interval: Duration,
    pub hop_ping_timeout: Duration,
    pub hop_rediscover_interval: Duration,
    pub hop_latency_good: f64,
    pub hop_latency_warn: f64,

    pub enable_auto_traceroute: bool,
    pub traceroute_trigger_losses: u32,
    pub traceroute_cooldown: Duration,
    pub traceroute_max_hops: u32,
    pub route_analysis_interval: Duration,
    pub route_change_consecutive: u32,
    pub route_change_hop_diff: usize,
    pub route_ignore_first_hops: usize,
    pub hop_timeout_threshold: f64,
    pub snapshot_dir: PathBuf,

    pub enable_ip_change_alert: bool,
    pub ip_check_interval: Duration,
    pub ttl_check_interval: u32,

    pub enable_version_check: bool,
    pub version_check_interval: Duration,

    pub enable_problem_analysis: bool,
    pub problem_analysis_interval: Duration,
    pub problem_suppression: Duration,

    pub enable_http: bool,
    pub metrics_addr: SocketAddr,
    pub health_token: Option<String>,
    pub health_auth: Option<(String, String)>,
    pub allow_unauthenticated_bind: bool,

    pub shutdown_timeout: Duration,
    pub allow_missing_ping: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: "1.1.1.1".into(),
            interval: Duration::from_secs(1),
            window_size: 1800,
            latency_window: 600,
            packet_loss_threshold: 5.0,
            avg_latency_threshold: 100.0,
            jitter_threshold: 30.0,
            consecutive_loss_threshold: 5,
            enable_sound_alerts: true,
            alert_cooldown: Duration::from_secs(5),
            quiet_hours: None,
            max_alerts_history: 100,
            smart: SmartAlertConfig::default(),
            enable_dns_monitoring: true,
            dns_test_domain: "cloudflare.com".into(),
            dns_record_types: vec![
                RecordKind::A,
                RecordKind::Aaaa,
                RecordKind::Cname,
                RecordKind::Mx,
                RecordKind::Txt,
                RecordKind::Ns,
            ],
            dns_check_interval: Duration::from_secs(10),
            dns_slow_threshold: 100.0,
            enable_dns_benchmark: true,
            dns_benchmark_servers: vec!["system".into()],
            dns_benchmark_dotcom_domain: "cloudflare.com".into(),
            dns_benchmark_history_size: 50,
            enable_mtu_monitoring: true,
            mtu_check_interval: Duration::from_secs(30),
            mtu_issue_consecutive: 3,
            mtu_clear_consecutive: 2,
            mtu_diff_threshold: 50,
            enable_hop_monitoring: true,
            hop_ping_interval: Duration::from_secs(1),
            hop_ping_timeout: Duration::from_millis(500),
            hop_rediscover_interval: Duration::from_secs(3600),
            hop_latency_good: 50.0,
            hop_latency_warn: 100.0,
            enable_auto_traceroute: true,
            traceroute_trigger_losses: 3,
            traceroute_cooldown: Duration::from_secs(300),
            traceroute_max_hops: 15,
            route_analysis_interval: Duration::from_secs(1800),
            route_change_consecutive: 2,
            route_change_hop_diff: 2,
            route_ignore_first_hops: 2,
            hop_timeout_threshold: 3000.0,
            snapshot_dir: PathBuf::from("traceroutes"),
            enable_ip_change_alert: true,
            ip_check_interval: Duration::from_secs(15),
            ttl_check_interval: 10,
            enable_version_check: true,
            version_check_interval: Duration::from_secs(3600),
            enable_problem_analysis: true,
            problem_analysis_interval: Duration::from_secs(60),
            problem_suppression: Duration::from_secs(6000),
            enable_http: true,
            metrics_addr: "127.0.0.1:8000".parse().expect("loopback default"),
            health_token: None,
            health_auth: None,
            allow_unauthenticated_bind: false,
            shutdown_timeout: Duration::from_secs(10),
            allow_missing_ping: false,
        }
    }
}

impl Config {
    /// Build configuration from the environment, then apply CLI overrides.
    pub fn from_env(args: &Args) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(target) = env_string("TARGET_IP") {
            cfg.target = target;
        }
        if let Some(ref target) = args.target {
            cfg.target = target.clone();
        }
        // Reject argv-injection shaped targets before they ever reach a command line
        if cfg.target.trim().is_empty() || cfg.target.trim().starts_with('-') {
            bail!("invalid target {:?}", cfg.target);
        }

        cfg.interval = secs_f64(env_raw("INTERVAL"), 1.0, 0.2, 60.0);
        if let Some(secs) = args.interval {
            cfg.interval = secs_f64(Some(secs.to_string()), 1.0, 0.2, 60.0);
        }
        cfg.window_size = usize_bounded(env_raw("WINDOW_SIZE"), 1800, 60, 86_400);
        cfg.latency_window = usize_bounded(env_raw("LATENCY_WINDOW"), 600, 30, 86_400);

        cfg.packet_loss_threshold = f64_bounded(env_raw("PACKET_LOSS_THRESHOLD"), 5.0, 0.1, 100.0);
        cfg.avg_latency_threshold = f64_bounded(env_raw("AVG_LATENCY_THRESHOLD"), 100.0, 1.0, 10_000.0);
        cfg.jitter_threshold = f64_bounded(env_raw("JITTER_THRESHOLD"), 30.0, 1.0, 1_000.0);
        cfg.consecutive_loss_threshold =
            u32_bounded(env_raw("CONSECUTIVE_LOSS_THRESHOLD"), 5, 1, 1_000);

        cfg.enable_sound_alerts = env_bool("ENABLE_SOUND_ALERTS", true);
        cfg.alert_cooldown = secs_f64(env_raw("ALERT_COOLDOWN"), 5.0, 1.0, 600.0);
        cfg.max_alerts_history = usize_bounded(env_raw("MAX_ALERTS_HISTORY"), 100, 10, 10_000);
        if env_bool("ENABLE_QUIET_HOURS", false) {
            cfg.quiet_hours = Some(QuietHours {
                start_hour: u32_bounded(env_raw("QUIET_HOURS_START"), 23, 0, 23),
                end_hour: u32_bounded(env_raw("QUIET_HOURS_END"), 7, 0, 23),
            });
        }

        cfg.smart = SmartAlertConfig {
            enabled: env_bool("SMART_ALERT_ENABLED", true),
            dedup_window: secs_f64(env_raw("SMART_ALERT_DEDUP_WINDOW_SECONDS"), 300.0, 10.0, 3600.0),
            group_window: secs_f64(env_raw("SMART_ALERT_GROUP_WINDOW_SECONDS"), 600.0, 10.0, 7200.0),
            rate_limit_per_minute: u32_bounded(env_raw("SMART_ALERT_RATE_LIMIT_PER_MINUTE"), 10, 1, 600),
            rate_limit_burst: u32_bounded(env_raw("SMART_ALERT_BURST_LIMIT"), 5, 1, 100),
            escalation_after: Duration::from_secs(
                60 * u32_bounded(env_raw("ALERT_ESCALATION_TIME_MINUTES"), 30, 1, 1440) as u64,
            ),
            adaptive_sigma: f64_bounded(env_raw("SMART_ALERT_ADAPTIVE_SIGMA"), 2.0, 0.5, 10.0),
            baseline_window_hours: u32_bounded(env_raw("SMART_ALERT_BASELINE_WINDOW_HOURS"), 24, 1, 168),
            min_samples: usize_bounded(env_raw("SMART_ALERT_MIN_SAMPLES"), 5, 1, 1000),
            similarity_threshold: f64_bounded(env_raw("SMART_ALERT_SIMILARITY_THRESHOLD"), 0.85, 0.1, 1.0),
        };

        cfg.enable_dns_monitoring = env_bool("ENABLE_DNS_MONITORING", true) && !args.no_dns;
        if let Some(domain) = env_string("DNS_TEST_DOMAIN") {
            cfg.dns_test_domain = domain;
        }
        if let Some(raw) = env_string("DNS_RECORD_TYPES") {
            let kinds: Vec<RecordKind> = raw
                .split(',')
                .filter_map(|s| RecordKind::parse(s.trim()))
                .collect();
            if !kinds.is_empty() {
                cfg.dns_record_types = kinds;
            }
        }
        cfg.dns_check_interval = secs_f64(env_raw("DNS_CHECK_INTERVAL"), 10.0, 2.0, 3600.0);
        cfg.dns_slow_threshold = f64_bounded(env_raw("DNS_SLOW_THRESHOLD"), 100.0, 1.0, 10_000.0);
        cfg.enable_dns_benchmark = env_bool("ENABLE_DNS_BENCHMARK", true) && !args.no_dns;
        if let Some(raw) = env_string("DNS_BENCHMARK_SERVERS") {
            let servers: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !servers.is_empty() {
                cfg.dns_benchmark_servers = servers;
            }
        }
        if let Some(domain) = env_string("DNS_BENCHMARK_DOTCOM_DOMAIN") {
            cfg.dns_benchmark_dotcom_domain = domain;
        }
        cfg.dns_benchmark_history_size =
            usize_bounded(env_raw("DNS_BENCHMARK_HISTORY_SIZE"), 50, 5, 10_000);

        cfg.enable_mtu_monitoring = env_bool("ENABLE_MTU_MONITORING", true) && !args.no_mtu;
        cfg.mtu_check_interval = secs_f64(env_raw("MTU_CHECK_INTERVAL"), 30.0, 5.0, 3600.0);
        cfg.mtu_issue_consecutive = u32_bounded(env_raw("MTU_ISSUE_CONSECUTIVE"), 3, 1, 100);
        cfg.mtu_clear_consecutive = u32_bounded(env_raw("MTU_CLEAR_CONSECUTIVE"), 2, 1, 100);
        cfg.mtu_diff_threshold = u32_bounded(env_raw("MTU_DIFF_THRESHOLD"), 50, 1, 9000);

        cfg.enable_hop_monitoring = env_bool("ENABLE_HOP_MONITORING", true) && !args.no_hops;
        cfg.hop_ping_interval = secs_f64(env_raw("HOP_PING_INTERVAL"), 1.0, 0.5, 60.0);
        cfg.hop_ping_timeout = secs_f64(env_raw("HOP_PING_TIMEOUT"), 0.5, 0.1, 5.0);
        cfg.hop_rediscover_interval = secs_f64(env_raw("HOP_REDISCOVER_INTERVAL"), 3600.0, 60.0, 86_400.0);
        cfg.hop_latency_good = f64_bounded(env_raw("HOP_LATENCY_GOOD"), 50.0, 1.0, 1_000.0);
        cfg.hop_latency_warn = f64_bounded(env_raw("HOP_LATENCY_WARN"), 100.0, 1.0, 10_000.0);

        cfg.enable_auto_traceroute = env_bool("ENABLE_AUTO_TRACEROUTE", true);
        cfg.traceroute_trigger_losses = u32_bounded(env_raw("TRACEROUTE_TRIGGER_LOSSES"), 3, 1, 100);
        cfg.traceroute_cooldown = secs_f64(env_raw("TRACEROUTE_COOLDOWN"), 300.0, 30.0, 86_400.0);
        cfg.traceroute_max_hops = u32_bounded(env_raw("TRACEROUTE_MAX_HOPS"), 15, 3, 64);
        cfg.route_analysis_interval = secs_f64(env_raw("ROUTE_ANALYSIS_INTERVAL"), 1800.0, 60.0, 86_400.0);
        cfg.route_change_consecutive = u32_bounded(env_raw("ROUTE_CHANGE_CONSECUTIVE"), 2, 1, 20);
        cfg.route_change_hop_diff = usize_bounded(env_raw("ROUTE_CHANGE_HOP_DIFF"), 2, 1, 64);
        cfg.route_ignore_first_hops = usize_bounded(env_raw("ROUTE_IGNORE_FIRST_HOPS"), 2, 0, 16);
        cfg.hop_timeout_threshold = f64_bounded(env_raw("HOP_TIMEOUT_THRESHOLD"), 3000.0, 100.0, 60_000.0);
        if let Some(dir) = env_string("TRACEROUTE_SNAPSHOT_DIR") {
            cfg.snapshot_dir = PathBuf::from(dir);
        }

        cfg.enable_ip_change_alert = env_bool("ENABLE_IP_CHANGE_ALERT", true);
        cfg.ip_check_interval = secs_f64(env_raw("IP_CHECK_INTERVAL"), 15.0, 5.0, 3600.0);
        cfg.ttl_check_interval = u32_bounded(env_raw("TTL_CHECK_INTERVAL"), 10, 1, 1000);

        cfg.enable_version_check = env_bool("ENABLE_VERSION_CHECK", true);
        cfg.version_check_interval = secs_f64(env_raw("VERSION_CHECK_INTERVAL"), 3600.0, 300.0, 86_400.0);

        cfg.enable_problem_analysis = env_bool("ENABLE_PROBLEM_ANALYSIS", true);
        cfg.problem_analysis_interval = secs_f64(env_raw("PROBLEM_ANALYSIS_INTERVAL"), 60.0, 5.0, 3600.0);
        cfg.problem_suppression = secs_f64(env_raw("PROBLEM_LOG_SUPPRESSION_SECONDS"), 6000.0, 60.0, 86_400.0);

        cfg.enable_http = env_bool("ENABLE_METRICS", true) && !args.no_http;
        let addr = env_string("METRICS_ADDR").unwrap_or_else(|| "127.0.0.1".into());
        let port = u32_bounded(env_raw("METRICS_PORT"), 8000, 1, 65_535) as u16;
        cfg.metrics_addr = match format!("{addr}:{port}").parse() {
            Ok(sa) => sa,
            Err(_) => bail!("invalid METRICS_ADDR {addr:?}"),
        };
        cfg.health_token = env_string("HEALTH_TOKEN").filter(|t| !t.is_empty());
        let user = env_string("HEALTH_AUTH_USER").unwrap_or_default();
        let pass = env_string("HEALTH_AUTH_PASS").unwrap_or_default();
        if !user.is_empty() && !pass.is_empty() {
            cfg.health_auth = Some((user, pass));
        }
        cfg.allow_unauthenticated_bind = env_bool("HEALTH_ALLOW_NO_AUTH", false);

        cfg.shutdown_timeout = secs_f64(env_raw("SHUTDOWN_TIMEOUT_SECONDS"), 10.0, 1.0, 120.0);
        cfg.allow_missing_ping = env_bool("PING_FALLBACK", false) || args.allow_missing_ping;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks that cannot be fixed by clamping.
    pub fn validate(&self) -> Result<()> {
        if self.enable_http
            && !self.metrics_addr.ip().is_loopback()
            && self.health_token.is_none()
            && self.health_auth.is_none()
            && !self.allow_unauthenticated_bind
        {
            bail!(
                "refusing to bind metrics/health to non-loopback {} without \
                 HEALTH_TOKEN, HEALTH_AUTH_USER/PASS or HEALTH_ALLOW_NO_AUTH=1",
                self.metrics_addr
            );
        }
        Ok(())
    }

    /// Per-probe timeout for the target ping: never longer than the interval.
    pub fn ping_timeout(&self) -> Duration {
        self.interval.min(Duration::from_secs(2))
    }
}

fn env_raw(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn f64_bounded(raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn secs_f64(raw: Option<String>, default: f64, min: f64, max: f64) -> Duration {
    Duration::from_secs_f64(f64_bounded(raw, default, min, max))
}

fn u32_bounded(raw: Option<String>, default: u32, min: u32, max: u32) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn usize_bounded(raw: Option<String>, default: usize, min: usize, max: usize) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_parse_clamps() {
        assert_eq!(f64_bounded(Some("250".into()), 100.0, 1.0, 200.0), 200.0);
        assert_eq!(f64_bounded(Some("junk".into()), 100.0, 1.0, 200.0), 100.0);
        assert_eq!(f64_bounded(None, 100.0, 1.0, 200.0), 100.0);
        assert_eq!(u32_bounded(Some("0".into()), 5, 1, 100), 1);
    }

    #[test]
    fn test_secs_parse() {
        assert_eq!(secs_f64(Some("0.5".into()), 1.0, 0.2, 60.0), Duration::from_millis(500));
        assert_eq!(secs_f64(Some("-3".into()), 1.0, 0.2, 60.0), Duration::from_millis(200));
    }

    #[test]
    fn test_quiet_hours_wrapping() {
        let qh = QuietHours { start_hour: 23, end_hour: 7 };
        assert!(qh.contains(23));
        assert!(qh.contains(3));
        assert!(!qh.contains(7));
        assert!(!qh.contains(12));

        let day = QuietHours { start_hour: 9, end_hour: 17 };
        assert!(day.contains(9));
        assert!(!day.contains(17));
        assert!(!day.contains(3));
    }

    #[test]
    fn test_validate_rejects_insecure_bind() {
        let mut cfg = Config::default();
        cfg.metrics_addr = "0.0.0.0:8000".parse().unwrap();
        assert!(cfg.validate().is_err());

        cfg.health_token = Some("secret".into());
        assert!(cfg.validate().is_ok());

        cfg.health_token = None;
        cfg.allow_unauthenticated_bind = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_ping_timeout_never_exceeds_interval() {
        let mut cfg = Config::default();
        cfg.interval = Duration::from_millis(500);
        assert_eq!(cfg.ping_timeout(), Duration::from_millis(500));
        cfg.interval = Duration::from_secs(30);
        assert_eq!(cfg.ping_timeout(), Duration::from_secs(2));
    }
}
