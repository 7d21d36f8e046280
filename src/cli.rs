use clap::Parser;

/// Continuous network path monitor with hop probing, DNS health and smart alerts
#[derive(Parser, Debug, Clone)]
#[command(name = "pathwatch")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Ping target (IP address or hostname); overrides TARGET_IP
    #[arg(short = 't', long = "target")]
    pub target: Option<String>,

    /// Seconds between pings; overrides INTERVAL
    #[arg(short = 'i', long = "interval")]
    pub interval: Option<f64>,

    /// Disable DNS monitoring and benchmarks
    #[arg(long = "no-dns")]
    pub no_dns: bool,

    /// Disable hop monitoring
    #[arg(long = "no-hops")]
    pub no_hops: bool,

    /// Disable MTU monitoring
    #[arg(long = "no-mtu")]
    pub no_mtu: bool,

    /// Disable the metrics/health HTTP surface
    #[arg(long = "no-http")]
    pub no_http: bool,

    /// Allow startup without a system ping binary (engine runs degraded)
    #[arg(long = "allow-missing-ping")]
    pub allow_missing_ping: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["pathwatch"]);
        assert!(args.target.is_none());
        assert!(!args.no_dns);
        assert!(!args.allow_missing_ping);
    }

    #[test]
    fn test_args_target_override() {
        let args = Args::parse_from(["pathwatch", "-t", "8.8.8.8", "-i", "0.5"]);
        assert_eq!(args.target.as_deref(), Some("8.8.8.8"));
        assert_eq!(args.interval, Some(0.5));
    }
}
