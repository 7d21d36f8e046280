use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::analyze::ProblemClassifier;
use crate::config::Config;
use crate::proc::ProcessSupervisor;
use crate::state::StatsRepository;

/// Shared handles passed to every worker. Cloning is cheap; everything
/// mutable lives behind its own lock.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub repo: Arc<StatsRepository>,
    pub procs: Arc<ProcessSupervisor>,
    pub cancel: CancellationToken,
    pub classifier: Arc<Mutex<ProblemClassifier>>,
    /// Set by the IP worker and the route detector to make the hop
    /// prober rebuild its table on the next tick
    pub hop_rediscover: Arc<AtomicBool>,
    /// Set by the ping worker when consecutive losses warrant an
    /// out-of-schedule traceroute
    pub traceroute_request: Arc<AtomicBool>,
    pub target_is_ipv6: bool,
}

impl EngineContext {
    pub fn new(config: Config) -> Self {
        let target_is_ipv6 = config
            .target
            .parse::<IpAddr>()
            .map(|ip| ip.is_ipv6())
            .unwrap_or(false);
        let classifier = ProblemClassifier::new(&config);
        let repo = StatsRepository::new(&config);
        Self {
            config: Arc::new(config),
            repo: Arc::new(repo),
            procs: Arc::new(ProcessSupervisor::new()),
            cancel: CancellationToken::new(),
            classifier: Arc::new(Mutex::new(classifier)),
            hop_rediscover: Arc::new(AtomicBool::new(false)),
            traceroute_request: Arc::new(AtomicBool::new(false)),
            target_is_ipv6,
        }
    }

    /// Run the classifier against a fresh snapshot and write the result
    /// back. Used by the periodic worker and synchronously by the ping
    /// worker on connection transitions so the diagnosis is never stale
    /// while the UI shows DISCONNECTED.
    pub fn reclassify_now(&self) {
        let snap = self.repo.snapshot();
        let diagnosis = self.classifier.lock().evaluate(&snap, chrono::Utc::now());
        self.repo.update_problem(diagnosis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProblemKind;

    #[test]
    fn test_ipv6_detection() {
        let mut config = Config::default();
        config.target = "2606:4700:4700::1111".into();
        assert!(EngineContext::new(config).target_is_ipv6);

        let mut config = Config::default();
        config.target = "1.1.1.1".into();
        assert!(!EngineContext::new(config).target_is_ipv6);

        let mut config = Config::default();
        config.target = "example.com".into();
        assert!(!EngineContext::new(config).target_is_ipv6);
    }

    #[test]
    fn test_reclassify_now_writes_back() {
        let ctx = EngineContext::new(Config::default());
        ctx.reclassify_now();
        assert_eq!(ctx.repo.snapshot().problem.kind, ProblemKind::None);
    }
}
