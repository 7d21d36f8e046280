use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pathwatch::alert::run_alert_worker;
use pathwatch::analyze::run_classifier_worker;
use pathwatch::app::EngineContext;
use pathwatch::cli::Args;
use pathwatch::config::Config;
use pathwatch::http;
use pathwatch::instance::InstanceLock;
use pathwatch::lookup::{run_dns_benchmark_worker, run_dns_monitor_worker, run_ip_worker, run_version_worker};
use pathwatch::metrics::EngineMetrics;
use pathwatch::probe::{ping_binary_available, run_mtu_worker, run_ping_worker, traceroute_binary_available};
use pathwatch::route::{run_hop_monitor_worker, run_route_detector_worker};
use pathwatch::sched::Orchestrator;

/// Subprocesses must be gone within this bound after the shutdown signal
const SUBPROCESS_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match Config::from_env(&args) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    // Bind the read-only surface up front: a bad address is a
    // misconfiguration, not a runtime failure.
    let listener = if config.enable_http {
        match tokio::net::TcpListener::bind(config.metrics_addr).await {
            Ok(listener) => Some(listener),
            Err(err) => {
                error!(addr = %config.metrics_addr, error = %err, "cannot bind metrics/health address");
                return ExitCode::from(2);
            }
        }
    } else {
        None
    };

    match run(config, listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, listener: Option<tokio::net::TcpListener>) -> anyhow::Result<()> {
    if !ping_binary_available() {
        if config.allow_missing_ping {
            warn!("system ping binary not found; running degraded without target probes");
        } else {
            anyhow::bail!("system ping binary not found (set PING_FALLBACK=1 to start anyway)");
        }
    }
    if !traceroute_binary_available() {
        warn!("traceroute binary not found; route detection disabled");
    }

    let lock = InstanceLock::acquire()?;
    info!(target = %config.target, version = env!("CARGO_PKG_VERSION"), "pathwatch starting");

    let metrics = Arc::new(EngineMetrics::new(&config.target)?);
    let ctx = EngineContext::new(config.clone());
    let mut orchestrator = Orchestrator::new(ctx.cancel.clone());

    if ping_binary_available() {
        orchestrator.spawn("ping", run_ping_worker(ctx.clone()));
    }
    if config.enable_dns_monitoring {
        orchestrator.spawn("dns-monitor", run_dns_monitor_worker(ctx.clone()));
    }
    if config.enable_dns_benchmark {
        orchestrator.spawn("dns-benchmark", run_dns_benchmark_worker(ctx.clone()));
    }
    if config.enable_ip_change_alert {
        orchestrator.spawn("public-ip", run_ip_worker(ctx.clone()));
    }
    if config.enable_mtu_monitoring {
        orchestrator.spawn("mtu", run_mtu_worker(ctx.clone()));
    }
    if traceroute_binary_available() {
        orchestrator.spawn("route-detector", run_route_detector_worker(ctx.clone()));
        if config.enable_hop_monitoring {
            orchestrator.spawn("hop-monitor", run_hop_monitor_worker(ctx.clone()));
        }
    }
    if config.enable_version_check {
        orchestrator.spawn("version", run_version_worker(ctx.clone()));
    }
    if config.enable_problem_analysis {
        orchestrator.spawn("classifier", run_classifier_worker(ctx.clone()));
    }
    if config.smart.enabled {
        orchestrator.spawn("alerts", run_alert_worker(ctx.clone()));
    }
    info!(workers = orchestrator.worker_count(), "engine running");

    let http_task = listener.map(|listener| {
        tokio::spawn(http::serve(listener, ctx.clone(), metrics.clone()))
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    ctx.cancel.cancel();
    orchestrator.shutdown(config.shutdown_timeout).await;
    ctx.procs.shutdown(SUBPROCESS_GRACE).await;
    if let Some(task) = http_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    lock.release();
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pathwatch=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
