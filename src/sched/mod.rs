use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval with the scheduling contract every worker follows: the
/// first tick fires immediately so all probes run at startup, and a
/// slow tick delays the next one instead of bursting ("fire no faster
/// than" the period).
pub fn worker_interval(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Drive a fallible tick function on a period until cancellation. A
/// failed tick is logged and the worker keeps running; it never aborts.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut ticker = worker_interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = tick().await {
                    warn!(worker = name, error = ?err, "worker tick failed");
                }
            }
        }
    }
    debug!(worker = name, "worker stopped");
}

/// Tracks every background worker so shutdown can wait for all of them
/// within a bounded deadline.
pub struct Orchestrator {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Orchestrator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, handles: Vec::new() }
    }

    pub fn spawn(&mut self, name: &'static str, fut: impl Future<Output = ()> + Send + 'static) {
        debug!(worker = name, "starting worker");
        self.handles.push((name, tokio::spawn(fut)));
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Flip the cancellation signal and await every worker up to the
    /// grace deadline; stragglers are aborted.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in self.handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(worker = name, "worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("all workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_periodic_fires_immediately_and_survives_errors() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let cancel2 = cancel.clone();

        let task = tokio::spawn(run_periodic(
            "test",
            Duration::from_millis(20),
            cancel2,
            move || {
                let count = count2.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        anyhow::bail!("every other tick fails");
                    }
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        task.await.unwrap();

        // first tick is immediate, errors do not stop the loop
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_orchestrator_shutdown_bounded() {
        let cancel = CancellationToken::new();
        let mut orch = Orchestrator::new(cancel.clone());

        let c = cancel.clone();
        orch.spawn("cooperative", async move {
            c.cancelled().await;
        });
        orch.spawn("stubborn", async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
        });
        assert_eq!(orch.worker_count(), 2);

        let started = std::time::Instant::now();
        orch.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
