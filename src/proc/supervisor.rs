use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a supervised subprocess ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnKind {
    /// Process exited on its own within the deadline
    Ok,
    /// Wall-clock timeout hit; process was killed and reaped
    Timeout,
    /// Engine shutdown interrupted the run; process was killed
    Killed,
    /// The process could not be started at all
    SpawnError,
}

/// Result of a supervised subprocess run
#[derive(Debug, Clone)]
pub struct SpawnOutput {
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub kind: SpawnKind,
}

impl SpawnOutput {
    pub fn success(&self) -> bool {
        self.kind == SpawnKind::Ok && self.exit_code == Some(0)
    }

    fn spawn_error() -> Self {
        Self { stdout: String::new(), exit_code: None, kind: SpawnKind::SpawnError }
    }
}

/// Owns every external subprocess (`ping`, `traceroute`, ...). Each run
/// carries a hard wall-clock timeout; on engine shutdown every tracked
/// process is terminated within a bounded grace period. Children are
/// spawned with kill-on-drop so a cancelled caller can never leak one.
pub struct ProcessSupervisor {
    registry: Mutex<HashMap<u32, &'static str>>,
    shutdown: CancellationToken,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self { registry: Mutex::new(HashMap::new()), shutdown: CancellationToken::new() }
    }

    /// Run a command to completion with a hard timeout, returning its
    /// stdout. Never blocks past `timeout` plus a short kill grace.
    pub async fn run(&self, tag: &'static str, argv: &[String], timeout: Duration) -> SpawnOutput {
        if argv.is_empty() || self.shutdown.is_cancelled() {
            return SpawnOutput::spawn_error();
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW: keep console-less services from popping terminals
            cmd.creation_flags(0x0800_0000);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                debug!(tag, error = %err, "subprocess spawn failed");
                return SpawnOutput::spawn_error();
            }
        };

        let pid = child.id().unwrap_or(0);
        self.registry.lock().insert(pid, tag);

        // Drain stdout concurrently so a chatty child cannot block on a
        // full pipe while we wait on its exit.
        let mut stdout_pipe = child.stdout.take();
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut out) = stdout_pipe {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });

        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait()) => match res {
                Ok(Ok(status)) => (SpawnKind::Ok, status.code()),
                Ok(Err(err)) => {
                    warn!(tag, pid, error = %err, "subprocess wait failed");
                    (SpawnKind::SpawnError, None)
                }
                Err(_) => {
                    debug!(tag, pid, "subprocess timed out, killing");
                    (SpawnKind::Timeout, None)
                }
            },
            _ = self.shutdown.cancelled() => (SpawnKind::Killed, None),
        };

        if outcome.0 != SpawnKind::Ok {
            let _ = child.start_kill();
            // reap with a short bound so zombies never accumulate
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }

        self.registry.lock().remove(&pid);

        let stdout = match reader.await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        SpawnOutput { stdout, exit_code: outcome.1, kind: outcome.0 }
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Signal every in-flight run to kill its child, then wait up to
    /// `grace` for the registry to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let leftover = self.registry.lock().len();
        if leftover > 0 {
            warn!(leftover, "subprocesses still tracked after shutdown grace");
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
