use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Single-instance lock: a pid file in the user home directory.
/// A stale lock (dead owner) is removed at startup; the live lock is
/// removed on drop so a crash at most leaves a stale file behind.
pub struct InstanceLock {
    path: PathBuf,
    held: bool,
}

impl InstanceLock {
    /// Acquire the default lock under `~/.pathwatch/`.
    pub fn acquire() -> Result<Self> {
        let dir = dirs::home_dir()
            .context("cannot determine home directory")?
            .join(".pathwatch");
        Self::acquire_at(dir.join("pathwatch.lock"))
    }

    pub fn acquire_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        if path.exists() {
            match read_owner(&path) {
                Some(pid) if pid_alive(pid) => {
                    bail!("another instance is already running (pid {pid})");
                }
                Some(pid) => {
                    info!(pid, "removing stale instance lock");
                    let _ = fs::remove_file(&path);
                }
                None => {
                    warn!(path = %path.display(), "unreadable instance lock, removing");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("cannot write lock file {}", path.display()))?;
        Ok(Self { path, held: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.held {
            self.held = false;
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(error = %err, "could not remove instance lock");
            }
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Without a process table to consult, assume the owner is alive; the
/// operator can delete the file by hand if it is genuinely stale.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let lock = InstanceLock::acquire_at(path.clone()).unwrap();
        assert!(path.exists());
        let owner = read_owner(&path).unwrap();
        assert_eq!(owner, std::process::id());

        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let _lock = InstanceLock::acquire_at(path.clone()).unwrap();
        // our own pid is alive, so the second acquisition must fail
        assert!(InstanceLock::acquire_at(path).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stale_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        // pids near u32::MAX are far beyond the default pid_max
        fs::write(&path, "4294967294").unwrap();

        let lock = InstanceLock::acquire_at(path.clone()).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        fs::write(&path, "not a pid").unwrap();
        assert!(InstanceLock::acquire_at(path).is_ok());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        {
            let _lock = InstanceLock::acquire_at(path.clone()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
