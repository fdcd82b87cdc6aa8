use anyhow::Result;
use nix::fcntl::{Flock, FlockArg};
use pkg_constants::network::LOCK_RETRY_SECS;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Cross-process exclusive lock over a well-known file.
///
/// Concurrent plugin processes serialize the read-occupancy-then-program
/// section on it. Only the descriptor's `flock` state matters; the file's
/// contents are never read.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
    retry: Duration,
}

/// Held lock. Dropping it releases the lock.
pub struct LockGuard {
    _lock: Flock<File>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        info!("Releasing lock {}", self.path.display());
    }
}

impl AdvisoryLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: Duration::from_secs(LOCK_RETRY_SECS),
        }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held. A failed lock call is logged and retried
    /// after the retry interval; only failing to open the file is an error.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire_blocking()).await?
    }

    pub fn acquire_blocking(&self) -> Result<LockGuard> {
        loop {
            let file = File::options()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| {
                    anyhow::anyhow!("Failed to open lock file {}: {}", self.path.display(), e)
                })?;
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(lock) => {
                    info!("Acquired lock {}", self.path.display());
                    return Ok(LockGuard {
                        _lock: lock,
                        path: self.path.clone(),
                    });
                }
                Err((_, errno)) => {
                    error!(
                        "can't get lockfile {} ({}), waiting {}s",
                        self.path.display(),
                        errno,
                        self.retry.as_secs_f32()
                    );
                    std::thread::sleep(self.retry);
                }
            }
        }
    }
}
