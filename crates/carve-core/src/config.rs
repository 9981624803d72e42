use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::worker::WorkerConfig;

/// Sizing and timing of the worker pools.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub http_workers: usize,
    pub browser_workers: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub task_timeout: Duration,
    /// How often expired leases are swept.
    pub reclaim_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            http_workers: 4,
            browser_workers: 1,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(15),
        }
    }
}

impl DispatcherConfig {
    /// Read configuration from environment variables.
    ///
    /// - `CARVE_HTTP_WORKERS` (defaults to 4)
    /// - `CARVE_BROWSER_WORKERS` (defaults to 1; 0 disables the pool)
    /// - `CARVE_POLL_INTERVAL_MS` (defaults to 1000)
    /// - `CARVE_LEASE_SECS` (defaults to 30, at least 3)
    /// - `CARVE_TASK_TIMEOUT_SECS` (defaults to 300)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let lease_secs: u64 = env_or("CARVE_LEASE_SECS", defaults.lease.as_secs())?;
        if lease_secs < 3 {
            return Err(AppError::ConfigError(
                "CARVE_LEASE_SECS must be at least 3".into(),
            ));
        }
        let timeout_secs: u64 = env_or("CARVE_TASK_TIMEOUT_SECS", defaults.task_timeout.as_secs())?;
        if timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "CARVE_TASK_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        let lease = Duration::from_secs(lease_secs);

        Ok(Self {
            http_workers: env_or("CARVE_HTTP_WORKERS", defaults.http_workers)?,
            browser_workers: env_or("CARVE_BROWSER_WORKERS", defaults.browser_workers)?,
            poll_interval: Duration::from_millis(env_or("CARVE_POLL_INTERVAL_MS", 1000)?),
            lease,
            task_timeout: Duration::from_secs(timeout_secs),
            reclaim_interval: lease / 2,
        })
    }

    /// Worker settings derived from the pool settings; heartbeats run at a
    /// third of the lease.
    pub fn worker_config(&self, worker_id: impl Into<String>) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(worker_id)
            .with_poll_interval(self.poll_interval)
            .with_lease(self.lease, self.lease / 3)
            .with_task_timeout(self.task_timeout)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}
