use std::time::Duration;

use carve_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 10; every worker
    ///   holds a connection only while it claims or lands a task)
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for queue and schema storage.".into())
        })?;
        let mut config = Self::new(url);

        if let Some(n) = positive_env("DATABASE_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(secs) = positive_env("DATABASE_ACQUIRE_TIMEOUT_SECS")? {
            config.acquire_timeout = Duration::from_secs(secs.into());
        }
        Ok(config)
    }
}

fn positive_env(name: &str) -> Result<Option<u32>, AppError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.parse::<u32>() {
        Ok(0) => Err(AppError::ConfigError(format!("{name} must be at least 1"))),
        Ok(n) => Ok(Some(n)),
        Err(_) => Err(AppError::ConfigError(format!(
            "Invalid {name} '{raw}': must be a positive integer"
        ))),
    }
}
