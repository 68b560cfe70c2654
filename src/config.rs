//! Runtime configuration, loaded once from the environment at process
//! start via small `env_required`/`env_parse_or` helpers.

use std::env;

use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Everything the scheduler and its ambient services need at start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the progress store.
    pub database_url: String,
    /// Port the Prometheus metrics HTTP server listens on.
    pub metrics_port: u16,
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "follow_fleet=debug".
    pub log_level: String,
    /// How often the scheduler loop wakes to re-evaluate workers.
    pub poll_interval_secs: u64,
    /// Cooldown applied to a worker after a 429 response.
    pub rate_limit_cooldown_secs: u64,
    /// The stricter-of-two floor enforced alongside settings.interval_minutes.
    pub per_worker_gap_secs: u64,
    /// Max postgres pool connections.
    pub db_max_connections: u32,
}

/// Helper to get a required environment variable.
fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_required("DATABASE_URL")?;
        let metrics_port = env_parse_or("METRICS_PORT", 9090u16)?;
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let poll_interval_secs = env_parse_or("POLL_INTERVAL_SECS", 60u64)?;
        let rate_limit_cooldown_secs = env_parse_or("RATE_LIMIT_COOLDOWN_SECS", 900u64)?;
        let per_worker_gap_secs = env_parse_or("PER_WORKER_GAP_SECS", 900u64)?;
        let db_max_connections = env_parse_or("DB_MAX_CONNECTIONS", 10u32)?;

        let config = Config {
            database_url,
            metrics_port,
            log_level,
            poll_interval_secs,
            rate_limit_cooldown_secs,
            per_worker_gap_secs,
            db_max_connections,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.database_url.starts_with("postgres://") && !self.database_url.starts_with("postgresql://") {
            return Err(ConfigError::InvalidValue {
                var: "DATABASE_URL".into(),
                message: "must start with postgres:// or postgresql://".into(),
            });
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DB_MAX_CONNECTIONS".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "POLL_INTERVAL_SECS".into(),
                message: "must be greater than 0".into(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            database_url: "postgres://localhost/test".into(),
            metrics_port: 9090,
            log_level: "info".into(),
            poll_interval_secs: 60,
            rate_limit_cooldown_secs: 900,
            per_worker_gap_secs: 900,
            db_max_connections: 10,
        }
    }
}
