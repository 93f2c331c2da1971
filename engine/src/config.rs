//! Worker configuration.
//!
//! Read from environment variables (a `.env` file is loaded first by the
//! binary). Every setting except `DATABASE_URL` has a default.
//!
//! # Example
//!
//! ```no_run
//! use allotment_engine::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! println!("Holds live for {}s", config.allocation.reservation_ttl_secs);
//! # Ok(())
//! # }
//! ```

use crate::engine::AllocationSettings;
use allotment_core::ids::LocationId;
use allotment_postgres::PoolSettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("Environment variable not set: {0}")]
    Missing(&'static str),
    /// A variable could not be parsed
    #[error("Invalid value for {name}: {value}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },
    /// Values parse but make no sense together
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Database pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection string
    pub url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// Seconds to wait for a connection
    pub connect_timeout_secs: u64,
    /// Seconds an idle connection is kept
    pub idle_timeout_secs: u64,
    /// Milliseconds to wait for a row lock
    pub lock_timeout_ms: u64,
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Lifetime of a tentative hold
    pub reservation_ttl_secs: u64,
    /// Location used for REAL ledgers
    pub default_location_id: i64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 1800,
            default_location_id: LocationId::DEFAULT.get(),
        }
    }
}

/// Background job intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Seconds between expiry sweeps
    pub expiry_sweep_interval_secs: u64,
    /// Seconds between consistency audits
    pub consistency_audit_interval_secs: u64,
    /// Seconds between FRAME retries, 0 disables the job
    pub frame_retry_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_interval_secs: 300,
            consistency_audit_interval_secs: 3600,
            frame_retry_interval_secs: 0,
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Log filter directive
    pub log_level: String,
    /// Metrics exporter bind address
    pub metrics_host: String,
    /// Metrics exporter port
    pub metrics_port: u16,
    /// Seconds to wait for jobs on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "allotment=info".to_string(),
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9090,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Full worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Database
    pub postgres: PostgresConfig,
    /// Engine
    pub allocation: AllocationConfig,
    /// Jobs
    pub jobs: JobsConfig,
    /// Process
    pub server: ServerConfig,
}

impl Config {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `DATABASE_URL` is unset, a value does not
    /// parse, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` in place of the environment.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PoolSettings::new(String::new());
        let allocation = AllocationConfig::default();
        let jobs = JobsConfig::default();
        let server = ServerConfig::default();

        let config = Self {
            postgres: PostgresConfig {
                url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.max_connections)?,
                min_connections: parse_or(&lookup, "DATABASE_MIN_CONNECTIONS", defaults.min_connections)?,
                connect_timeout_secs: parse_or(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    defaults.connect_timeout.as_secs(),
                )?,
                idle_timeout_secs: parse_or(
                    &lookup,
                    "DATABASE_IDLE_TIMEOUT",
                    defaults.idle_timeout.as_secs(),
                )?,
                lock_timeout_ms: parse_or(
                    &lookup,
                    "DATABASE_LOCK_TIMEOUT_MS",
                    u64::try_from(defaults.lock_timeout.as_millis()).unwrap_or(u64::MAX),
                )?,
            },
            allocation: AllocationConfig {
                reservation_ttl_secs: parse_or(&lookup, "RESERVATION_TTL_SECS", allocation.reservation_ttl_secs)?,
                default_location_id: parse_or(&lookup, "DEFAULT_LOCATION_ID", allocation.default_location_id)?,
            },
            jobs: JobsConfig {
                expiry_sweep_interval_secs: parse_or(
                    &lookup,
                    "EXPIRY_SWEEP_INTERVAL_SECS",
                    jobs.expiry_sweep_interval_secs,
                )?,
                consistency_audit_interval_secs: parse_or(
                    &lookup,
                    "CONSISTENCY_AUDIT_INTERVAL_SECS",
                    jobs.consistency_audit_interval_secs,
                )?,
                frame_retry_interval_secs: parse_or(
                    &lookup,
                    "FRAME_RETRY_INTERVAL_SECS",
                    jobs.frame_retry_interval_secs,
                )?,
            },
            server: ServerConfig {
                log_level: lookup("RUST_LOG").unwrap_or(server.log_level),
                metrics_host: lookup("METRICS_HOST").unwrap_or(server.metrics_host),
                metrics_port: parse_or(&lookup, "METRICS_PORT", server.metrics_port)?,
                shutdown_timeout_secs: parse_or(&lookup, "SHUTDOWN_TIMEOUT", server.shutdown_timeout_secs)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.postgres.url.is_empty() {
            return Err(ConfigError::Validation("DATABASE_URL must not be empty".to_string()));
        }
        if self.postgres.max_connections == 0 {
            return Err(ConfigError::Validation("max_connections must be > 0".to_string()));
        }
        if self.postgres.min_connections > self.postgres.max_connections {
            return Err(ConfigError::Validation(
                "min_connections must not exceed max_connections".to_string(),
            ));
        }
        if self.allocation.reservation_ttl_secs == 0 {
            return Err(ConfigError::Validation("reservation_ttl_secs must be > 0".to_string()));
        }
        if i64::try_from(self.allocation.reservation_ttl_secs).is_err() {
            return Err(ConfigError::Validation("reservation_ttl_secs is too large".to_string()));
        }
        if self.jobs.expiry_sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "expiry_sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if self.jobs.consistency_audit_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "consistency_audit_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool settings for [`allotment_postgres::PostgresAllocationStore::connect`].
    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            url: self.postgres.url.clone(),
            max_connections: self.postgres.max_connections,
            min_connections: self.postgres.min_connections,
            connect_timeout: Duration::from_secs(self.postgres.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.postgres.idle_timeout_secs),
            lock_timeout: Duration::from_millis(self.postgres.lock_timeout_ms),
        }
    }

    /// Engine settings.
    #[must_use]
    pub fn allocation_settings(&self) -> AllocationSettings {
        let ttl_secs = i64::try_from(self.allocation.reservation_ttl_secs).unwrap_or(i64::MAX);
        AllocationSettings {
            reservation_ttl: chrono::Duration::seconds(ttl_secs),
            location_id: LocationId::new(self.allocation.default_location_id),
        }
    }

    /// Where the metrics exporter listens.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `METRICS_HOST` is not an IP address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = IpAddr::from_str(&self.server.metrics_host).map_err(|_| ConfigError::Invalid {
            name: "METRICS_HOST",
            value: self.server.metrics_host.clone(),
        })?;
        Ok(SocketAddr::new(ip, self.server.metrics_port))
    }

    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Expiry sweep interval.
    #[must_use]
    pub const fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.jobs.expiry_sweep_interval_secs)
    }

    /// Consistency audit interval.
    #[must_use]
    pub const fn consistency_audit_interval(&self) -> Duration {
        Duration::from_secs(self.jobs.consistency_audit_interval_secs)
    }

    /// FRAME retry interval, `None` when disabled.
    #[must_use]
    pub const fn frame_retry_interval(&self) -> Option<Duration> {
        match self.jobs.frame_retry_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
#[allow(clippy::panic)] // Tests are allowed to panic on failures
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_url_is_set() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/shop")]);
        let Ok(config) = config else {
            panic!("expected defaults to validate, got {config:?}");
        };

        assert_eq!(config.postgres.max_connections, 10);
        assert_eq!(config.postgres.lock_timeout_ms, 5000);
        assert_eq!(config.allocation_settings(), AllocationSettings::default());
        assert_eq!(config.expiry_sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.consistency_audit_interval(), Duration::from_secs(3600));
        assert_eq!(config.frame_retry_interval(), None);
        assert_eq!(config.metrics_addr().map(|a| a.port()), Ok(9090));
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(load(&[]), Err(ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let result = load(&[("DATABASE_URL", "postgres://x"), ("METRICS_PORT", "ninety")]);
        assert_eq!(
            result,
            Err(ConfigError::Invalid {
                name: "METRICS_PORT",
                value: "ninety".to_string(),
            })
        );
    }

    #[test]
    fn zero_ttl_and_zero_sweep_are_rejected() {
        let ttl = load(&[("DATABASE_URL", "postgres://x"), ("RESERVATION_TTL_SECS", "0")]);
        assert!(matches!(ttl, Err(ConfigError::Validation(_))));

        let sweep = load(&[("DATABASE_URL", "postgres://x"), ("EXPIRY_SWEEP_INTERVAL_SECS", "0")]);
        assert!(matches!(sweep, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn overrides_flow_into_settings() {
        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("RESERVATION_TTL_SECS", "600"),
            ("DEFAULT_LOCATION_ID", "7"),
            ("FRAME_RETRY_INTERVAL_SECS", "120"),
            ("DATABASE_LOCK_TIMEOUT_MS", "250"),
        ]);
        let Ok(config) = config else {
            panic!("expected overrides to validate, got {config:?}");
        };

        let settings = config.allocation_settings();
        assert_eq!(settings.reservation_ttl, chrono::Duration::minutes(10));
        assert_eq!(settings.location_id, LocationId::new(7));
        assert_eq!(config.frame_retry_interval(), Some(Duration::from_secs(120)));
        assert_eq!(config.pool_settings().lock_timeout, Duration::from_millis(250));
    }
}
