// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

/// Lock connections kept free of step workers for timer fires and event
/// routing.
pub const LOCK_POOL_RESERVE: u32 = 8;

/// Engine limits and tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name recorded as the controller of instances stepped on this node.
    pub hostname: String,
    /// Step worker permits per node.
    pub max_concurrent_steps: usize,
    /// Instances a namespace may create per limit interval.
    pub max_instances_per_interval: i64,
    /// Length of the rate limit window.
    pub instance_limit_interval: Duration,
    /// Children a single foreach or parallel state may start.
    pub max_parallel_actions: usize,
    /// Maximum subflow nesting.
    pub max_subflow_depth: i32,
    /// How long a step waits for the instance lock.
    pub lock_wait: Duration,
    /// Deadline of states that do not declare a timeout.
    pub default_state_timeout: Duration,
    /// Workflow soft timeout when `timeouts.interrupt` is absent.
    pub default_interrupt: Duration,
    /// Extra time between the soft and the hard workflow timeout.
    pub kill_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_concurrent_steps: 32,
            max_instances_per_interval: 100,
            instance_limit_interval: Duration::from_secs(60),
            max_parallel_actions: 10,
            max_subflow_depth: 5,
            lock_wait: Duration::from_secs(10),
            default_state_timeout: Duration::from_secs(15 * 60),
            default_interrupt: Duration::from_secs(15 * 60),
            kill_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// Direktiv Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Size of the dedicated advisory lock pool
    pub lock_pool_size: u32,
    /// Engine limits
    pub engine: EngineConfig,
    /// Domain sandbox services resolve under
    pub sandbox_domain: String,
    /// Endpoint used to create sandbox services
    pub functions_url: Option<String>,
    /// HTTP ingress address
    pub http_addr: SocketAddr,
    /// Emit logs as JSON
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DIREKTIV_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `DIREKTIV_HOSTNAME`: controller name (default: `HOSTNAME` or localhost)
    /// - `DIREKTIV_MAX_CONCURRENT_STEPS`: step workers (default: 32)
    /// - `DIREKTIV_MAX_INSTANCES_PER_INTERVAL`: rate limit (default: 100)
    /// - `DIREKTIV_INSTANCE_LIMIT_INTERVAL_SECS`: rate window (default: 60)
    /// - `DIREKTIV_MAX_PARALLEL_ACTIONS`: fan-out cap (default: 10)
    /// - `DIREKTIV_MAX_SUBFLOW_DEPTH`: nesting cap (default: 5)
    /// - `DIREKTIV_LOCK_POOL_SIZE`: advisory lock pool (default: steps + 8).
    ///   A smaller pool lowers the step permits to fit.
    /// - `DIREKTIV_SANDBOX_DOMAIN`: service domain (default: default.svc.cluster.local)
    /// - `DIREKTIV_FUNCTIONS_URL`: service creation endpoint (default: unset)
    /// - `DIREKTIV_HTTP_PORT`: HTTP port (default: 8080)
    /// - `DIREKTIV_LOG_JSON`: JSON logs (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DIREKTIV_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DIREKTIV_DATABASE_URL"))?;

        let hostname = std::env::var("DIREKTIV_HOSTNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        let mut max_concurrent_steps: usize = parse_var(
            "DIREKTIV_MAX_CONCURRENT_STEPS",
            "32",
            "must be a positive integer",
        )?;
        let max_instances_per_interval: i64 = parse_var(
            "DIREKTIV_MAX_INSTANCES_PER_INTERVAL",
            "100",
            "must be a positive integer",
        )?;
        let limit_secs: u64 = parse_var(
            "DIREKTIV_INSTANCE_LIMIT_INTERVAL_SECS",
            "60",
            "must be a number of seconds",
        )?;
        let max_parallel_actions: usize = parse_var(
            "DIREKTIV_MAX_PARALLEL_ACTIONS",
            "10",
            "must be a positive integer",
        )?;
        let max_subflow_depth: i32 = parse_var(
            "DIREKTIV_MAX_SUBFLOW_DEPTH",
            "5",
            "must be a positive integer",
        )?;
        let http_port: u16 =
            parse_var("DIREKTIV_HTTP_PORT", "8080", "must be a valid port number")?;
        let log_json: bool = parse_var("DIREKTIV_LOG_JSON", "false", "must be true or false")?;

        if max_concurrent_steps == 0 {
            return Err(ConfigError::Invalid(
                "DIREKTIV_MAX_CONCURRENT_STEPS",
                "must be a positive integer",
            ));
        }
        let steps = u32::try_from(max_concurrent_steps).unwrap_or(u32::MAX);
        let lock_pool_size: u32 = parse_var(
            "DIREKTIV_LOCK_POOL_SIZE",
            &steps.saturating_add(LOCK_POOL_RESERVE).to_string(),
            "must be a positive integer",
        )?;
        if lock_pool_size <= LOCK_POOL_RESERVE {
            return Err(ConfigError::Invalid(
                "DIREKTIV_LOCK_POOL_SIZE",
                "must be larger than the 8 connections reserved for timers and events",
            ));
        }
        max_concurrent_steps = max_concurrent_steps.min((lock_pool_size - LOCK_POOL_RESERVE) as usize);
        if max_instances_per_interval <= 0 {
            return Err(ConfigError::Invalid(
                "DIREKTIV_MAX_INSTANCES_PER_INTERVAL",
                "must be a positive integer",
            ));
        }

        let sandbox_domain = std::env::var("DIREKTIV_SANDBOX_DOMAIN")
            .unwrap_or_else(|_| "default.svc.cluster.local".to_string());
        let functions_url = std::env::var("DIREKTIV_FUNCTIONS_URL").ok();

        Ok(Self {
            database_url,
            lock_pool_size,
            engine: EngineConfig {
                hostname,
                max_concurrent_steps,
                max_instances_per_interval,
                instance_limit_interval: Duration::from_secs(limit_secs),
                max_parallel_actions,
                max_subflow_depth,
                ..EngineConfig::default()
            },
            sandbox_domain,
            functions_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            log_json,
        })
    }
}

impl Config {
    /// Options for the advisory lock pool. Session locks die with their
    /// connection, so connections are never recycled.
    pub fn lock_pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.lock_pool_size)
            .min_connections(0)
            .idle_timeout(None)
            .max_lifetime(None)
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL: [&str; 9] = [
        "DIREKTIV_HOSTNAME",
        "DIREKTIV_MAX_CONCURRENT_STEPS",
        "DIREKTIV_MAX_INSTANCES_PER_INTERVAL",
        "DIREKTIV_INSTANCE_LIMIT_INTERVAL_SECS",
        "DIREKTIV_MAX_PARALLEL_ACTIONS",
        "DIREKTIV_MAX_SUBFLOW_DEPTH",
        "DIREKTIV_LOCK_POOL_SIZE",
        "DIREKTIV_HTTP_PORT",
        "DIREKTIV_LOG_JSON",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DIREKTIV_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("HOSTNAME", "node-a");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.engine.hostname, "node-a");
        assert_eq!(config.engine.max_concurrent_steps, 32);
        assert_eq!(config.engine.max_parallel_actions, 10);
        assert_eq!(config.engine.max_subflow_depth, 5);
        assert_eq!(
            config.engine.instance_limit_interval,
            Duration::from_secs(60)
        );
        assert_eq!(config.lock_pool_size, 40);
        assert_eq!(config.http_addr.port(), 8080);
        assert!(!config.log_json);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DIREKTIV_DATABASE_URL", "postgres://user:pass@db:5432/prod");
        guard.set("DIREKTIV_HOSTNAME", "engine-1");
        guard.set("DIREKTIV_MAX_CONCURRENT_STEPS", "64");
        guard.set("DIREKTIV_MAX_INSTANCES_PER_INTERVAL", "7");
        guard.set("DIREKTIV_INSTANCE_LIMIT_INTERVAL_SECS", "30");
        guard.set("DIREKTIV_MAX_PARALLEL_ACTIONS", "4");
        guard.set("DIREKTIV_MAX_SUBFLOW_DEPTH", "2");
        guard.set("DIREKTIV_LOCK_POOL_SIZE", "80");
        guard.set("DIREKTIV_HTTP_PORT", "9090");
        guard.set("DIREKTIV_LOG_JSON", "true");

        let config = Config::from_env().unwrap();

        assert_eq!(config.engine.hostname, "engine-1");
        assert_eq!(config.engine.max_concurrent_steps, 64);
        assert_eq!(config.engine.max_instances_per_interval, 7);
        assert_eq!(
            config.engine.instance_limit_interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.engine.max_parallel_actions, 4);
        assert_eq!(config.engine.max_subflow_depth, 2);
        assert_eq!(config.lock_pool_size, 80);
        assert_eq!(config.http_addr.port(), 9090);
        assert!(config.log_json);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("DIREKTIV_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DIREKTIV_DATABASE_URL")));
        assert!(err.to_string().contains("DIREKTIV_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DIREKTIV_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("DIREKTIV_HTTP_PORT", "99999");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("DIREKTIV_HTTP_PORT", _)
        ));

        guard.set("DIREKTIV_HTTP_PORT", "8080");
        guard.set("DIREKTIV_MAX_CONCURRENT_STEPS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("DIREKTIV_MAX_CONCURRENT_STEPS", _)
        ));

        guard.set("DIREKTIV_MAX_CONCURRENT_STEPS", "8");
        guard.set("DIREKTIV_MAX_INSTANCES_PER_INTERVAL", "-1");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("DIREKTIV_MAX_INSTANCES_PER_INTERVAL", _)
        ));
    }

    #[test]
    fn test_lock_pool_fits_step_workers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DIREKTIV_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("DIREKTIV_MAX_CONCURRENT_STEPS", "32");
        guard.set("DIREKTIV_LOCK_POOL_SIZE", "10");
        let config = Config::from_env().unwrap();
        assert_eq!(config.lock_pool_size, 10);
        assert_eq!(config.engine.max_concurrent_steps, 2);

        let options = config.lock_pool_options();
        assert_eq!(options.get_max_connections(), 10);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);

        guard.set("DIREKTIV_LOCK_POOL_SIZE", "8");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("DIREKTIV_LOCK_POOL_SIZE", _)
        ));
    }
}
