//! Connection configuration for the natsq worker.

use crate::error::NatsqError;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Connection settings for a [`Worker`](crate::Worker).
///
/// # Example
///
/// ```rust
/// use natsq::WorkerConfig;
/// use std::time::Duration;
///
/// let config = WorkerConfig::new("nats.internal", 4222, "s3cr3t")
///     .with_connection_name("billing-worker")
///     .with_connection_timeout(Duration::from_secs(2));
///
/// assert_eq!(config.server_url(), "nats://nats.internal:4222");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Broker host name or IP
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Token used to authenticate; empty disables token auth
    pub auth_token: String,

    /// Client connection name reported to the server
    pub connection_name: Option<String>,

    /// Timeout for establishing the connection
    pub connection_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4222,
            auth_token: String::new(),
            connection_name: None,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

// The auth token must never end up in logs.
impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "auth_token",
                &if self.auth_token.is_empty() { "" } else { "***" },
            )
            .field("connection_name", &self.connection_name)
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

impl WorkerConfig {
    /// Create a configuration for the given server and token.
    pub fn new(host: impl Into<String>, port: u16, auth_token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            auth_token: auth_token.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `NATSQ_HOST` (default: `127.0.0.1`)
    /// - `NATSQ_PORT` (default: `4222`)
    /// - `NATSQ_AUTH_TOKEN` (default: empty)
    /// - `NATSQ_CONNECTION_NAME` (optional)
    /// - `NATSQ_CONNECT_TIMEOUT_SECS` (default: `5`)
    pub fn from_env() -> Result<Self, NatsqError> {
        let defaults = Self::default();
        let config = Self {
            host: env_or_default("NATSQ_HOST", &defaults.host),
            port: env_parse("NATSQ_PORT", defaults.port)?,
            auth_token: env_or_default("NATSQ_AUTH_TOKEN", ""),
            connection_name: env::var("NATSQ_CONNECTION_NAME")
                .ok()
                .filter(|name| !name.is_empty()),
            connection_timeout: Duration::from_secs(env_parse(
                "NATSQ_CONNECT_TIMEOUT_SECS",
                defaults.connection_timeout.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the connection name.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Server URL in `nats://host:port` form.
    pub fn server_url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// Check that the configuration can be used to connect.
    pub fn validate(&self) -> Result<(), NatsqError> {
        if self.host.trim().is_empty() {
            return Err(NatsqError::config_error("host must not be empty"));
        }
        if self.port == 0 {
            return Err(NatsqError::config_error("port must not be 0"));
        }
        if self.connection_timeout.is_zero() {
            return Err(NatsqError::config_error(
                "connection timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, NatsqError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| {
            NatsqError::config_error(format!(
                "Failed to parse environment variable '{key}': {e}"
            ))
        }),
        Err(_) => Ok(default),
    }
}
