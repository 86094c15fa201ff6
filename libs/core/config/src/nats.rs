use crate::{env_or_default, parse_env_or, ConfigError, FromEnv};
use std::time::Duration;

/// NATS connection configuration
#[derive(Clone, Debug)]
pub struct NatsConfig {
    pub url: String,
    /// Client name shown in the NATS server's connection list
    pub connection_name: Option<String>,
    /// Upper bound for request/reply round trips
    pub request_timeout: Duration,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connection_name: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl FromEnv for NatsConfig {
    /// Reads from environment variables with sensible defaults:
    /// - NATS_URL: defaults to nats://localhost:4222
    /// - NATS_CONNECTION_NAME: optional
    /// - NATS_REQUEST_TIMEOUT_MS: defaults to 5000
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_or_default("NATS_URL", "nats://localhost:4222");
        let connection_name = std::env::var("NATS_CONNECTION_NAME").ok();
        let timeout_ms: u64 = parse_env_or("NATS_REQUEST_TIMEOUT_MS", 5000)?;

        Ok(Self {
            url,
            connection_name,
            request_timeout: Duration::from_millis(timeout_ms),
        })
    }
}
