//! Configuration for the work consumer and the hosting process.

use core_config::nats::NatsConfig;
use core_config::{parse_env_or, ConfigError, Environment, FromEnv};
use messaging::{BackoffStrategy, ConsumerSpec, RetryPolicy, StreamSpec};
use std::path::PathBuf;
use std::time::Duration;

/// Default durable stream shared by the fleet.
pub const DEFAULT_STREAM_NAME: &str = "work";

/// Dead-letter stream name for a work stream (e.g. `work_DLQ`).
pub fn dead_letter_stream(stream_name: &str) -> String {
    format!("{}_DLQ", stream_name)
}

/// Dead-letter subject of one service.
pub fn dead_letter_subject(service_name: &str) -> String {
    format!("deadletter.{}", service_name)
}

/// Everything the pump needs to bind and drain one work subject.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Service name, used for the durable consumer and dead-letter subject
    pub service_name: String,

    /// Durable stream name
    pub stream_name: String,

    /// Work subject this service consumes
    pub subject: String,

    /// Durable consumer name (shared by every instance of the service)
    pub durable_name: String,

    /// Maximum deliveries before a message is treated as poison
    pub max_deliver: i64,

    /// Ack wait before the broker redelivers an unsettled message
    pub ack_wait: Duration,

    /// Bounded wait of one pull, so the pump notices termination
    pub fetch_timeout: Duration,

    /// Work units dispatched at once (1 keeps subject order)
    pub max_concurrent: usize,

    /// Publish terminated messages to the dead-letter stream
    pub dead_letter_enabled: bool,

    /// Consecutive bind or fetch failures tolerated before the pump gives up
    pub bind_attempts: u32,

    /// Delay between reconnect attempts
    pub reconnect_backoff: BackoffStrategy,

    /// Redelivery delays for retryable failures
    pub retry: RetryPolicy,
}

impl ConsumerSettings {
    /// Settings for `service_name` on `stream_name`, filtered to `subject`.
    pub fn new(
        service_name: impl Into<String>,
        stream_name: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        let service_name = service_name.into();
        Self {
            durable_name: format!("{}-consumer", service_name),
            service_name,
            stream_name: stream_name.into(),
            subject: subject.into(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(1),
            max_concurrent: 1,
            dead_letter_enabled: true,
            bind_attempts: 5,
            reconnect_backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(10),
            },
            retry: RetryPolicy::default(),
        }
    }

    /// Set the durable consumer name.
    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = name.into();
        self
    }

    /// Set the maximum deliveries.
    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Set the ack wait.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the maximum concurrent work units (at least one).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Enable or disable dead-lettering.
    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    /// Set the bind attempts and reconnect backoff.
    pub fn with_reconnect(mut self, attempts: u32, backoff: BackoffStrategy) -> Self {
        self.bind_attempts = attempts.max(1);
        self.reconnect_backoff = backoff;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stream definition ensured before binding.
    ///
    /// The stream captures the whole first subject token (`work.sample` → `work.>`)
    /// so services sharing it do not fight over its subject list.
    pub fn stream_spec(&self) -> StreamSpec {
        let subjects = match self.subject.split_once('.') {
            Some((prefix, _)) => vec![format!("{}.>", prefix)],
            None => vec![self.subject.clone()],
        };
        StreamSpec::new(self.stream_name.clone(), subjects)
    }

    /// Durable pull consumer definition.
    pub fn consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            stream: self.stream_name.clone(),
            durable_name: self.durable_name.clone(),
            filter_subject: self.subject.clone(),
            max_deliver: self.max_deliver,
            ack_wait: self.ack_wait,
        }
    }

    /// Dead-letter stream definition (`<STREAM>_DLQ`, `deadletter.>`).
    pub fn dead_letter_stream_spec(&self) -> StreamSpec {
        StreamSpec::new(
            dead_letter_stream(&self.stream_name),
            vec!["deadletter.>".to_string()],
        )
        .with_max_messages(10_000)
        .with_max_age(Duration::from_secs(30 * 24 * 60 * 60))
    }

    pub fn dead_letter_subject(&self) -> String {
        dead_letter_subject(&self.service_name)
    }
}

/// Deployment configuration of a hosting process.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub environment: Environment,
    pub nats: NatsConfig,
    pub stream_name: String,
    /// Work subject; `work.<service>` when unset
    pub subject: Option<String>,
    /// Replaces the bundled descriptor version
    pub version_override: Option<String>,
    /// Descriptor file replacing the bundled one
    pub descriptor_path: Option<PathBuf>,
    pub max_deliver: i64,
    pub ack_wait: Duration,
    pub fetch_timeout: Duration,
    pub max_concurrent: usize,
    pub dead_letter_enabled: bool,
    pub health_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            nats: NatsConfig::default(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            subject: None,
            version_override: None,
            descriptor_path: None,
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(1),
            max_concurrent: 1,
            dead_letter_enabled: true,
            health_port: 8081,
        }
    }
}

impl ServiceConfig {
    /// Set the health server port.
    pub fn with_health_port(mut self, port: u16) -> Self {
        self.health_port = port;
        self
    }

    /// Set the work subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Work subject of `service_name`.
    pub fn work_subject(&self, service_name: &str) -> String {
        self.subject
            .clone()
            .unwrap_or_else(|| format!("work.{}", service_name))
    }

    /// Consumer settings for `service_name`.
    pub fn consumer_settings(&self, service_name: &str) -> ConsumerSettings {
        ConsumerSettings::new(
            service_name,
            self.stream_name.clone(),
            self.work_subject(service_name),
        )
        .with_max_deliver(self.max_deliver)
        .with_ack_wait(self.ack_wait)
        .with_fetch_timeout(self.fetch_timeout)
        .with_max_concurrent(self.max_concurrent)
        .with_dead_letter(self.dead_letter_enabled)
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl FromEnv for ServiceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let ack_wait_secs: u64 = parse_env_or("WORK_ACK_WAIT_SECS", defaults.ack_wait.as_secs())?;
        let fetch_timeout_ms: u64 = parse_env_or(
            "WORK_FETCH_TIMEOUT_MS",
            defaults.fetch_timeout.as_millis() as u64,
        )?;
        let max_concurrent: usize = parse_env_or("WORK_MAX_CONCURRENT", defaults.max_concurrent)?;

        Ok(Self {
            environment: Environment::from_env(),
            nats: NatsConfig::from_env()?,
            stream_name: optional_env("NATS_STREAM_NAME").unwrap_or(defaults.stream_name),
            subject: optional_env("NATS_STREAM_SUBJECT"),
            version_override: optional_env("SERVICE_VERSION"),
            descriptor_path: optional_env("MICROSERVICE_DESCRIPTOR").map(PathBuf::from),
            max_deliver: parse_env_or("WORK_MAX_DELIVER", defaults.max_deliver)?,
            ack_wait: Duration::from_secs(ack_wait_secs),
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            max_concurrent: max_concurrent.max(1),
            dead_letter_enabled: parse_env_or("WORK_DLQ_ENABLED", defaults.dead_letter_enabled)?,
            health_port: parse_env_or("HEALTH_PORT", defaults.health_port)?,
        })
    }
}
