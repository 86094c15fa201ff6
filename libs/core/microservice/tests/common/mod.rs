#![allow(dead_code)]

use messaging::{BackoffStrategy, InMemoryBus, MessageBus, RetryPolicy};
use microservice::ConsumerSettings;
use std::sync::Arc;
use std::time::Duration;

pub const STREAM: &str = "work";

/// Settings tuned for fast in-process tests: short pulls, immediate redelivery.
pub fn settings(service: &str) -> ConsumerSettings {
    ConsumerSettings::new(service, STREAM, format!("work.{}", service))
        .with_fetch_timeout(Duration::from_millis(50))
        .with_ack_wait(Duration::from_secs(5))
        .with_retry(RetryPolicy::immediate())
        .with_reconnect(3, BackoffStrategy::Fixed(Duration::from_millis(10)))
}

pub fn bus() -> (InMemoryBus, Arc<dyn MessageBus>) {
    let bus = InMemoryBus::new();
    let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
    (bus, shared)
}

/// Create the work stream up front so producers can publish before the pump binds.
pub async fn ensure_work_stream(bus: &InMemoryBus, settings: &ConsumerSettings) {
    bus.ensure_stream(&settings.stream_spec()).await.unwrap();
}

pub const TIMEOUT: Duration = Duration::from_secs(5);
