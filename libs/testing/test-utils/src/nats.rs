//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that runs a NATS container with JetStream and
//! hands out [`NatsBus`] handles connected to it.

use async_nats::Client;
use messaging::NatsBus;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
/// let bus = nats.bus();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Start NATS with JetStream enabled (`-js`).
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// A bus sharing this fixture's connection.
    pub fn bus(&self) -> Arc<NatsBus> {
        Arc::new(NatsBus::from_client(self.client.clone()))
    }

    /// A bus on a connection of its own, for producer/consumer separation.
    pub async fn connect_bus(&self, name: &str) -> Arc<NatsBus> {
        let bus = NatsBus::connect(&self.connection_string, Some(name))
            .await
            .expect("Failed to connect bus");
        Arc::new(bus)
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::{ConsumerSpec, MessageBus, StreamSpec};
    use std::time::Duration;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_request_reply_over_nats() {
        let nats = TestNats::new().await;
        let bus = nats.bus();

        let mut requests = bus.subscribe("echo.system").await.unwrap();
        let responder = nats.connect_bus("responder").await;
        tokio::spawn(async move {
            if let Some(message) = requests.next().await {
                if let Some(reply) = message.reply {
                    responder.publish(&reply, message.payload).await.unwrap();
                }
            }
        });

        let reply = bus
            .request("echo.system", b"hello".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"hello");
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_work_stream_ack_is_not_redelivered() {
        let nats = TestNats::new().await;
        let bus = nats.bus();

        bus.ensure_stream(&StreamSpec::new("TEST_WORK", vec!["work.>".into()]))
            .await
            .unwrap();
        bus.publish_work(
            "work.sample",
            "id-1",
            br#"{"type":"sample","sampleField":"X"}"#.to_vec(),
        )
        .await
        .unwrap();

        let spec = ConsumerSpec {
            stream: "TEST_WORK".into(),
            durable_name: "sample-consumer".into(),
            filter_subject: "work.sample".into(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(2),
        };
        let mut stream = bus.bind_work_stream(&spec).await.unwrap();

        let batch = stream.fetch(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 1);
        for delivery in batch {
            assert_eq!(delivery.message_id(), Some("id-1"));
            delivery.ack().await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        let again = stream.fetch(10, Duration::from_millis(500)).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_rebind_updates_consumer_configuration() {
        let nats = TestNats::new().await;
        let bus = nats.bus();
        bus.ensure_stream(&StreamSpec::new("TEST_REBIND", vec!["rebind.>".into()]))
            .await
            .unwrap();

        let spec = ConsumerSpec {
            stream: "TEST_REBIND".into(),
            durable_name: "rebind-consumer".into(),
            filter_subject: "rebind.sample".into(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
        };
        let first = bus.bind_work_stream(&spec).await.unwrap();
        first.close().await.unwrap();

        let changed = ConsumerSpec {
            max_deliver: 2,
            ack_wait: Duration::from_secs(10),
            ..spec
        };
        let _rebound = bus.bind_work_stream(&changed).await.unwrap();

        let jetstream = async_nats::jetstream::new(nats.client());
        let stream = jetstream.get_stream("TEST_REBIND").await.unwrap();
        let info = stream.consumer_info("rebind-consumer").await.unwrap();
        assert_eq!(info.config.max_deliver, 2);
        assert_eq!(info.config.ack_wait, Duration::from_secs(10));
    }
}
