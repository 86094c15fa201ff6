//! Sample Microservice - Entry Point
//!
//! Consumes `sample` and `scannerdata_send` work units from NATS JetStream.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    occtet_subscriber_sample::run().await
}
