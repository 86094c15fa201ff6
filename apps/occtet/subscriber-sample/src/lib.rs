//! Sample Microservice
//!
//! The smallest member of the fleet: it logs every `sample` and
//! `scannerdata_send` unit it receives and acknowledges it.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (work.sample)
//!   ↓ (durable consumer: sample-consumer)
//! WorkConsumer
//!   ↓
//! SampleWorkDataProcessor
//!
//! sample.system / system  →  SystemHandler (hello, status, exit)
//! ```

use core_config::FromEnv;
use domain_workdata::{MicroserviceDescriptor, SampleWorkDataProcessor};
use eyre::{Result, WrapErr};
use messaging::NatsBus;
use microservice::{Microservice, ServiceConfig};
use std::sync::Arc;
use tracing::info;

/// Descriptor bundled with the binary.
pub const BUNDLED_DESCRIPTOR: &str = include_str!("../microserviceDescriptor.json");

/// Resolve the descriptor this instance answers `hello` with.
///
/// `MICROSERVICE_DESCRIPTOR` replaces the bundled document and
/// `SERVICE_VERSION` replaces its version.
pub fn load_descriptor(config: &ServiceConfig) -> Result<MicroserviceDescriptor> {
    let descriptor = match &config.descriptor_path {
        Some(path) => MicroserviceDescriptor::load(path)
            .wrap_err_with(|| format!("Failed to load descriptor {}", path.display()))?,
        None => MicroserviceDescriptor::from_json(BUNDLED_DESCRIPTOR.as_bytes())
            .wrap_err("Bundled descriptor is invalid")?,
    };

    Ok(match &config.version_override {
        Some(version) => descriptor.with_version(version.clone()),
        None => descriptor,
    })
}

/// Run the sample microservice until SIGINT/SIGTERM or an `exit` command.
///
/// # Errors
///
/// Returns an error if configuration or the descriptor is invalid, NATS is
/// unreachable, or the work consumer dies fatally.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let config = ServiceConfig::from_env().wrap_err("Failed to load service configuration")?;
    core_config::tracing::init_tracing(&config.environment);

    let descriptor = load_descriptor(&config)?;
    info!(
        name = %descriptor.name,
        version = %descriptor.version,
        environment = ?config.environment,
        "Starting sample microservice"
    );

    let metrics = microservice::init_metrics().wrap_err("Failed to install metrics recorder")?;

    let connection_name = config
        .nats
        .connection_name
        .clone()
        .unwrap_or_else(|| descriptor.name.clone());
    let bus = NatsBus::connect(&config.nats.url, Some(connection_name.as_str()))
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {}", config.nats.url))?;

    let settings = config.consumer_settings(&descriptor.name);
    info!(
        stream = %settings.stream_name,
        subject = %settings.subject,
        durable = %settings.durable_name,
        "Work consumer configured"
    );

    Microservice::new(Arc::new(bus), descriptor, settings)
        .with_health_server(config.health_port, Some(metrics))
        .run(
            Arc::new(SampleWorkDataProcessor),
            microservice::shutdown_signal(),
        )
        .await?;

    info!("Sample microservice shut down gracefully");
    Ok(())
}
