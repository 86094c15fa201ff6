//! Microservice runtime shared by every service of the fleet.
//!
//! Each service instance runs two independent loops on one bus: the control
//! plane answering `hello`, `status` and `exit`, and the work consumer draining
//! its durable work subject into the service's processor.
//!
//! # Architecture
//!
//! ```text
//!                  ┌───────────────────────────┐
//!  <svc>.system ──▶│      SystemHandler        │── exit ──┐
//!  system       ──▶│ (hello / status / exit)   │          │ terminate()
//!                  └─────────────┬─────────────┘          │
//!                                │ reads                  ▼
//!                        ┌───────▼───────┐        ┌────────────────┐
//!                        │  WorkerState  │◀───────│  WorkConsumer  │
//!                        └───────┬───────┘ writes └───────┬────────┘
//!                                │                        │ fetch / ack
//!                     /health, /ready, /metrics    ┌──────▼────────┐
//!                                                  │  Work Stream  │──▶ <STREAM>_DLQ
//!                                                  └───────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use microservice::{Microservice, ServiceConfig};
//! use domain_workdata::SampleWorkDataProcessor;
//!
//! let settings = config.consumer_settings(&descriptor.name);
//! Microservice::new(bus, descriptor, settings)
//!     .with_health_server(config.health_port, Some(metrics_handle))
//!     .run(Arc::new(SampleWorkDataProcessor), microservice::shutdown_signal())
//!     .await?;
//! ```

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod health;
pub mod metrics;
pub mod producer;
pub mod progress;
pub mod runtime;
pub mod state;
pub mod system;

pub use config::{ConsumerSettings, ServiceConfig};
pub use consumer::WorkConsumer;
pub use dlq::{DeadLetterEntry, DeadLetterPublisher, DeadLetterReason};
pub use error::ConsumerError;
pub use health::{HealthServer, HealthStatus};
pub use metrics::{init_metrics, WorkMetrics};
pub use producer::{SentWork, WorkSender};
pub use progress::ProgressReporter;
pub use runtime::{shutdown_signal, Microservice};
pub use state::WorkerState;
pub use system::{ControlOrigin, ControlPlane, SystemHandler};
