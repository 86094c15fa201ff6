//! Work Data Domain
//!
//! The vocabulary every microservice of the fleet shares.
//!
//! # Features
//!
//! - A closed set of tagged [`WorkData`] variants, decoded with distinguishable errors
//! - [`WorkDataProcessor`]: one handler per variant, unsupported by default
//! - [`MicroserviceDescriptor`]: service identity answered to `hello`
//! - Status and progress system messages, control request parsing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Producer     │  ← Publishes {"type":"sample", ...}
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Work Stream   │  ← Durable, per-service subject
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ WorkData decode │  ← Discriminator first, then variant fields
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Processor    │  ← process_<variant>() of the service
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_workdata::{SampleWorkDataProcessor, WorkData};
//!
//! let data = WorkData::decode(br#"{"type":"sample","sampleField":"X"}"#)?;
//! data.dispatch(&SampleWorkDataProcessor).await?;
//! ```

pub mod descriptor;
pub mod error;
pub mod models;
pub mod processor;
pub mod system;

// Re-export commonly used types
pub use descriptor::{MicroserviceDescriptor, UsageType};
pub use error::{DecodeError, DescriptorError, WiringError};
pub use models::{
    AiAnswerWorkData, AiCopyrightFilterWorkData, AiLicenseMatcherWorkData, AiStatusQueryWorkData,
    DownloadWorkData, FileSearchWorkData, FossReportWorkData, InformationFileSendWorkData,
    OrtStartRunWorkData, SampleWorkData, ScannerSendWorkData, SpdxExportWorkData, SpdxWorkData,
    VulnerabilityWorkData, WorkData, WorkDataKind, WorkTask,
};
pub use processor::{validate_wiring, ProcessResult, SampleWorkDataProcessor, WorkDataProcessor};
pub use system::{
    AckReply, ControlCommand, ControlRequest, ErrorReply, ProgressMessage, StatusDescriptor,
    SystemMessage, WorkerStatus, PROGRESS_SUBJECT, SYSTEM_SUBJECT,
};
