//! The per-service processor contract and the dispatch boundary.
//!
//! Every variant has one handler method. Handlers a service does not implement
//! fall back to [`ProcessingError::unsupported`], a permanent failure, so a
//! misrouted message is dead-lettered instead of crashing the pump.

use crate::descriptor::MicroserviceDescriptor;
use crate::error::WiringError;
use crate::models::*;
use async_trait::async_trait;
use futures::FutureExt;
use messaging::ProcessingError;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::info;

/// Outcome of one handler invocation.
pub type ProcessResult = Result<(), ProcessingError>;

fn unsupported(kind: WorkDataKind) -> ProcessResult {
    Err(ProcessingError::unsupported(kind.tag()))
}

/// Business logic of one microservice.
///
/// Handlers must be safe to retry: a unit may be redelivered after a partial failure.
#[async_trait]
pub trait WorkDataProcessor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Variants this processor handles.
    fn accepted(&self) -> &[WorkDataKind];

    fn accepts(&self, kind: WorkDataKind) -> bool {
        self.accepted().contains(&kind)
    }

    async fn process_sample(&self, _data: &SampleWorkData) -> ProcessResult {
        unsupported(WorkDataKind::Sample)
    }

    async fn process_scanner_send(&self, _data: &ScannerSendWorkData) -> ProcessResult {
        unsupported(WorkDataKind::ScannerSend)
    }

    async fn process_license_matcher(&self, _data: &AiLicenseMatcherWorkData) -> ProcessResult {
        unsupported(WorkDataKind::AiLicenseMatcher)
    }

    async fn process_copyright_filter(&self, _data: &AiCopyrightFilterWorkData) -> ProcessResult {
        unsupported(WorkDataKind::AiCopyrightFilter)
    }

    async fn process_ai_status_query(&self, _data: &AiStatusQueryWorkData) -> ProcessResult {
        unsupported(WorkDataKind::AiStatusQuery)
    }

    async fn process_ai_answer(&self, _data: &AiAnswerWorkData) -> ProcessResult {
        unsupported(WorkDataKind::AiAnswer)
    }

    async fn process_foss_report(&self, _data: &FossReportWorkData) -> ProcessResult {
        unsupported(WorkDataKind::FossReport)
    }

    async fn process_spdx(&self, _data: &SpdxWorkData) -> ProcessResult {
        unsupported(WorkDataKind::Spdx)
    }

    async fn process_spdx_export(&self, _data: &SpdxExportWorkData) -> ProcessResult {
        unsupported(WorkDataKind::SpdxExport)
    }

    async fn process_download(&self, _data: &DownloadWorkData) -> ProcessResult {
        unsupported(WorkDataKind::Download)
    }

    async fn process_vulnerability(&self, _data: &VulnerabilityWorkData) -> ProcessResult {
        unsupported(WorkDataKind::Vulnerability)
    }

    async fn process_ort_start_run(&self, _data: &OrtStartRunWorkData) -> ProcessResult {
        unsupported(WorkDataKind::OrtStartRun)
    }

    async fn process_file_indexing(&self, _data: &FileIndexingWorkData) -> ProcessResult {
        unsupported(WorkDataKind::FileIndexing)
    }

    async fn process_file_search(&self, _data: &FileSearchWorkData) -> ProcessResult {
        unsupported(WorkDataKind::FileSearch)
    }

    async fn process_information_file_send(
        &self,
        _data: &InformationFileSendWorkData,
    ) -> ProcessResult {
        unsupported(WorkDataKind::InformationFileSend)
    }
}

impl WorkData {
    /// Route this unit to the matching handler.
    pub async fn process<P>(&self, processor: &P) -> ProcessResult
    where
        P: WorkDataProcessor + ?Sized,
    {
        match self {
            WorkData::Sample(d) => processor.process_sample(d).await,
            WorkData::ScannerSend(d) => processor.process_scanner_send(d).await,
            WorkData::AiLicenseMatcher(d) => processor.process_license_matcher(d).await,
            WorkData::AiCopyrightFilter(d) => processor.process_copyright_filter(d).await,
            WorkData::AiStatusQuery(d) => processor.process_ai_status_query(d).await,
            WorkData::AiAnswer(d) => processor.process_ai_answer(d).await,
            WorkData::FossReport(d) => processor.process_foss_report(d).await,
            WorkData::Spdx(d) => processor.process_spdx(d).await,
            WorkData::SpdxExport(d) => processor.process_spdx_export(d).await,
            WorkData::Download(d) => processor.process_download(d).await,
            WorkData::Vulnerability(d) => processor.process_vulnerability(d).await,
            WorkData::OrtStartRun(d) => processor.process_ort_start_run(d).await,
            WorkData::FileIndexing(d) => processor.process_file_indexing(d).await,
            WorkData::FileSearch(d) => processor.process_file_search(d).await,
            WorkData::InformationFileSend(d) => processor.process_information_file_send(d).await,
        }
    }

    /// [`process`](Self::process) with the dispatch boundary applied: variants the
    /// processor does not accept are unsupported, and a panic inside a handler
    /// becomes a transient error instead of unwinding into the caller.
    pub async fn dispatch<P>(&self, processor: &P) -> ProcessResult
    where
        P: WorkDataProcessor + ?Sized,
    {
        let kind = self.kind();
        if !processor.accepts(kind) {
            return unsupported(kind);
        }

        match AssertUnwindSafe(self.process(processor)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ProcessingError::transient(format!(
                "processor '{}' panicked handling '{}': {}",
                processor.name(),
                kind,
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Check that a descriptor and processor fit together.
///
/// Every tag in `acceptableWorkData` must be a known kind the processor accepts.
/// Returns the kinds the descriptor advertises.
pub fn validate_wiring(
    descriptor: &MicroserviceDescriptor,
    processor: &dyn WorkDataProcessor,
) -> Result<Vec<WorkDataKind>, WiringError> {
    if processor.accepted().is_empty() {
        return Err(WiringError::NothingAccepted(processor.name().to_string()));
    }

    let advertised = descriptor.acceptable_kinds()?;
    if let Some(kind) = advertised.iter().find(|k| !processor.accepts(**k)) {
        return Err(WiringError::NotAccepted {
            processor: processor.name().to_string(),
            kind: *kind,
        });
    }
    Ok(advertised)
}

/// Demo processor: logs `sample` and `scannerdata_send` units and succeeds.
#[derive(Debug, Default, Clone)]
pub struct SampleWorkDataProcessor;

const SAMPLE_ACCEPTED: &[WorkDataKind] = &[WorkDataKind::Sample, WorkDataKind::ScannerSend];

#[async_trait]
impl WorkDataProcessor for SampleWorkDataProcessor {
    fn name(&self) -> &str {
        "sample"
    }

    fn accepted(&self) -> &[WorkDataKind] {
        SAMPLE_ACCEPTED
    }

    async fn process_sample(&self, data: &SampleWorkData) -> ProcessResult {
        info!(sample_field = %data.sample_field, "Processing sample work data");
        Ok(())
    }

    async fn process_scanner_send(&self, data: &ScannerSendWorkData) -> ProcessResult {
        info!(inventory_item_id = %data.inventory_item_id, "Processing scanner send work data");
        Ok(())
    }
}
