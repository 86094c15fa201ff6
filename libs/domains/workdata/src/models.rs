use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Wire discriminators of every work data variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
pub enum WorkDataKind {
    #[strum(serialize = "sample")]
    Sample,
    #[strum(serialize = "scannerdata_send")]
    ScannerSend,
    #[strum(serialize = "licenseMatcher_task")]
    AiLicenseMatcher,
    #[strum(serialize = "copyrightFilter_task")]
    AiCopyrightFilter,
    #[strum(serialize = "ai_status")]
    AiStatusQuery,
    #[strum(serialize = "ai_answer")]
    AiAnswer,
    #[strum(serialize = "fossreport_task")]
    FossReport,
    #[strum(serialize = "spdx_task")]
    Spdx,
    #[strum(serialize = "spdx_export_task")]
    SpdxExport,
    #[strum(serialize = "download_task")]
    Download,
    #[strum(serialize = "vulnerability_task")]
    Vulnerability,
    #[strum(serialize = "ort_run_start")]
    OrtStartRun,
    #[strum(serialize = "file_indexing_task")]
    FileIndexing,
    #[strum(serialize = "file_search_task")]
    FileSearch,
    #[strum(serialize = "information_file_send")]
    InformationFileSend,
}

impl WorkDataKind {
    /// The `type` value used on the wire.
    pub fn tag(self) -> &'static str {
        self.into()
    }
}

/// Demo payload used by the sample microservice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleWorkData {
    pub sample_field: String,
}

/// Hands a scanned inventory item to the scanner services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerSendWorkData {
    pub inventory_item_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiLicenseMatcherWorkData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_matcher_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_item_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiCopyrightFilterWorkData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_item_id: Option<i64>,
    #[serde(default)]
    pub questionable_copyrights: Vec<String>,
}

/// Asks the AI service whether it is available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiStatusQueryWorkData {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnswerWorkData {
    pub answer: String,
}

/// One row of a FOSS report spreadsheet to import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FossReportWorkData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub row_data: Map<String, Value>,
    #[serde(default)]
    pub use_license_matcher: bool,
    #[serde(default)]
    pub use_copyright_filter: bool,
}

/// SPDX document import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpdxWorkData {
    pub json_spdx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub use_copyright_ai: bool,
    #[serde(default)]
    pub use_license_matcher: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpdxExportWorkData {
    pub spdx_document_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadWorkData {
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_item_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_main_package: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityWorkData {
    pub software_component_id: i64,
}

/// Starts an ORT analyzer run for a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrtStartRunWorkData {
    pub repository_type: String,
    pub repository_url: String,
    pub repository_version: String,
    pub organization_name: String,
    pub project_id: i64,
    #[serde(default)]
    pub run_id: i64,
}

/// Indexes every readable file below `basePath` for full-text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexingWorkData {
    pub base_path: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSearchWorkData {
    pub project_id: Uuid,
    pub search_text: String,
    pub max_number_of_findings: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InformationFileSendWorkData {
    pub path: String,
    pub context: String,
}

/// One unit of work. The `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkData {
    #[serde(rename = "sample")]
    Sample(SampleWorkData),
    #[serde(rename = "scannerdata_send")]
    ScannerSend(ScannerSendWorkData),
    #[serde(rename = "licenseMatcher_task")]
    AiLicenseMatcher(AiLicenseMatcherWorkData),
    #[serde(rename = "copyrightFilter_task")]
    AiCopyrightFilter(AiCopyrightFilterWorkData),
    #[serde(rename = "ai_status")]
    AiStatusQuery(AiStatusQueryWorkData),
    #[serde(rename = "ai_answer")]
    AiAnswer(AiAnswerWorkData),
    #[serde(rename = "fossreport_task")]
    FossReport(FossReportWorkData),
    #[serde(rename = "spdx_task")]
    Spdx(SpdxWorkData),
    #[serde(rename = "spdx_export_task")]
    SpdxExport(SpdxExportWorkData),
    #[serde(rename = "download_task")]
    Download(DownloadWorkData),
    #[serde(rename = "vulnerability_task")]
    Vulnerability(VulnerabilityWorkData),
    #[serde(rename = "ort_run_start")]
    OrtStartRun(OrtStartRunWorkData),
    #[serde(rename = "file_indexing_task")]
    FileIndexing(FileIndexingWorkData),
    #[serde(rename = "file_search_task")]
    FileSearch(FileSearchWorkData),
    #[serde(rename = "information_file_send")]
    InformationFileSend(InformationFileSendWorkData),
}

impl WorkData {
    pub fn kind(&self) -> WorkDataKind {
        match self {
            WorkData::Sample(_) => WorkDataKind::Sample,
            WorkData::ScannerSend(_) => WorkDataKind::ScannerSend,
            WorkData::AiLicenseMatcher(_) => WorkDataKind::AiLicenseMatcher,
            WorkData::AiCopyrightFilter(_) => WorkDataKind::AiCopyrightFilter,
            WorkData::AiStatusQuery(_) => WorkDataKind::AiStatusQuery,
            WorkData::AiAnswer(_) => WorkDataKind::AiAnswer,
            WorkData::FossReport(_) => WorkDataKind::FossReport,
            WorkData::Spdx(_) => WorkDataKind::Spdx,
            WorkData::SpdxExport(_) => WorkDataKind::SpdxExport,
            WorkData::Download(_) => WorkDataKind::Download,
            WorkData::Vulnerability(_) => WorkDataKind::Vulnerability,
            WorkData::OrtStartRun(_) => WorkDataKind::OrtStartRun,
            WorkData::FileIndexing(_) => WorkDataKind::FileIndexing,
            WorkData::FileSearch(_) => WorkDataKind::FileSearch,
            WorkData::InformationFileSend(_) => WorkDataKind::InformationFileSend,
        }
    }

    /// Decode a work payload.
    ///
    /// The discriminator is read first so an unknown tag is reported as
    /// [`DecodeError::UnknownType`] rather than a generic parse failure. A payload
    /// wrapped in a [`WorkTask`] envelope is unwrapped transparently.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut value: Value = serde_json::from_slice(payload).map_err(DecodeError::InvalidJson)?;

        if value.get("type").is_none() {
            if let Some(inner) = value.get_mut("workData").map(Value::take) {
                value = inner;
            }
        }

        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let kind =
            WorkDataKind::from_str(tag).map_err(|_| DecodeError::UnknownType(tag.to_string()))?;

        serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident($data:ty)),* $(,)?) => {
        $(
            impl From<$data> for WorkData {
                fn from(data: $data) -> Self {
                    WorkData::$variant(data)
                }
            }
        )*
    };
}

impl_from_variant!(
    Sample(SampleWorkData),
    ScannerSend(ScannerSendWorkData),
    AiLicenseMatcher(AiLicenseMatcherWorkData),
    AiCopyrightFilter(AiCopyrightFilterWorkData),
    AiStatusQuery(AiStatusQueryWorkData),
    AiAnswer(AiAnswerWorkData),
    FossReport(FossReportWorkData),
    Spdx(SpdxWorkData),
    SpdxExport(SpdxExportWorkData),
    Download(DownloadWorkData),
    Vulnerability(VulnerabilityWorkData),
    OrtStartRun(OrtStartRunWorkData),
    FileIndexing(FileIndexingWorkData),
    FileSearch(FileSearchWorkData),
    InformationFileSend(InformationFileSendWorkData),
);

/// Envelope some producers wrap work data in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTask {
    /// Name of the task the receiving service should run.
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Milliseconds since the epoch, set by the sender.
    pub timestamp: i64,
    pub work_data: WorkData,
}

impl WorkTask {
    pub fn new(task: impl Into<String>, work_data: impl Into<WorkData>) -> Self {
        Self {
            task: task.into(),
            details: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            work_data: work_data.into(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    #[test]
    fn test_decode_sample() {
        let data = WorkData::decode(br#"{"type":"sample","sampleField":"X"}"#).unwrap();
        assert_eq!(
            data,
            WorkData::Sample(SampleWorkData {
                sample_field: "X".into()
            })
        );
        assert_eq!(data.kind(), WorkDataKind::Sample);
    }

    #[test]
    fn test_decode_scanner_send() {
        let id = Uuid::new_v4();
        let payload = json!({"type": "scannerdata_send", "inventoryItemId": id}).to_string();
        let data = WorkData::decode(payload.as_bytes()).unwrap();
        assert_eq!(
            data,
            WorkData::ScannerSend(ScannerSendWorkData {
                inventory_item_id: id
            })
        );
    }

    #[test]
    fn test_serialized_shape_uses_wire_names() {
        let data = WorkData::from(DownloadWorkData {
            download_url: "https://example.org/pkg.tgz".into(),
            project_id: Some(7),
            inventory_item_id: None,
            is_main_package: Some(true),
        });
        let value: Value = serde_json::from_slice(&data.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "download_task",
                "downloadURL": "https://example.org/pkg.tgz",
                "projectId": 7,
                "isMainPackage": true
            })
        );
    }

    /// One fully populated payload per kind, written the way producers send it.
    fn wire_payload(kind: WorkDataKind) -> Value {
        let uuid = "6f1c2a52-0b6e-4a53-9f0e-3c1f5a1c9b7d";
        let mut payload = match kind {
            WorkDataKind::Sample => json!({"sampleField": "hello"}),
            WorkDataKind::ScannerSend => json!({"inventoryItemId": uuid}),
            WorkDataKind::AiLicenseMatcher => json!({
                "userMessage": "match this",
                "url": "https://spdx.org/licenses/MIT.html",
                "licenseMatcherResult": "MIT",
                "licenseId": "MIT",
                "licenseText": "Permission is hereby granted",
                "inventoryItemId": 4
            }),
            WorkDataKind::AiCopyrightFilter => json!({
                "userMessage": "filter these",
                "inventoryItemId": 12,
                "questionableCopyrights": ["(c) ACME"]
            }),
            WorkDataKind::AiStatusQuery => json!({}),
            WorkDataKind::AiAnswer => json!({"answer": "available"}),
            WorkDataKind::FossReport => json!({
                "projectId": 3,
                "rowData": {"Name": "serde", "# Files": 12},
                "useLicenseMatcher": true,
                "useCopyrightFilter": false
            }),
            WorkDataKind::Spdx => json!({
                "jsonSpdx": "{\"spdxVersion\":\"SPDX-2.3\"}",
                "bucketName": "imports",
                "projectId": "42",
                "useCopyrightAi": true,
                "useLicenseMatcher": false
            }),
            WorkDataKind::SpdxExport => json!({"spdxDocumentId": "doc-1", "projectId": "42"}),
            WorkDataKind::Download => json!({
                "downloadURL": "https://example.org/pkg.tgz",
                "projectId": 7,
                "inventoryItemId": 8,
                "isMainPackage": true
            }),
            WorkDataKind::Vulnerability => json!({"softwareComponentId": 5}),
            WorkDataKind::OrtStartRun => json!({
                "repositoryType": "git",
                "repositoryUrl": "https://example.org/repo.git",
                "repositoryVersion": "main",
                "organizationName": "acme",
                "projectId": 1,
                "runId": 99
            }),
            WorkDataKind::FileIndexing => json!({"basePath": "/data/project-42", "projectId": "42"}),
            WorkDataKind::FileSearch => json!({
                "projectId": uuid,
                "searchText": "GPL",
                "maxNumberOfFindings": 10
            }),
            WorkDataKind::InformationFileSend => json!({"path": "docs/NOTICE", "context": "notice"}),
        };
        payload["type"] = json!(kind.tag());
        payload
    }

    #[test]
    fn test_every_kind_keeps_its_wire_shape() {
        for kind in WorkDataKind::iter() {
            let payload = wire_payload(kind);
            let data = WorkData::decode(payload.to_string().as_bytes())
                .unwrap_or_else(|e| panic!("{kind} failed to decode: {e}"));
            assert_eq!(data.kind(), kind);

            // Re-encoding gives back exactly the producer's field names and tag.
            let encoded: Value = serde_json::from_slice(&data.to_json().unwrap()).unwrap();
            assert_eq!(encoded, payload, "{kind} changed shape on the wire");
            assert_eq!(WorkData::decode(&data.to_json().unwrap()).unwrap(), data);
        }
    }

    #[test]
    fn test_file_indexing_fields() {
        let data = WorkData::decode(
            br#"{"type":"file_indexing_task","basePath":"/data/p","projectId":"42"}"#,
        )
        .unwrap();
        assert_eq!(
            data,
            WorkData::FileIndexing(FileIndexingWorkData {
                base_path: "/data/p".into(),
                project_id: "42".into(),
            })
        );
    }

    #[test]
    fn test_unknown_type_is_distinguishable() {
        let err = WorkData::decode(br#"{"type":"teleport_task","target":"mars"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "teleport_task"));
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_missing_type_and_invalid_json() {
        assert!(matches!(
            WorkData::decode(br#"{"sampleField":"X"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            WorkData::decode(br#"{"type":42}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            WorkData::decode(b"not json"),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_malformed_known_type() {
        let err =
            WorkData::decode(br#"{"type":"scannerdata_send","inventoryItemId":"nope"}"#).unwrap_err();
        assert_eq!(err.kind(), Some(WorkDataKind::ScannerSend));
        assert!(!err.is_schema_mismatch());
    }

    #[test]
    fn test_decode_unwraps_work_task_envelope() {
        let task = WorkTask::new(
            "sample",
            SampleWorkData {
                sample_field: "wrapped".into(),
            },
        )
        .with_details("from the frontend");
        let bytes = serde_json::to_vec(&task).unwrap();

        let data = WorkData::decode(&bytes).unwrap();
        assert_eq!(data, task.work_data);
    }

    #[test]
    fn test_every_kind_parses_from_its_tag() {
        for kind in WorkDataKind::iter() {
            assert_eq!(WorkDataKind::from_str(kind.tag()).unwrap(), kind);
            assert_eq!(kind.to_string(), kind.tag());
        }
        assert!(WorkDataKind::from_str("SAMPLE").is_err());
    }
}
