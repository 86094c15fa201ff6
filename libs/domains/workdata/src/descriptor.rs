use crate::error::{DescriptorError, WiringError};
use crate::models::WorkDataKind;
use crate::system::SystemMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use strum::{Display, EnumString};

/// Who may start a microservice's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    /// Only other services enqueue work.
    RunnableByService,
    /// Users trigger work from the frontend.
    RunnableByUser,
    RunnableByAnyone,
}

/// Identity of a microservice, answered to `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceDescriptor {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Comma or whitespace separated work data tags this service consumes.
    pub acceptable_work_data: String,
    pub usage_type: UsageType,
}

impl MicroserviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
        acceptable_work_data: impl Into<String>,
        usage_type: UsageType,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: version.into(),
            acceptable_work_data: acceptable_work_data.into(),
            usage_type,
        }
    }

    /// Parse a descriptor document.
    ///
    /// The `type` field may be omitted; when present it must be `descriptor`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let value: Value = serde_json::from_slice(bytes)?;
        if let Some(kind) = value.get("type") {
            if kind.as_str() != Some("descriptor") {
                let found = kind
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| kind.to_string());
                return Err(DescriptorError::WrongType(found));
            }
        }

        let descriptor: Self = serde_json::from_value(value)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Read and parse a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DescriptorError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    /// Serialize with the `type: "descriptor"` discriminator.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SystemMessage::Descriptor(self.clone()))
    }

    /// Replace the bundled version with a deployment-time value.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Per-service control subject, `<name>.system`.
    pub fn control_subject(&self) -> String {
        format!("{}.system", self.name)
    }

    /// Work data kinds listed in `acceptableWorkData`.
    pub fn acceptable_kinds(&self) -> Result<Vec<WorkDataKind>, WiringError> {
        self.acceptable_work_data
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|tag| !tag.is_empty())
            .map(|tag| {
                WorkDataKind::from_str(tag).map_err(|_| WiringError::UnknownWorkData(tag.to_string()))
            })
            .collect()
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyField("name"));
        }
        if self.version.trim().is_empty() {
            return Err(DescriptorError::EmptyField("version"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR_JSON: &str = r#"{"type":"descriptor","name":"name","description":"description","version":"version","acceptableWorkData":"someWorkData","usageType":"RUNNABLE_BY_SERVICE"}"#;

    #[test]
    fn test_serializes_to_fleet_format() {
        let descriptor = MicroserviceDescriptor::new(
            "name",
            "description",
            "version",
            "someWorkData",
            UsageType::RunnableByService,
        );
        let json = String::from_utf8(descriptor.to_json().unwrap()).unwrap();
        assert_eq!(json, DESCRIPTOR_JSON);
    }

    #[test]
    fn test_parses_fleet_format() {
        let descriptor = MicroserviceDescriptor::from_json(DESCRIPTOR_JSON.as_bytes()).unwrap();
        assert_eq!(descriptor.name, "name");
        assert_eq!(descriptor.usage_type, UsageType::RunnableByService);
        assert_eq!(descriptor.control_subject(), "name.system");
    }

    #[test]
    fn test_type_field_optional_but_checked() {
        let untyped = r#"{"name":"a","description":"","version":"1","acceptableWorkData":"sample","usageType":"RUNNABLE_BY_USER"}"#;
        assert!(MicroserviceDescriptor::from_json(untyped.as_bytes()).is_ok());

        let status = r#"{"type":"status","name":"a","description":"","version":"1","acceptableWorkData":"sample","usageType":"RUNNABLE_BY_USER"}"#;
        assert!(matches!(
            MicroserviceDescriptor::from_json(status.as_bytes()),
            Err(DescriptorError::WrongType(t)) if t == "status"
        ));
    }

    #[test]
    fn test_rejects_malformed_and_empty() {
        assert!(matches!(
            MicroserviceDescriptor::from_json(b"{\"name\":"),
            Err(DescriptorError::Json(_))
        ));

        let nameless = r#"{"name":" ","description":"","version":"1","acceptableWorkData":"","usageType":"RUNNABLE_BY_SERVICE"}"#;
        assert!(matches!(
            MicroserviceDescriptor::from_json(nameless.as_bytes()),
            Err(DescriptorError::EmptyField("name"))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = MicroserviceDescriptor::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, DescriptorError::Io { .. }));
    }

    #[test]
    fn test_version_override() {
        let descriptor = MicroserviceDescriptor::from_json(DESCRIPTOR_JSON.as_bytes())
            .unwrap()
            .with_version("2.3.4");
        assert_eq!(descriptor.version, "2.3.4");
    }

    #[test]
    fn test_acceptable_kinds() {
        let mut descriptor = MicroserviceDescriptor::new(
            "sample",
            "",
            "1",
            "sample, scannerdata_send",
            UsageType::RunnableByService,
        );
        assert_eq!(
            descriptor.acceptable_kinds().unwrap(),
            vec![WorkDataKind::Sample, WorkDataKind::ScannerSend]
        );

        descriptor.acceptable_work_data = "sample someWorkData".into();
        assert_eq!(
            descriptor.acceptable_kinds().unwrap_err(),
            WiringError::UnknownWorkData("someWorkData".into())
        );
    }
}
