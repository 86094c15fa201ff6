//! Shared test utilities for microservice testing
//!
//! - `ScriptedProcessor`: a [`WorkDataProcessor`](domain_workdata::WorkDataProcessor)
//!   whose outcomes follow a script (always available)
//! - `TestDataBuilder`: deterministic work data and descriptors (always available)
//! - `assertions`: assertion and polling helpers (always available)
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_utils::{Outcome, ScriptedProcessor, TestDataBuilder};
//!
//! let builder = TestDataBuilder::from_test_name("my_test");
//! let work = builder.sample_work("hello");
//! let processor = ScriptedProcessor::scripted([Outcome::Transient], Outcome::Succeed);
//! ```
//!
//! ## NATS Testing
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::TestNats;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let bus = nats.bus();
//! }
//! ```

use domain_workdata::{
    MicroserviceDescriptor, SampleWorkData, ScannerSendWorkData, UsageType, WorkData,
    WorkDataKind,
};
use uuid::Uuid;

mod processor;

#[cfg(feature = "nats")]
mod nats;

pub use processor::{Outcome, ScriptedProcessor};

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test data with deterministic randomization
///
/// The same test name always yields the same ids and names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_sample_work");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic inventory item id
    pub fn inventory_item_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Unique service name, safe to use as a subject token
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let name = builder.service_name("sample");
    /// assert!(name.starts_with("test-sample-"));
    /// ```
    pub fn service_name(&self, prefix: &str) -> String {
        format!("test-{}-{}", prefix, self.seed)
    }

    pub fn sample_work(&self, field: &str) -> WorkData {
        SampleWorkData {
            sample_field: field.to_string(),
        }
        .into()
    }

    pub fn scanner_work(&self) -> WorkData {
        ScannerSendWorkData {
            inventory_item_id: self.inventory_item_id(),
        }
        .into()
    }

    /// Descriptor of a consumer service advertising `kinds`
    pub fn descriptor(&self, name: &str, kinds: &[WorkDataKind]) -> MicroserviceDescriptor {
        MicroserviceDescriptor::new(
            name,
            "Service under test",
            "0.0.1",
            kinds
                .iter()
                .map(|k| k.tag())
                .collect::<Vec<_>>()
                .join(","),
            UsageType::RunnableByService,
        )
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` every 10ms until it holds, panicking after `timeout`.
    pub async fn eventually<F, Fut>(timeout: Duration, context: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.inventory_item_id(), builder2.inventory_item_id());
        assert_eq!(
            builder1.service_name("sample"),
            builder2.service_name("sample")
        );
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.inventory_item_id(), builder2.inventory_item_id());
    }

    #[test]
    fn test_descriptor_advertises_tags() {
        let builder = TestDataBuilder::from_test_name("descriptor");
        let descriptor = builder.descriptor("svc", &[WorkDataKind::Sample]);
        assert_eq!(descriptor.acceptable_work_data, "sample");
        assert_eq!(
            builder
                .descriptor("svc", &[WorkDataKind::Sample, WorkDataKind::Spdx])
                .acceptable_work_data,
            "sample,spdx_task"
        );
        assert_eq!(builder.scanner_work().kind(), WorkDataKind::ScannerSend);
    }

    #[tokio::test]
    async fn test_eventually_polls_until_true() {
        let counter = Arc::new(AtomicU32::new(0));
        assertions::eventually(Duration::from_secs(1), "counter", || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }
}
