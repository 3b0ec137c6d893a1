//! Test support for the fleet engine.
//!
//! [`FakeCompute`] and [`FakePlatform`] implement the engine's remote seams in
//! memory. Wiring a [`Registrar`] into the compute fake makes created instances
//! register on the platform fake, which is how tests model stragglers.

mod compute;
mod platform;

use std::time::Duration;

use fleet_provisioner::compute::Tag;
use fleet_provisioner::{ProvisionConfig, PurchasingStrategy, RepoRef, RunSettings};

pub use compute::{CreateOutcome, FakeCompute, FakeInstanceState, Registrar};
pub use platform::FakePlatform;

/// Base label used by [`test_config`].
pub const TEST_BASE_LABEL: &str = "fleet01";

/// Default settings with every delay shrunk to milliseconds.
pub fn fast_settings() -> RunSettings {
    RunSettings {
        backoff_delay: Duration::from_millis(1),
        wait_retry_delay: Duration::from_millis(1),
        registration_timeout: Duration::from_millis(30),
        poll_interval: Duration::from_millis(5),
        token_retry_delay: Duration::from_millis(1),
        stop_retry_delay: Duration::from_millis(1),
        ..RunSettings::default()
    }
}

/// A valid start/stop configuration for `count` runners.
pub fn test_config(count: usize, strategy: PurchasingStrategy) -> ProvisionConfig {
    ProvisionConfig {
        repository: RepoRef {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
        },
        label: Some(TEST_BASE_LABEL.to_string()),
        region: "us-east-1".to_string(),
        count,
        strategy,
        resource_tags: vec![Tag::new("Team", "ci")],
        image_id: Some("ami-0123456789".to_string()),
        instance_type: Some("c5.large".to_string()),
        subnet_id: Some("subnet-1".to_string()),
        security_group_id: Some("sg-1".to_string()),
        iam_role_name: None,
        runner_home_dir: None,
        pre_runner_script: None,
    }
}

/// The usual c5 family ladder, including a bare-metal size that must be skipped.
pub const C5_FAMILY: &[(&str, Option<u32>)] = &[
    ("c5.large", Some(1)),
    ("c5.xlarge", Some(2)),
    ("c5.2xlarge", Some(4)),
    ("c5.4xlarge", Some(8)),
    ("c5.metal", Some(48)),
];
