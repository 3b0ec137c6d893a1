//! Fleet provisioning and runner registration reconciliation.
//!
//! A start run creates compute instances in batches under a purchasing
//! strategy, waits for them to run, then waits for each to register as a
//! worker on the job-dispatch platform under its own label. Stragglers are
//! torn down and replaced with fresh labels until a retry budget runs out, at
//! which point the whole run is rolled back.
//!
//! A stop run terminates every running instance carrying the fleet's tags and
//! removes every registration carrying its base label.
//!
//! Both remote systems sit behind traits ([`ComputeProvider`],
//! [`RunnerPlatform`]); the engine never depends on a concrete client.

pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod platform;
pub mod pricing;
pub mod provisioner;
pub mod registration;
pub mod run;
pub mod strategy;
pub mod teardown;
pub mod userdata;

pub use compute::{ComputeProvider, HttpComputeClient};
pub use config::{Mode, ProvisionConfig, RepoRef, RunSettings};
pub use context::{CounterSnapshot, RunContext};
pub use error::{ComputeError, ComputeErrorKind, ConfigError, FleetError, PlatformError};
pub use model::{
    InstanceLease, LabelInstancePair, LeaseState, PriceQuote, PurchasingStrategy, RunnerRecord,
    RunnerStatus,
};
pub use platform::{GithubClient, RunnerPlatform};
pub use run::{FleetRunner, RunReport, StopReport};
