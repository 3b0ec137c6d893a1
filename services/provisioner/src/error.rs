//! Error taxonomy for the provisioning engine.

use fleet_id::{InstanceId, Label, RunnerId};
use thiserror::Error;

/// Broad cause of a compute provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeErrorKind {
    /// The provider has no capacity for the requested type/market.
    Capacity,
    /// Request rate limited.
    Throttled,
    /// The referenced resource does not exist.
    NotFound,
    /// Any other error reported by the provider.
    Api,
    /// The request never got a usable response.
    Transport,
}

/// A failed call to the compute provider.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed ({kind:?}): {message}")]
pub struct ComputeError {
    pub operation: &'static str,
    pub kind: ComputeErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl ComputeError {
    pub fn new(
        operation: &'static str,
        kind: ComputeErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Attach the provider's error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn capacity(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ComputeErrorKind::Capacity, message)
    }

    /// Capacity exhaustion is what triggers the best-effort fallback.
    pub fn is_capacity(&self) -> bool {
        self.kind == ComputeErrorKind::Capacity
    }

    pub fn is_throttled(&self) -> bool {
        self.kind == ComputeErrorKind::Throttled
    }
}

/// A failed call to the job-dispatch platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("runner {0} not found")]
    NotFound(RunnerId),

    #[error("platform API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Invalid or missing input. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the '{field}' input is required for the '{mode}' mode")]
    Missing {
        field: &'static str,
        mode: &'static str,
    },

    #[error("invalid purchasing strategy '{0}'. Allowed values: spotonly, besteffort, maxperformance, none")]
    InvalidStrategy(String),

    #[error("wrong mode '{0}'. Allowed values: start, stop")]
    InvalidMode(String),

    #[error("invalid value for '{field}': {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Top-level failure of a provisioning or decommissioning run.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("instance creation failed after {} attempts: {}", .errors.len(), last_message(.errors))]
    ProvisioningExhausted { errors: Vec<ComputeError> },

    #[error("no instances could be created out of {requested} requested ({failures} failed attempts)")]
    NoCapacity { requested: usize, failures: u32 },

    #[error("{} runners failed to register after {rounds} rounds", .unregistered.len())]
    RegistrationBudgetExhausted { rounds: u32, unregistered: Vec<Label> },

    #[error("could not stop {} instances: {source}", .ids.len())]
    TeardownIncomplete {
        ids: Vec<InstanceId>,
        #[source]
        source: ComputeError,
    },

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl FleetError {
    /// Invalid input: retrying cannot help.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

fn last_message(errors: &[ComputeError]) -> String {
    errors
        .last()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no error recorded".to_string())
}
