//! # fleet-id
//!
//! Correlation labels and typed identifiers for fleet provisioning runs.
//!
//! ## Design Principles
//!
//! - Neither the compute provider nor the job-dispatch platform hands out a
//!   shared identifier before a worker registers, so the engine mints its own
//!   [`Label`] per instance and uses it as the only correlation key.
//! - Labels are meaningful for the lifetime of one run; a [`LabelAllocator`]
//!   never hands out the same label twice.
//! - Provider-assigned ids are wrapped in typed newtypes so an instance id can
//!   never be passed where a runner id is expected.
//!
//! ## ID Formats
//!
//! - `RunId`: `run_{ulid}` (time-ordered, minted locally per run)
//! - `InstanceId`: opaque provider string, e.g. `i-0abc123def4567890`
//! - `RunnerId`: numeric platform id
//! - `Label`: 8 characters from `[0-9a-z]`, e.g. `k3v9q0zx`

mod error;
mod label;
mod macros;
mod types;

pub use error::IdError;
pub use label::{Label, LabelAllocator, LABEL_ALPHABET, LABEL_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
