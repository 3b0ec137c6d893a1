//! Job-dispatch platform abstraction.

mod github;

pub use github::{GithubClient, DEFAULT_GITHUB_API_URL};

use async_trait::async_trait;
use fleet_id::RunnerId;

use crate::error::PlatformError;
use crate::model::RunnerRecord;

/// One page of runner registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerPage {
    pub runners: Vec<RunnerRecord>,
    /// Total registrations across all pages, as reported by the platform.
    pub total_count: usize,
}

/// Operations the engine needs from the job-dispatch platform.
#[async_trait]
pub trait RunnerPlatform: Send + Sync {
    /// List registrations. Pages are 1-based.
    async fn list_runners(&self, page: u32) -> Result<RunnerPage, PlatformError>;

    /// Obtain a short-lived token that lets a worker register itself.
    async fn create_registration_token(&self) -> Result<String, PlatformError>;

    /// Remove a registration. Fails with [`PlatformError::NotFound`] if it is
    /// already gone.
    async fn delete_runner(&self, id: RunnerId) -> Result<(), PlatformError>;
}
