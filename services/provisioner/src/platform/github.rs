//! GitHub Actions self-hosted runner API client.

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::RunnerId;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::{RunnerPage, RunnerPlatform};
use crate::config::RepoRef;
use crate::error::PlatformError;
use crate::model::{RunnerRecord, RunnerStatus};

/// Public GitHub REST endpoint.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;

/// Repository-scoped runner API client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    base_url: String,
    repo: RepoRef,
}

impl GithubClient {
    /// Create a client for `repo` authenticated with `token`.
    pub fn new(base_url: &str, token: &str, repo: RepoRef) -> Result<Self, PlatformError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("fleetctl/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| PlatformError::Decode(format!("invalid token format: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            repo,
        })
    }

    fn runners_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/actions/runners",
            self.base_url, self.repo.owner, self.repo.repo
        )
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PlatformError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }

    async fn api_error(response: reqwest::Response) -> PlatformError {
        let status = response.status();
        let body: GithubErrorBody = response.json().await.unwrap_or_else(|_| GithubErrorBody {
            message: "Unknown error".to_string(),
        });
        error!(status = %status, message = %body.message, "GitHub API request failed");
        PlatformError::Api {
            status: status.as_u16(),
            message: body.message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RunnersResponse {
    total_count: usize,
    runners: Vec<GithubRunner>,
}

#[derive(Debug, Deserialize)]
struct GithubRunner {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    labels: Vec<GithubLabel>,
}

#[derive(Debug, Deserialize)]
struct GithubLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationTokenResponse {
    token: String,
}

impl From<GithubRunner> for RunnerRecord {
    fn from(runner: GithubRunner) -> Self {
        let status = if runner.status.eq_ignore_ascii_case("online") {
            RunnerStatus::Online
        } else {
            RunnerStatus::Offline
        };
        RunnerRecord {
            id: RunnerId::new(runner.id),
            name: runner.name,
            labels: runner.labels.into_iter().map(|l| l.name).collect(),
            status,
        }
    }
}

#[async_trait]
impl RunnerPlatform for GithubClient {
    async fn list_runners(&self, page: u32) -> Result<RunnerPage, PlatformError> {
        debug!(page, "listing runners");
        let response = self
            .client
            .get(self.runners_url())
            .query(&[("per_page", PER_PAGE), ("page", page)])
            .send()
            .await?;

        let body: RunnersResponse = Self::decode(response).await?;
        Ok(RunnerPage {
            total_count: body.total_count,
            runners: body.runners.into_iter().map(RunnerRecord::from).collect(),
        })
    }

    async fn create_registration_token(&self) -> Result<String, PlatformError> {
        let response = self
            .client
            .post(format!("{}/registration-token", self.runners_url()))
            .send()
            .await?;

        let body: RegistrationTokenResponse = Self::decode(response).await?;
        Ok(body.token)
    }

    async fn delete_runner(&self, id: RunnerId) -> Result<(), PlatformError> {
        debug!(runner_id = %id, "removing runner");
        let response = self
            .client
            .delete(format!("{}/{}", self.runners_url(), id))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(PlatformError::NotFound(id)),
            _ => Err(Self::api_error(response).await),
        }
    }
}
