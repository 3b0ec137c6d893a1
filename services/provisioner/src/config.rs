//! Run configuration.
//!
//! [`ProvisionConfig`] is what the operator asked for; [`RunSettings`] holds
//! the tunables that shape retries, batching and polling.

use std::time::Duration;

use crate::compute::{Filter, Tag, TagSpecification};
use crate::error::ConfigError;
use crate::model::PurchasingStrategy;

/// Tag carrying the fleet's base label on every instance and volume.
pub const LABEL_TAG: &str = "gh-runner-label";

/// Tag carrying the configured purchasing strategy.
pub const STRATEGY_TAG: &str = "gh-spot-strategy";

/// Tag carrying the strategy actually applied to a create request.
pub const APPLIED_STRATEGY_TAG: &str = "spot-strategy";

/// Tag carrying the run id.
pub const RUN_ID_TAG: &str = "fleet-run-id";

/// Hard limit on instances per run.
pub const MAX_FLEET_SIZE: usize = 500;

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Start,
    Stop,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Start => "start",
            Mode::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Mode::Start),
            "stop" => Ok(Mode::Stop),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// A repository on the job-dispatch platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    /// Parse `owner/repo`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            field: "repository",
            message: format!("expected 'owner/repo', got '{s}'"),
        };

        let (owner, repo) = s.trim().split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    /// Web URL runners register against.
    pub fn html_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Everything needed to build a create request, checked for presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_group_id: String,
    pub iam_role_name: Option<String>,
    pub runner_home_dir: Option<String>,
    pub pre_runner_script: Option<String>,
}

/// Operator input for one run.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub repository: RepoRef,
    /// Base label shared by every runner of the fleet. Generated in start
    /// mode when absent; required in stop mode.
    pub label: Option<String>,
    pub region: String,
    pub count: usize,
    pub strategy: PurchasingStrategy,
    pub resource_tags: Vec<Tag>,
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub iam_role_name: Option<String>,
    pub runner_home_dir: Option<String>,
    pub pre_runner_script: Option<String>,
}

impl ProvisionConfig {
    /// Check that every input the mode needs is present and sane.
    pub fn validate(&self, mode: Mode) -> Result<(), ConfigError> {
        match mode {
            Mode::Start => {
                self.launch_spec()?;
                if self.count == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "count",
                        message: "must be at least 1".to_string(),
                    });
                }
                if self.count > MAX_FLEET_SIZE {
                    return Err(ConfigError::InvalidValue {
                        field: "count",
                        message: format!("at most {MAX_FLEET_SIZE} runners per run"),
                    });
                }
            }
            Mode::Stop => {
                if non_empty(&self.label).is_none() {
                    return Err(ConfigError::Missing {
                        field: "label",
                        mode: mode.as_str(),
                    });
                }
            }
        }

        Ok(())
    }

    /// The configured base label, ignoring blanks.
    pub fn base_label(&self) -> Option<String> {
        non_empty(&self.label)
    }

    /// Collect the start-mode launch inputs.
    pub fn launch_spec(&self) -> Result<LaunchSpec, ConfigError> {
        let required = |value: &Option<String>, field: &'static str| {
            non_empty(value).ok_or(ConfigError::Missing {
                field,
                mode: "start",
            })
        };

        Ok(LaunchSpec {
            image_id: required(&self.image_id, "image-id")?,
            instance_type: required(&self.instance_type, "instance-type")?,
            security_group_id: required(&self.security_group_id, "security-group-id")?,
            subnet_id: non_empty(&self.subnet_id),
            iam_role_name: non_empty(&self.iam_role_name),
            runner_home_dir: non_empty(&self.runner_home_dir),
            pre_runner_script: non_empty(&self.pre_runner_script),
        })
    }

    /// Tags for instances and volumes created under `base_label`.
    pub fn tag_specifications(&self, base_label: &str, run_id: &str) -> Vec<TagSpecification> {
        let mut tags = self.resource_tags.clone();
        tags.push(Tag::new(LABEL_TAG, base_label));
        tags.push(Tag::new(STRATEGY_TAG, self.strategy.as_str()));
        tags.push(Tag::new(RUN_ID_TAG, run_id));

        ["instance", "volume"]
            .into_iter()
            .map(|resource_type| TagSpecification {
                resource_type: resource_type.to_string(),
                tags: tags.clone(),
            })
            .collect()
    }

    /// Filters that find every instance of the fleet under `base_label`.
    ///
    /// The strategy tag is left out: a best-effort fleet may contain
    /// instances created under the on-demand fallback.
    pub fn identifying_filters(&self, base_label: &str) -> Vec<Filter> {
        self.resource_tags
            .iter()
            .map(|tag| Filter::tag(&tag.key, tag.value.clone()))
            .chain(std::iter::once(Filter::tag(LABEL_TAG, base_label)))
            .collect()
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Tunables for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Instances per create call.
    pub batch_size: usize,
    /// Instances per run.
    pub fleet_cap: usize,
    /// Provisioning stops once this fraction of the target exists.
    pub success_threshold: f64,
    /// Provisioning gives up (keeping what it has) after this many failures.
    pub max_total_failures: u32,
    /// Failures in a row that trigger a backoff.
    pub successive_failure_ceiling: u32,
    pub backoff_delay: Duration,
    /// Backoff rounds before provisioning errors become fatal.
    pub attempt_rounds: u32,

    /// Running waits in flight at once.
    pub wait_chunk_size: usize,
    /// Retries of a failed running wait after the first attempt.
    pub wait_retries: u32,
    pub wait_retry_delay: Duration,

    pub registration_timeout: Duration,
    pub poll_interval: Duration,
    /// Registration rounds, including the first, before a full rollback.
    pub registration_rounds: u32,
    /// Retries of a failed registration token request.
    pub token_retries: u32,
    pub token_retry_delay: Duration,

    pub stop_failure_ceiling: u32,
    pub stop_rounds: u32,
    pub stop_retry_delay: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            fleet_cap: MAX_FLEET_SIZE,
            success_threshold: 0.65,
            max_total_failures: 25,
            successive_failure_ceiling: 5,
            backoff_delay: Duration::from_secs(5),
            attempt_rounds: 3,
            wait_chunk_size: 50,
            wait_retries: 3,
            wait_retry_delay: Duration::from_secs(15),
            registration_timeout: fleet_reconcile::DEFAULT_POLL_TIMEOUT,
            poll_interval: fleet_reconcile::DEFAULT_POLL_INTERVAL,
            registration_rounds: 5,
            token_retries: 3,
            token_retry_delay: Duration::from_secs(5),
            stop_failure_ceiling: 5,
            stop_rounds: 3,
            stop_retry_delay: Duration::from_secs(15),
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("fleet_cap", self.fleet_cap),
            ("wait_chunk_size", self.wait_chunk_size),
            ("registration_rounds", self.registration_rounds as usize),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be at least 1".to_string(),
                });
            }
        }

        if !(self.success_threshold > 0.0 && self.success_threshold <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "success_threshold",
                message: format!("must be in (0, 1], got {}", self.success_threshold),
            });
        }

        Ok(())
    }
}
