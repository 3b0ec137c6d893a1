//! CLI commands.

mod start;
mod stop;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleet_provisioner::compute::Tag;
use fleet_provisioner::platform::DEFAULT_GITHUB_API_URL;
use fleet_provisioner::{
    FleetRunner, GithubClient, HttpComputeClient, ProvisionConfig, RepoRef, RunSettings,
};

use crate::config::{load_settings, parse_resource_tags};
use crate::output::OutputFormat;

/// Start and stop fleets of self-hosted GitHub Actions runners.
#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format for the result (json or table).
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// GitHub token allowed to manage the repository's runners.
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Repository the runners register with, as owner/repo.
    #[arg(long, global = true, env = "GITHUB_REPOSITORY")]
    repository: Option<String>,

    /// Base label shared by every runner of the fleet.
    #[arg(long, global = true, env = "FLEET_LABEL")]
    label: Option<String>,

    /// Region the fleet lives in.
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// Extra tags for every instance and volume, as a JSON array of
    /// `{"Key": ..., "Value": ...}` objects.
    #[arg(long, global = true, env = "FLEET_RESOURCE_TAGS")]
    resource_tags: Option<String>,

    /// Compute gateway endpoint.
    #[arg(long, global = true, env = "FLEET_COMPUTE_URL")]
    compute_url: Option<String>,

    /// Bearer token for the compute gateway.
    #[arg(long, global = true, env = "FLEET_COMPUTE_TOKEN", hide_env_values = true)]
    compute_token: Option<String>,

    /// GitHub REST endpoint.
    #[arg(long, global = true, env = "GITHUB_API_URL", default_value = DEFAULT_GITHUB_API_URL)]
    github_api_url: String,

    /// TOML file overriding run settings (durations in seconds).
    #[arg(long, global = true, env = "FLEET_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision a fleet and wait for every runner to register.
    Start(start::StartCommand),

    /// Terminate a fleet and remove its runners.
    Stop(stop::StopCommand),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Cli {
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let settings = match &self.settings {
            Some(path) => load_settings(path)?,
            None => RunSettings::default(),
        };
        let resource_tags = match &self.resource_tags {
            Some(raw) => parse_resource_tags(raw)?,
            None => Vec::new(),
        };

        let ctx = CommandContext {
            format: self.format,
            github_token: self.github_token,
            repository: self.repository,
            label: self.label,
            region: self.region,
            resource_tags,
            compute_url: self.compute_url,
            compute_token: self.compute_token,
            github_api_url: self.github_api_url,
            settings,
        };

        match self.command {
            Commands::Start(cmd) => cmd.run(ctx).await,
            Commands::Stop(cmd) => cmd.run(ctx).await,
        }
    }
}

/// Inputs shared by both modes.
pub struct CommandContext {
    pub format: OutputFormat,
    github_token: Option<String>,
    repository: Option<String>,
    label: Option<String>,
    region: Option<String>,
    resource_tags: Vec<Tag>,
    compute_url: Option<String>,
    compute_token: Option<String>,
    github_api_url: String,
    settings: RunSettings,
}

impl CommandContext {
    fn repository(&self) -> Result<RepoRef> {
        let raw = self.repository.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No repository specified. Use --repository or set GITHUB_REPOSITORY.")
        })?;
        Ok(RepoRef::parse(raw)?)
    }

    fn region(&self) -> Result<&str> {
        self.region
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No region specified. Use --region or set AWS_REGION."))
    }

    /// Configuration common to both modes; `start` fills in the launch fields.
    pub fn base_config(&self) -> Result<ProvisionConfig> {
        Ok(ProvisionConfig {
            repository: self.repository()?,
            label: self.label.clone(),
            region: self.region()?.to_string(),
            count: 0,
            strategy: Default::default(),
            resource_tags: self.resource_tags.clone(),
            image_id: None,
            instance_type: None,
            subnet_id: None,
            security_group_id: None,
            iam_role_name: None,
            runner_home_dir: None,
            pre_runner_script: None,
        })
    }

    /// Wire both API clients into a runner for `config`.
    pub fn runner(&self, config: ProvisionConfig) -> Result<FleetRunner> {
        let compute_url = self.compute_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No compute endpoint specified. Use --compute-url or set FLEET_COMPUTE_URL.")
        })?;
        let github_token = self.github_token.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No GitHub token specified. Use --github-token or set GITHUB_TOKEN.")
        })?;

        let compute =
            HttpComputeClient::new(compute_url, self.compute_token.as_deref(), &config.region)
                .context("Failed to create compute client")?;
        let platform =
            GithubClient::new(&self.github_api_url, github_token, config.repository.clone())
                .context("Failed to create GitHub client")?;

        Ok(FleetRunner::new(
            Arc::new(compute),
            Arc::new(platform),
            config,
            self.settings.clone(),
        ))
    }
}
