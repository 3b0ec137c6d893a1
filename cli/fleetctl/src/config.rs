//! Settings file and tag parsing.
//!
//! A settings file overrides any subset of the run settings:
//!
//! ```toml
//! batch_size = 25
//! registration_timeout_secs = 120
//! poll_interval_secs = 10
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_provisioner::compute::Tag;
use fleet_provisioner::RunSettings;
use serde::Deserialize;

/// Run settings as written in a TOML file. Durations are in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub batch_size: Option<usize>,
    pub fleet_cap: Option<usize>,
    pub success_threshold: Option<f64>,
    pub max_total_failures: Option<u32>,
    pub successive_failure_ceiling: Option<u32>,
    pub backoff_delay_secs: Option<u64>,
    pub attempt_rounds: Option<u32>,
    pub wait_chunk_size: Option<usize>,
    pub wait_retries: Option<u32>,
    pub wait_retry_delay_secs: Option<u64>,
    pub registration_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub registration_rounds: Option<u32>,
    pub token_retries: Option<u32>,
    pub token_retry_delay_secs: Option<u64>,
    pub stop_failure_ceiling: Option<u32>,
    pub stop_rounds: Option<u32>,
    pub stop_retry_delay_secs: Option<u64>,
}

impl SettingsFile {
    /// Overlay the values present in the file onto `base`.
    pub fn apply(self, base: RunSettings) -> RunSettings {
        let secs = Duration::from_secs;
        RunSettings {
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            fleet_cap: self.fleet_cap.unwrap_or(base.fleet_cap),
            success_threshold: self.success_threshold.unwrap_or(base.success_threshold),
            max_total_failures: self.max_total_failures.unwrap_or(base.max_total_failures),
            successive_failure_ceiling: self
                .successive_failure_ceiling
                .unwrap_or(base.successive_failure_ceiling),
            backoff_delay: self.backoff_delay_secs.map(secs).unwrap_or(base.backoff_delay),
            attempt_rounds: self.attempt_rounds.unwrap_or(base.attempt_rounds),
            wait_chunk_size: self.wait_chunk_size.unwrap_or(base.wait_chunk_size),
            wait_retries: self.wait_retries.unwrap_or(base.wait_retries),
            wait_retry_delay: self
                .wait_retry_delay_secs
                .map(secs)
                .unwrap_or(base.wait_retry_delay),
            registration_timeout: self
                .registration_timeout_secs
                .map(secs)
                .unwrap_or(base.registration_timeout),
            poll_interval: self.poll_interval_secs.map(secs).unwrap_or(base.poll_interval),
            registration_rounds: self.registration_rounds.unwrap_or(base.registration_rounds),
            token_retries: self.token_retries.unwrap_or(base.token_retries),
            token_retry_delay: self
                .token_retry_delay_secs
                .map(secs)
                .unwrap_or(base.token_retry_delay),
            stop_failure_ceiling: self.stop_failure_ceiling.unwrap_or(base.stop_failure_ceiling),
            stop_rounds: self.stop_rounds.unwrap_or(base.stop_rounds),
            stop_retry_delay: self
                .stop_retry_delay_secs
                .map(secs)
                .unwrap_or(base.stop_retry_delay),
        }
    }
}

/// Load settings from a TOML file on top of the defaults.
pub fn load_settings(path: &Path) -> Result<RunSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {:?}", path))?;
    let file: SettingsFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse settings from {:?}", path))?;

    let settings = file.apply(RunSettings::default());
    settings.validate()?;
    Ok(settings)
}

/// Parse `[{"Key": "...", "Value": "..."}]`. An empty string means no tags.
pub fn parse_resource_tags(raw: &str) -> Result<Vec<Tag>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).context(
        "Invalid --resource-tags; expected a JSON array of {\"Key\", \"Value\"} objects",
    )
}
