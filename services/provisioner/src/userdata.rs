//! Worker bootstrap script.
//!
//! One create call launches a whole batch with a single script, so the script
//! carries every label of the batch and each instance picks its own by the
//! launch index reported by the instance metadata service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fleet_id::Label;

/// Runner release downloaded when no pre-installed home directory is given.
pub const RUNNER_VERSION: &str = "2.313.0";

const METADATA_URL: &str = "http://169.254.169.254/latest";

/// Inputs for one batch's bootstrap script.
#[derive(Debug, Clone)]
pub struct BootstrapScript<'a> {
    pub repo_url: &'a str,
    pub registration_token: &'a str,
    pub base_label: &'a str,
    /// Indexed by launch index.
    pub labels: &'a [Label],
    pub runner_home_dir: Option<&'a str>,
    pub pre_runner_script: Option<&'a str>,
}

impl BootstrapScript<'_> {
    /// Render the script. Runs as root on first boot.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = vec!["#!/bin/bash".to_string()];

        match self.runner_home_dir {
            Some(dir) => lines.push(format!("cd {}", shell_quote(dir))),
            None => lines.push("mkdir -p actions-runner && cd actions-runner".to_string()),
        }

        lines.push("cat > pre-runner-script.sh <<'PRE_RUNNER_EOF'".to_string());
        lines.push(self.pre_runner_script.unwrap_or_default().to_string());
        lines.push("PRE_RUNNER_EOF".to_string());
        lines.push("source pre-runner-script.sh".to_string());

        if self.runner_home_dir.is_none() {
            lines.push(
                r#"case $(uname -m) in aarch64) ARCH="arm64" ;; amd64|x86_64) ARCH="x64" ;; esac && export RUNNER_ARCH=${ARCH}"#
                    .to_string(),
            );
            lines.push(format!(
                "curl -O -L https://github.com/actions/runner/releases/download/v{v}/actions-runner-linux-${{RUNNER_ARCH}}-{v}.tar.gz",
                v = RUNNER_VERSION
            ));
            lines.push(format!(
                "tar xzf ./actions-runner-linux-${{RUNNER_ARCH}}-{RUNNER_VERSION}.tar.gz"
            ));
        }

        let labels: Vec<&str> = self.labels.iter().map(Label::as_str).collect();
        lines.push(format!("LABELS=({})", labels.join(" ")));
        lines.push(format!(
            r#"IMDS_TOKEN=$(curl -s -X PUT "{METADATA_URL}/api/token" -H "X-aws-ec2-metadata-token-ttl-seconds: 300")"#
        ));
        lines.push(format!(
            r#"LAUNCH_INDEX=$(curl -s -H "X-aws-ec2-metadata-token: $IMDS_TOKEN" {METADATA_URL}/meta-data/ami-launch-index)"#
        ));
        lines.push("RUNNER_LABEL=${LABELS[$LAUNCH_INDEX]}".to_string());

        lines.push("export RUNNER_ALLOW_RUNASROOT=1".to_string());
        lines.push(format!(
            "./config.sh --unattended --url {} --token {} --labels {},${{RUNNER_LABEL}}",
            self.repo_url, self.registration_token, self.base_label
        ));
        lines.push("./run.sh".to_string());

        let mut script = lines.join("\n");
        script.push('\n');
        script
    }

    /// The script as the base64 user data the provider expects.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.render())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
