//! Start command (provision a fleet).

use anyhow::Result;
use clap::Args;
use fleet_provisioner::PurchasingStrategy;
use tracing::info;

use crate::output::{print_pairs, write_github_output};

use super::CommandContext;

/// Start command - provision runners and wait for them to register.
#[derive(Debug, Args)]
pub struct StartCommand {
    /// Machine image with the runner prerequisites installed.
    #[arg(long, env = "FLEET_IMAGE_ID")]
    image_id: Option<String>,

    /// Instance type to launch (e.g. c5.large).
    #[arg(long, env = "FLEET_INSTANCE_TYPE")]
    instance_type: Option<String>,

    /// Subnet to launch into.
    #[arg(long, env = "FLEET_SUBNET_ID")]
    subnet_id: Option<String>,

    /// Security group for the instances.
    #[arg(long, env = "FLEET_SECURITY_GROUP_ID")]
    security_group_id: Option<String>,

    /// Instance profile attached to the instances.
    #[arg(long, env = "FLEET_IAM_ROLE_NAME")]
    iam_role_name: Option<String>,

    /// Directory holding a pre-installed runner. When omitted the runner is
    /// downloaded at boot.
    #[arg(long, env = "FLEET_RUNNER_HOME_DIR")]
    runner_home_dir: Option<String>,

    /// Shell snippet run before the runner is configured.
    #[arg(long, env = "FLEET_PRE_RUNNER_SCRIPT")]
    pre_runner_script: Option<String>,

    /// Number of runners.
    #[arg(long, env = "FLEET_COUNT", default_value_t = 1)]
    pub(super) count: usize,

    /// Purchasing strategy: spotonly, besteffort, maxperformance or none.
    #[arg(long, env = "FLEET_STRATEGY", default_value = "none")]
    pub(super) strategy: PurchasingStrategy,
}

impl StartCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let mut config = ctx.base_config()?;
        config.count = self.count;
        config.strategy = self.strategy;
        config.image_id = self.image_id;
        config.instance_type = self.instance_type;
        config.subnet_id = self.subnet_id;
        config.security_group_id = self.security_group_id;
        config.iam_role_name = self.iam_role_name;
        config.runner_home_dir = self.runner_home_dir;
        config.pre_runner_script = self.pre_runner_script;

        let runner = ctx.runner(config)?;
        let report = runner.start().await?;

        info!(
            run_id = %report.run_id,
            base_label = %report.base_label,
            runners = report.pairs.len(),
            rounds = report.rounds,
            compute_requests = report.counters.compute_requests,
            platform_requests = report.counters.platform_requests,
            "fleet started"
        );

        print_pairs(&report.pairs, ctx.format);
        write_github_output(&report.pairs)?;
        Ok(())
    }
}
