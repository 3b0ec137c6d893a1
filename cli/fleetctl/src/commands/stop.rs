//! Stop command (tear a fleet down).

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::output::print_stop_report;

use super::CommandContext;

/// Stop command - terminate every instance and runner under the base label.
#[derive(Debug, Args)]
pub struct StopCommand {}

impl StopCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let config = ctx.base_config()?;
        let runner = ctx.runner(config)?;
        let report = runner.stop().await?;

        info!(
            run_id = %report.run_id,
            compute_requests = report.counters.compute_requests,
            platform_requests = report.counters.platform_requests,
            "fleet stopped"
        );

        print_stop_report(&report, ctx.format);
        Ok(())
    }
}
