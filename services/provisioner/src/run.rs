//! Run orchestration: start and stop.

use std::sync::Arc;

use fleet_id::{InstanceId, Label, RunId, RunnerId};
use fleet_reconcile::{RetryBudget, RetryRounds};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::compute::ComputeProvider;
use crate::config::{Mode, ProvisionConfig, RunSettings};
use crate::context::{CounterSnapshot, RunContext};
use crate::error::FleetError;
use crate::model::{InstanceLease, LabelInstancePair, LeaseState};
use crate::platform::RunnerPlatform;
use crate::pricing::PricingAdvisor;
use crate::provisioner::FleetProvisioner;
use crate::registration::RegistrationReconciler;
use crate::teardown::{StopRetry, Teardown};

/// Outcome of a successful start.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub base_label: String,
    pub requested: usize,
    pub registered: Vec<InstanceLease>,
    pub pairs: Vec<LabelInstancePair>,
    /// Registration rounds used, including the first.
    pub rounds: u32,
    pub counters: CounterSnapshot,
}

/// Outcome of a stop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub run_id: RunId,
    pub base_label: String,
    pub terminated: Vec<InstanceId>,
    pub removed: Vec<RunnerId>,
    pub counters: CounterSnapshot,
}

/// Drives one start or stop run against both remote systems.
pub struct FleetRunner {
    compute: Arc<dyn ComputeProvider>,
    platform: Arc<dyn RunnerPlatform>,
    config: ProvisionConfig,
    settings: RunSettings,
}

impl FleetRunner {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        platform: Arc<dyn RunnerPlatform>,
        config: ProvisionConfig,
        settings: RunSettings,
    ) -> Self {
        Self {
            compute,
            platform,
            config,
            settings,
        }
    }

    fn teardown(&self) -> Teardown {
        Teardown::new(
            self.compute.clone(),
            self.platform.clone(),
            StopRetry {
                ceiling: self.settings.stop_failure_ceiling,
                rounds: self.settings.stop_rounds,
                delay: self.settings.stop_retry_delay,
            },
        )
    }

    /// Provision the fleet and wait for every runner to register.
    ///
    /// On any failure everything still alive from this run is terminated and
    /// deregistered before the error is returned.
    pub async fn start(&self) -> Result<RunReport, FleetError> {
        self.config.validate(Mode::Start)?;
        self.settings.validate()?;

        let mut ctx = RunContext::new(self.config.base_label().unwrap_or_default());
        if ctx.base_label.is_empty() {
            if let Some(label) = ctx.labels.generate(1).pop() {
                ctx.base_label = label.to_string();
            }
        }

        let span = info_span!(
            "fleet_run",
            run_id = %ctx.run_id,
            base_label = %ctx.base_label,
            mode = "start"
        );

        async {
            match self.provision_and_register(&mut ctx).await {
                Ok(report) => Ok(report),
                Err(e) => {
                    error!(error = %e, "run failed, rolling back");
                    self.rollback(&mut ctx).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn provision_and_register(&self, ctx: &mut RunContext) -> Result<RunReport, FleetError> {
        let provisioner = FleetProvisioner::new(
            self.compute.clone(),
            self.config.clone(),
            self.settings.clone(),
        )?;
        let pricing = PricingAdvisor::new(
            self.compute.clone(),
            self.config.region.clone(),
            self.config.subnet_id.clone(),
            ctx.counters.clone(),
        );
        let reconciler = RegistrationReconciler::new(
            self.platform.clone(),
            self.settings.poll_interval,
            self.settings.registration_timeout,
        );
        let teardown = self.teardown();

        let requested = self.config.count;
        let mut budget = RetryBudget::new(self.settings.registration_rounds);
        let mut registered: Vec<InstanceLease> = Vec::new();
        let mut pending = requested;

        info!(count = requested, strategy = %self.config.strategy, "starting fleet");

        while budget.try_consume() {
            let round = budget.attempt();
            info!(round, pending, "registration round");

            let token = self.registration_token(ctx).await?;

            let mut leases = provisioner.provision(ctx, &pricing, pending, &token).await?;
            provisioner.wait_until_running(ctx, &mut leases).await;

            let outcome = reconciler
                .wait_for_registration(&ctx.counters, &leases)
                .await;
            ctx.sync(&outcome.registered);
            ctx.sync(&outcome.unregistered);
            registered.extend(outcome.registered);

            if outcome.unregistered.is_empty() {
                let pairs: Vec<LabelInstancePair> =
                    registered.iter().map(InstanceLease::pair).collect();
                info!(registered = registered.len(), rounds = round, "fleet ready");
                return Ok(RunReport {
                    run_id: ctx.run_id,
                    base_label: ctx.base_label.clone(),
                    requested,
                    registered,
                    pairs,
                    rounds: round,
                    counters: ctx.counters.snapshot(),
                });
            }

            let stragglers: Vec<Label> = outcome
                .unregistered
                .iter()
                .map(|l| l.label.clone())
                .collect();
            if budget.is_exhausted() {
                error!(
                    rounds = budget.total(),
                    unregistered = stragglers.len(),
                    "registration retry budget exhausted"
                );
                return Err(FleetError::RegistrationBudgetExhausted {
                    rounds: budget.total(),
                    unregistered: stragglers,
                });
            }

            let ids: Vec<InstanceId> = outcome
                .unregistered
                .iter()
                .map(|l| l.instance_id.clone())
                .collect();
            warn!(count = ids.len(), "tearing down stragglers");
            // Stopped stragglers stay `Stale` so a later rollback terminates them.
            teardown.stop_by_instance_ids(&ctx.counters, &ids).await?;
            if let Err(e) = teardown.remove_registrations(&ctx.counters, &stragglers).await {
                warn!(error = %e, "failed to remove straggler registrations");
            }

            pending = ids.len();
        }

        Err(FleetError::RegistrationBudgetExhausted {
            rounds: budget.total(),
            unregistered: Vec::new(),
        })
    }

    /// Request a registration token, retrying failures after a fixed delay.
    async fn registration_token(&self, ctx: &RunContext) -> Result<String, FleetError> {
        let mut retry = RetryRounds::new(
            1,
            self.settings.token_retries,
            self.settings.token_retry_delay,
        );

        loop {
            ctx.counters.platform_request();
            match self.platform.create_registration_token().await {
                Ok(token) => return Ok(token),
                Err(e) => match retry.start_next_round() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "registration token request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(error = %e, "giving up on the registration token");
                        return Err(e.into());
                    }
                },
            }
        }
    }

    /// Terminate and deregister every live lease of the run, stopped
    /// stragglers included.
    ///
    /// Failures are logged; the caller reports its own error.
    async fn rollback(&self, ctx: &mut RunContext) {
        let live = ctx.live_leases();
        if live.is_empty() {
            info!("nothing to roll back");
            return;
        }

        let teardown = self.teardown();
        let ids: Vec<InstanceId> = live.iter().map(|l| l.instance_id.clone()).collect();
        let labels: Vec<&str> = live.iter().map(|l| l.label.as_str()).collect();

        warn!(count = ids.len(), "terminating every instance of the run");
        match teardown.terminate_by_instance_ids(&ctx.counters, &ids).await {
            Ok(()) => {
                for id in &ids {
                    ctx.set_state(id, LeaseState::Terminated);
                }
            }
            Err(e) => error!(error = %e, count = ids.len(), "rollback terminate failed"),
        }

        if let Err(e) = teardown.remove_registrations(&ctx.counters, &labels).await {
            error!(error = %e, "rollback failed to remove registrations");
        }
    }

    /// Terminate every running instance of the fleet and remove its runners.
    pub async fn stop(&self) -> Result<StopReport, FleetError> {
        self.config.validate(Mode::Stop)?;
        self.settings.validate()?;

        let ctx = RunContext::new(self.config.base_label().unwrap_or_default());
        let span = info_span!(
            "fleet_run",
            run_id = %ctx.run_id,
            base_label = %ctx.base_label,
            mode = "stop"
        );

        self.stop_fleet(&ctx).instrument(span).await
    }

    async fn stop_fleet(&self, ctx: &RunContext) -> Result<StopReport, FleetError> {
        let teardown = self.teardown();
        let filters = self.config.identifying_filters(&ctx.base_label);

        let terminated = teardown
            .terminate_by_tag_filter(&ctx.counters, &filters)
            .await?;
        let removed = teardown
            .remove_registrations(&ctx.counters, &[ctx.base_label.as_str()])
            .await?;

        info!(
            terminated = terminated.len(),
            removed = removed.len(),
            "fleet stopped"
        );
        Ok(StopReport {
            run_id: ctx.run_id,
            base_label: ctx.base_label.clone(),
            terminated,
            removed,
            counters: ctx.counters.snapshot(),
        })
    }
}
