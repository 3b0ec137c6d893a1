//! Instance acquisition.
//!
//! The provisioner creates instances in bounded batches until enough of the
//! target exists, backing off on runs of failures and degrading to a partial
//! fleet when the total failure cap is reached first.

use std::sync::Arc;

use fleet_id::{InstanceId, Label};
use fleet_reconcile::{FailureVerdict, RetryRounds};
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::compute::{ComputeProvider, CreatedInstance, RunInstancesRequest};
use crate::config::{LaunchSpec, ProvisionConfig, RunSettings};
use crate::context::RunContext;
use crate::error::{ComputeError, ConfigError, FleetError};
use crate::model::{InstanceLease, LeaseState, PurchasingStrategy};
use crate::pricing::PricingAdvisor;
use crate::strategy::apply_strategy;
use crate::userdata::BootstrapScript;

/// Acquires instances for a run.
pub struct FleetProvisioner {
    compute: Arc<dyn ComputeProvider>,
    config: ProvisionConfig,
    launch: LaunchSpec,
    settings: RunSettings,
}

impl FleetProvisioner {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        config: ProvisionConfig,
        settings: RunSettings,
    ) -> Result<Self, ConfigError> {
        let launch = config.launch_spec()?;
        Ok(Self {
            compute,
            config,
            launch,
            settings,
        })
    }

    /// Create up to `target` instances, each tied to a fresh label.
    ///
    /// Every lease is recorded in `ctx` as soon as the provider confirms it.
    /// Returns the leases in creation order, all in state `Requested`.
    pub async fn provision(
        &self,
        ctx: &mut RunContext,
        pricing: &PricingAdvisor,
        target: usize,
        registration_token: &str,
    ) -> Result<Vec<InstanceLease>, FleetError> {
        let target = target.min(self.settings.fleet_cap);
        let mut leases: Vec<InstanceLease> = Vec::with_capacity(target);
        if target == 0 {
            return Ok(leases);
        }

        let configured = self.config.strategy;
        let mut rounds = RetryRounds::new(
            self.settings.successive_failure_ceiling,
            self.settings.attempt_rounds,
            self.settings.backoff_delay,
        );
        let mut errors: Vec<ComputeError> = Vec::new();
        let mut total_failures = 0u32;
        let mut fallback_next = false;

        info!(target, strategy = %configured, "provisioning instances");

        while (leases.len() as f64) / (target as f64) < self.settings.success_threshold
            && total_failures < self.settings.max_total_failures
        {
            let pending = target - leases.len();
            let batch = pending.min(self.settings.batch_size);
            let strategy = if fallback_next {
                PurchasingStrategy::None
            } else {
                configured
            };
            fallback_next = false;

            let labels = ctx.labels.generate(batch);
            let attempt = self
                .create_batch(ctx, pricing, &labels, strategy, registration_token)
                .await;

            let err = match attempt {
                Ok(created) if !created.is_empty() => {
                    rounds.record_success();
                    let created_count = created.len();
                    self.record_created(ctx, &labels, created, &mut leases).await;
                    info!(
                        requested = batch,
                        created = created_count,
                        total = leases.len(),
                        target,
                        %strategy,
                        "batch created"
                    );
                    continue;
                }
                Ok(_) => ComputeError::capacity("run_instances", "provider created no instances"),
                Err(e) => e,
            };

            total_failures += 1;
            warn!(
                error = %err,
                batch,
                %strategy,
                successive_failures = rounds.successive_failures() + 1,
                total_failures,
                "batch failed"
            );

            if strategy == PurchasingStrategy::BestEffort
                && err.is_capacity()
                && total_failures % 2 == 1
            {
                info!("no spot capacity, next attempt falls back to on-demand");
                fallback_next = true;
            }
            errors.push(err);

            match rounds.record_failure() {
                FailureVerdict::Continue => {}
                FailureVerdict::Backoff(delay) => {
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        round = rounds.rounds_used(),
                        "too many successive failures, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureVerdict::Exhausted => {
                    error!(total_failures, "provisioning retry rounds exhausted");
                    return Err(FleetError::ProvisioningExhausted { errors });
                }
            }
        }

        if leases.is_empty() {
            error!(target, total_failures, "no instances could be created");
            return Err(FleetError::NoCapacity {
                requested: target,
                failures: total_failures,
            });
        }

        if leases.len() < target {
            if total_failures >= self.settings.max_total_failures {
                warn!(
                    created = leases.len(),
                    target,
                    total_failures,
                    "failure cap reached, continuing with a partial fleet"
                );
            } else {
                info!(created = leases.len(), target, "success threshold reached");
            }
        }

        Ok(leases)
    }

    async fn create_batch(
        &self,
        ctx: &RunContext,
        pricing: &PricingAdvisor,
        labels: &[Label],
        strategy: PurchasingStrategy,
        registration_token: &str,
    ) -> Result<Vec<CreatedInstance>, ComputeError> {
        let request = self.base_request(ctx, labels, registration_token);
        let request = apply_strategy(request, strategy, pricing).await?;

        debug!(
            instance_type = %request.instance_type,
            max_count = request.max_count,
            spot = request.is_spot(),
            "run_instances"
        );
        ctx.counters.create_attempt();
        self.compute.run_instances(&request).await
    }

    fn base_request(
        &self,
        ctx: &RunContext,
        labels: &[Label],
        registration_token: &str,
    ) -> RunInstancesRequest {
        let repo_url = self.config.repository.html_url();
        let script = BootstrapScript {
            repo_url: &repo_url,
            registration_token,
            base_label: &ctx.base_label,
            labels,
            runner_home_dir: self.launch.runner_home_dir.as_deref(),
            pre_runner_script: self.launch.pre_runner_script.as_deref(),
        };

        RunInstancesRequest {
            image_id: self.launch.image_id.clone(),
            instance_type: self.launch.instance_type.clone(),
            min_count: 1,
            max_count: labels.len() as u32,
            labels: labels.to_vec(),
            user_data: script.encode(),
            subnet_id: self.launch.subnet_id.clone(),
            security_group_ids: vec![self.launch.security_group_id.clone()],
            iam_instance_profile: self.launch.iam_role_name.clone(),
            tag_specifications: self
                .config
                .tag_specifications(&ctx.base_label, &ctx.run_id.to_string()),
            shutdown_behavior: None,
            spot: None,
        }
    }

    /// Map created instances to their labels by launch index.
    ///
    /// An instance whose launch index has no label cannot ever register, so
    /// it is terminated right away.
    async fn record_created(
        &self,
        ctx: &mut RunContext,
        labels: &[Label],
        created: Vec<CreatedInstance>,
        leases: &mut Vec<InstanceLease>,
    ) {
        let mut orphans: Vec<InstanceId> = Vec::new();

        for instance in created {
            let label = labels.get(instance.launch_index as usize);
            match label {
                Some(label) if ctx.lease_for(label).is_none() => {
                    debug!(label = %label, instance_id = %instance.instance_id, "instance created");
                    let lease = InstanceLease::requested(label.clone(), instance.instance_id);
                    ctx.record_lease(lease.clone());
                    leases.push(lease);
                }
                _ => {
                    error!(
                        instance_id = %instance.instance_id,
                        launch_index = instance.launch_index,
                        "created instance has no usable label"
                    );
                    orphans.push(instance.instance_id);
                }
            }
        }

        if !orphans.is_empty() {
            ctx.counters.compute_request();
            if let Err(e) = self.compute.terminate_instances(&orphans).await {
                error!(
                    error = %e,
                    count = orphans.len(),
                    "failed to terminate unlabeled instances"
                );
            }
        }
    }

    /// Wait for every `Requested` lease to reach `Running`.
    ///
    /// Waits run concurrently, at most `wait_chunk_size` at a time. Only the
    /// instances whose wait failed are retried, up to `wait_retries` times.
    /// Leases still not running after the last retry keep their state.
    pub async fn wait_until_running(&self, ctx: &mut RunContext, leases: &mut [InstanceLease]) {
        let mut rounds = RetryRounds::new(
            1,
            self.settings.wait_retries,
            self.settings.wait_retry_delay,
        );

        loop {
            let pending: Vec<InstanceId> = leases
                .iter()
                .filter(|l| l.state == LeaseState::Requested)
                .map(|l| l.instance_id.clone())
                .collect();
            if pending.is_empty() {
                return;
            }

            let counters = Arc::clone(&ctx.counters);
            let counters = counters.as_ref();
            let mut failed = 0usize;
            for chunk in pending.chunks(self.settings.wait_chunk_size.max(1)) {
                let results = join_all(chunk.iter().map(|id| async move {
                    counters.compute_request();
                    let result = self.compute.wait_until_running(std::slice::from_ref(id)).await;
                    (id, result)
                }))
                .await;

                for (id, result) in results {
                    match result {
                        Ok(()) => {
                            if let Some(lease) = leases.iter_mut().find(|l| &l.instance_id == id) {
                                lease.state = LeaseState::Running;
                            }
                            ctx.set_state(id, LeaseState::Running);
                        }
                        Err(e) => {
                            warn!(instance_id = %id, error = %e, "instance did not reach running");
                            failed += 1;
                        }
                    }
                }
            }

            if failed == 0 {
                info!(count = leases.len(), "all instances running");
                return;
            }

            match rounds.start_next_round() {
                Some(delay) => {
                    warn!(failed, delay_ms = delay.as_millis() as u64, "retrying running waits");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(failed, "giving up waiting for instances to run");
                    return;
                }
            }
        }
    }
}
