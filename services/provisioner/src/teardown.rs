//! Instance and registration teardown.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{InstanceId, RunnerId};
use fleet_reconcile::{FailureVerdict, RetryRounds};
use tracing::{debug, error, info, warn};

use crate::compute::{ComputeProvider, Filter};
use crate::context::RunCounters;
use crate::error::{ComputeError, FleetError, PlatformError};
use crate::platform::RunnerPlatform;
use crate::registration::collect_registrations;

/// Retry shape for per-instance stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRetry {
    /// Failures in a row before a pause.
    pub ceiling: u32,
    /// Pauses allowed before giving up.
    pub rounds: u32,
    pub delay: Duration,
}

/// Removes instances and registrations.
pub struct Teardown {
    compute: Arc<dyn ComputeProvider>,
    platform: Arc<dyn RunnerPlatform>,
    stop_retry: StopRetry,
}

impl Teardown {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        platform: Arc<dyn RunnerPlatform>,
        stop_retry: StopRetry,
    ) -> Self {
        Self {
            compute,
            platform,
            stop_retry,
        }
    }

    /// Stop instances one at a time.
    ///
    /// A failed id goes to the back of the queue. After `ceiling` failures in
    /// a row the loop pauses for `delay`; once `rounds` pauses are spent the
    /// ids still queued are reported.
    pub async fn stop_by_instance_ids(
        &self,
        counters: &RunCounters,
        ids: &[InstanceId],
    ) -> Result<(), FleetError> {
        let StopRetry {
            ceiling,
            rounds,
            delay,
        } = self.stop_retry;
        let mut retry = RetryRounds::new(ceiling, rounds, delay);
        let mut queue: VecDeque<InstanceId> = ids.iter().cloned().collect();

        info!(count = ids.len(), "stopping instances");
        while let Some(id) = queue.pop_front() {
            counters.compute_request();
            match self.compute.stop_instances(std::slice::from_ref(&id)).await {
                Ok(()) => {
                    debug!(instance_id = %id, "instance stopped");
                    retry.record_success();
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "failed to stop instance");
                    queue.push_back(id);
                    match retry.record_failure() {
                        FailureVerdict::Continue => {}
                        FailureVerdict::Backoff(delay) => {
                            warn!(
                                pending = queue.len(),
                                delay_ms = delay.as_millis() as u64,
                                "retrying failed stops"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        FailureVerdict::Exhausted => {
                            error!(pending = queue.len(), "giving up stopping instances");
                            return Err(FleetError::TeardownIncomplete {
                                ids: queue.into_iter().collect(),
                                source: e,
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Terminate instances with one bulk call. Empty input is a no-op.
    pub async fn terminate_by_instance_ids(
        &self,
        counters: &RunCounters,
        ids: &[InstanceId],
    ) -> Result<(), ComputeError> {
        if ids.is_empty() {
            return Ok(());
        }
        counters.compute_request();
        self.compute.terminate_instances(ids).await?;
        info!(count = ids.len(), "instances terminated");
        Ok(())
    }

    /// Terminate every running instance matching all `filters`.
    ///
    /// Returns the terminated ids; matching nothing is not an error.
    pub async fn terminate_by_tag_filter(
        &self,
        counters: &RunCounters,
        filters: &[Filter],
    ) -> Result<Vec<InstanceId>, ComputeError> {
        let mut filters = filters.to_vec();
        filters.push(Filter::new("instance-state-name", vec!["running".to_string()]));

        let mut ids: Vec<InstanceId> = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            counters.compute_request();
            let page = self
                .compute
                .describe_instances(&filters, next_token.as_deref())
                .await
                .inspect_err(|e| error!(error = %e, "failed to describe instances by tag"))?;
            ids.extend(page.items);

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        if ids.is_empty() {
            info!("no running instances match the fleet tags");
            return Ok(ids);
        }

        counters.compute_request();
        self.compute
            .terminate_instances(&ids)
            .await
            .inspect_err(|e| error!(error = %e, count = ids.len(), "bulk terminate failed"))?;
        info!(count = ids.len(), "terminated instances by tag");
        Ok(ids)
    }

    /// Remove every registration carrying any of `labels`.
    ///
    /// Records already gone count as removed. All deletions are attempted;
    /// the first failure is returned afterwards.
    pub async fn remove_registrations<S: AsRef<str>>(
        &self,
        counters: &RunCounters,
        labels: &[S],
    ) -> Result<Vec<RunnerId>, PlatformError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }

        let found = collect_registrations(self.platform.as_ref(), counters, labels).await?;
        let ids: BTreeSet<RunnerId> = found.values().map(|record| record.id).collect();

        let mut removed = Vec::with_capacity(ids.len());
        let mut first_error: Option<PlatformError> = None;
        for id in ids {
            counters.platform_request();
            match self.platform.delete_runner(id).await {
                Ok(()) => {
                    debug!(runner_id = %id, "runner removed");
                    removed.push(id);
                }
                Err(e) if e.is_not_found() => {
                    debug!(runner_id = %id, "runner already removed");
                    removed.push(id);
                }
                Err(e) => {
                    warn!(runner_id = %id, error = %e, "failed to remove runner");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(count = removed.len(), "runner registrations removed");
                Ok(removed)
            }
        }
    }
}
