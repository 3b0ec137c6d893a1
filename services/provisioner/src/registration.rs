//! Registration reconciliation.
//!
//! Correlates leases with worker registrations by label. Every poll rebuilds
//! the registered/unregistered partition from the platform's full listing;
//! no state is carried between polls.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::{Observation, Partition, PollSchedule};
use tracing::{debug, info, warn};

use crate::context::RunCounters;
use crate::error::PlatformError;
use crate::model::{InstanceLease, LeaseState, RunnerRecord};
use crate::platform::RunnerPlatform;

/// Result of waiting for a set of leases to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// Leases whose label was seen, now in state `Registered`.
    pub registered: Vec<InstanceLease>,
    /// Stragglers, now in state `Stale`.
    pub unregistered: Vec<InstanceLease>,
    /// True if the wait ended on the deadline rather than on full registration.
    pub timed_out: bool,
    pub polls: u32,
}

impl RegistrationOutcome {
    pub fn is_complete(&self) -> bool {
        self.unregistered.is_empty()
    }
}

/// Map each requested label to the first registration carrying it.
///
/// Registrations that carry none of `labels` are ignored. Pages are read until
/// an empty page or until `total_count` records have been seen.
pub async fn collect_registrations<S: AsRef<str>>(
    platform: &dyn RunnerPlatform,
    counters: &RunCounters,
    labels: &[S],
) -> Result<BTreeMap<String, RunnerRecord>, PlatformError> {
    let wanted: HashSet<&str> = labels.iter().map(AsRef::as_ref).collect();
    let mut found: BTreeMap<String, RunnerRecord> = BTreeMap::new();
    let mut seen = 0usize;
    let mut page = 1u32;

    loop {
        counters.platform_request();
        let listing = platform.list_runners(page).await?;
        if listing.runners.is_empty() {
            break;
        }
        seen += listing.runners.len();

        for runner in listing.runners {
            for label in runner.labels.iter().filter(|l| wanted.contains(l.as_str())) {
                found
                    .entry(label.clone())
                    .or_insert_with(|| runner.clone());
            }
        }

        if seen >= listing.total_count {
            break;
        }
        page += 1;
    }

    debug!(wanted = wanted.len(), found = found.len(), pages = page, "collected registrations");
    Ok(found)
}

/// Polls the platform until every lease's label is registered or time runs out.
pub struct RegistrationReconciler {
    platform: Arc<dyn RunnerPlatform>,
    schedule: PollSchedule,
}

impl RegistrationReconciler {
    pub fn new(platform: Arc<dyn RunnerPlatform>, interval: Duration, timeout: Duration) -> Self {
        Self {
            platform,
            schedule: PollSchedule::new(interval, timeout),
        }
    }

    /// One-shot lookup of registrations by label.
    pub async fn registrations<S: AsRef<str>>(
        &self,
        counters: &RunCounters,
        labels: &[S],
    ) -> Result<BTreeMap<String, RunnerRecord>, PlatformError> {
        collect_registrations(self.platform.as_ref(), counters, labels).await
    }

    /// Wait for `leases` to register.
    ///
    /// Always returns a complete partition of the input. A failed listing
    /// counts as "nothing registered yet" for that poll.
    pub async fn wait_for_registration(
        &self,
        counters: &RunCounters,
        leases: &[InstanceLease],
    ) -> RegistrationOutcome {
        if leases.is_empty() {
            return RegistrationOutcome {
                registered: Vec::new(),
                unregistered: Vec::new(),
                timed_out: false,
                polls: 0,
            };
        }

        let labels: Vec<&str> = leases.iter().map(|l| l.label.as_str()).collect();
        let platform = self.platform.as_ref();
        let labels = labels.as_slice();

        let outcome = self
            .schedule
            .run(move || async move {
                let found = match collect_registrations(platform, counters, labels).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(
                            error = %e,
                            "failed to list registrations, treating as none registered"
                        );
                        BTreeMap::new()
                    }
                };

                let partition = Partition::split(leases.iter().cloned(), |lease| {
                    found.contains_key(lease.label.as_str())
                });
                debug!(
                    registered = partition.matched.len(),
                    pending = partition.unmatched.len(),
                    "registration poll"
                );

                if partition.status().is_converged() {
                    Observation::Converged(partition)
                } else {
                    Observation::Pending(partition)
                }
            })
            .await;

        let Partition { matched, unmatched } = outcome.value;
        let registered: Vec<InstanceLease> = matched
            .into_iter()
            .map(|lease| with_state(lease, LeaseState::Registered))
            .collect();
        let unregistered: Vec<InstanceLease> = unmatched
            .into_iter()
            .map(|lease| with_state(lease, LeaseState::Stale))
            .collect();

        if unregistered.is_empty() {
            info!(registered = registered.len(), polls = outcome.polls, "all runners registered");
        } else {
            warn!(
                registered = registered.len(),
                unregistered = unregistered.len(),
                stragglers = ?unregistered.iter().map(|l| l.label.as_str()).collect::<Vec<_>>(),
                "registration timed out"
            );
        }

        RegistrationOutcome {
            registered,
            unregistered,
            timed_out: !outcome.status.is_converged(),
            polls: outcome.polls,
        }
    }
}

fn with_state(mut lease: InstanceLease, state: LeaseState) -> InstanceLease {
    lease.state = state;
    lease
}
