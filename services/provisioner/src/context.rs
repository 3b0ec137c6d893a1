//! State owned by one run.
//!
//! Nothing here is process-wide: two runs in one process each hold their own
//! [`RunContext`], so their label namespaces and counters never mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_id::{InstanceId, Label, LabelAllocator, RunId};
use serde::Serialize;

use crate::model::{InstanceLease, LeaseState};

/// Request counters for one run.
#[derive(Debug, Default)]
pub struct RunCounters {
    compute_requests: AtomicU64,
    platform_requests: AtomicU64,
    create_attempts: AtomicU64,
}

impl RunCounters {
    pub fn compute_request(&self) {
        self.compute_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn platform_request(&self) {
        self.platform_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A create call counts as a compute request and a create attempt.
    pub fn create_attempt(&self) {
        self.compute_request();
        self.create_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            compute_requests: self.compute_requests.load(Ordering::Relaxed),
            platform_requests: self.platform_requests.load(Ordering::Relaxed),
            create_attempts: self.create_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RunCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub compute_requests: u64,
    pub platform_requests: u64,
    pub create_attempts: u64,
}

/// Run-scoped state: identity, label allocator, counters and lease ledger.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub base_label: String,
    pub labels: LabelAllocator,
    /// Shared with the pricing advisor.
    pub counters: Arc<RunCounters>,
    leases: Vec<InstanceLease>,
}

impl RunContext {
    pub fn new(base_label: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            base_label: base_label.into(),
            labels: LabelAllocator::new(),
            counters: Arc::new(RunCounters::default()),
            leases: Vec::new(),
        }
    }

    /// Record a lease as soon as the provider confirms it, so a rollback can
    /// always find it.
    pub fn record_lease(&mut self, lease: InstanceLease) {
        debug_assert!(
            !self
                .leases
                .iter()
                .any(|l| l.label == lease.label && l.is_live()),
            "label already has a live lease"
        );
        self.leases.push(lease);
    }

    /// Update the ledger entry for `instance_id`.
    pub fn set_state(&mut self, instance_id: &InstanceId, state: LeaseState) {
        if let Some(lease) = self
            .leases
            .iter_mut()
            .find(|l| &l.instance_id == instance_id)
        {
            lease.state = state;
        }
    }

    /// Sync ledger states from updated lease copies.
    pub fn sync(&mut self, leases: &[InstanceLease]) {
        for lease in leases {
            self.set_state(&lease.instance_id, lease.state);
        }
    }

    /// Leases that still hold an instance.
    pub fn live_leases(&self) -> Vec<InstanceLease> {
        self.leases.iter().filter(|l| l.is_live()).cloned().collect()
    }

    /// Every lease recorded this run, in creation order.
    pub fn leases(&self) -> &[InstanceLease] {
        &self.leases
    }

    /// The live lease holding `label`, if any.
    pub fn lease_for(&self, label: &Label) -> Option<&InstanceLease> {
        self.leases.iter().find(|l| &l.label == label && l.is_live())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(label: &str, id: &str) -> InstanceLease {
        InstanceLease::requested(Label::parse(label).unwrap(), InstanceId::parse(id).unwrap())
    }

    #[test]
    fn test_ledger_tracks_state() {
        let mut ctx = RunContext::new("fleet01");
        ctx.record_lease(lease("aaaaaaaa", "i-1"));
        ctx.record_lease(lease("bbbbbbbb", "i-2"));

        ctx.set_state(&InstanceId::parse("i-1").unwrap(), LeaseState::Terminated);
        let live = ctx.live_leases();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].instance_id.as_str(), "i-2");
        assert!(ctx.lease_for(&Label::parse("aaaaaaaa").unwrap()).is_none());
        assert_eq!(ctx.leases().len(), 2);
    }

    #[test]
    fn test_counters() {
        let ctx = RunContext::new("fleet01");
        ctx.counters.create_attempt();
        ctx.counters.compute_request();
        ctx.counters.platform_request();

        let snapshot = ctx.counters.snapshot();
        assert_eq!(snapshot.compute_requests, 2);
        assert_eq!(snapshot.create_attempts, 1);
        assert_eq!(snapshot.platform_requests, 1);
    }

    #[test]
    fn test_runs_have_independent_namespaces() {
        let mut a = RunContext::new("fleet01");
        let b = RunContext::new("fleet01");
        let labels = a.labels.generate(5);
        assert_ne!(a.run_id, b.run_id);
        assert!(labels.iter().all(|l| !b.labels.was_issued(l)));
    }
}
