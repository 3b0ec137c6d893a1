use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use fleet_provisioner::compute::Tag;
use fleet_provisioner::config::APPLIED_STRATEGY_TAG;
use fleet_provisioner::pricing::PricingAdvisor;
use fleet_provisioner::provisioner::FleetProvisioner;
use fleet_provisioner::{
    ComputeErrorKind, FleetError, LeaseState, PurchasingStrategy, RunContext, RunSettings,
};
use fleet_testing::{fast_settings, test_config, CreateOutcome, FakeCompute, TEST_BASE_LABEL};

struct Harness {
    provisioner: FleetProvisioner,
    pricing: PricingAdvisor,
    ctx: RunContext,
}

fn harness(
    compute: &FakeCompute,
    count: usize,
    strategy: PurchasingStrategy,
    settings: RunSettings,
) -> Harness {
    let ctx = RunContext::new(TEST_BASE_LABEL);
    let provisioner =
        FleetProvisioner::new(Arc::new(compute.clone()), test_config(count, strategy), settings)
            .unwrap();
    let pricing = PricingAdvisor::new(
        Arc::new(compute.clone()),
        "us-east-1",
        Some("subnet-1".to_string()),
        ctx.counters.clone(),
    );
    Harness {
        provisioner,
        pricing,
        ctx,
    }
}

fn max_counts(compute: &FakeCompute) -> Vec<u32> {
    compute
        .create_requests()
        .iter()
        .map(|r| r.max_count)
        .collect()
}

#[tokio::test]
async fn small_fleet_is_created_in_one_call() {
    let compute = FakeCompute::new();
    let mut h = harness(&compute, 10, PurchasingStrategy::None, fast_settings());

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 10, "tok")
        .await
        .unwrap();

    assert_eq!(max_counts(&compute), vec![10]);
    assert_eq!(leases.len(), 10);
    assert!(leases.iter().all(|l| l.state == LeaseState::Requested));

    let labels: HashSet<_> = leases.iter().map(|l| l.label.clone()).collect();
    assert_eq!(labels.len(), 10);
    assert_eq!(h.ctx.leases().len(), 10);
    assert_eq!(h.ctx.counters.snapshot().create_attempts, 1);
}

#[tokio::test]
async fn labels_follow_launch_order_and_reach_user_data() {
    let compute = FakeCompute::new();
    let mut h = harness(&compute, 3, PurchasingStrategy::None, fast_settings());

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 3, "REG-TOKEN-1")
        .await
        .unwrap();

    let requests = compute.create_requests();
    let request = &requests[0];
    let request_labels: Vec<_> = request.labels.iter().map(|l| l.to_string()).collect();
    let lease_labels: Vec<_> = leases.iter().map(|l| l.label.to_string()).collect();
    assert_eq!(request_labels, lease_labels);

    let script = base64::engine::general_purpose::STANDARD
        .decode(&request.user_data)
        .unwrap();
    let script = String::from_utf8(script).unwrap();
    assert!(script.contains(&format!("LABELS=({})", request_labels.join(" "))));
    assert!(script.contains("--token REG-TOKEN-1"));
    assert!(script.contains("https://github.com/acme/widgets"));

    let instance_tags = &request.tag_specifications[0].tags;
    assert!(instance_tags.contains(&Tag::new("Team", "ci")));
    assert!(instance_tags.contains(&Tag::new("gh-runner-label", TEST_BASE_LABEL)));
}

#[tokio::test]
async fn large_fleet_is_batched_until_complete() {
    let compute = FakeCompute::new();
    let settings = RunSettings {
        success_threshold: 1.0,
        ..fast_settings()
    };
    let mut h = harness(&compute, 120, PurchasingStrategy::None, settings);

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 120, "tok")
        .await
        .unwrap();

    assert_eq!(max_counts(&compute), vec![50, 50, 20]);
    assert_eq!(leases.len(), 120);
}

#[tokio::test]
async fn batching_stops_at_the_success_threshold() {
    let compute = FakeCompute::new();
    let mut h = harness(&compute, 120, PurchasingStrategy::None, fast_settings());

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 120, "tok")
        .await
        .unwrap();

    // 100 of 120 is above 0.65, so the third batch never happens.
    assert_eq!(max_counts(&compute), vec![50, 50]);
    assert_eq!(leases.len(), 100);
}

#[tokio::test]
async fn target_is_clamped_to_the_fleet_cap() {
    let compute = FakeCompute::new();
    let settings = RunSettings {
        success_threshold: 1.0,
        fleet_cap: 60,
        ..fast_settings()
    };
    let mut h = harness(&compute, 60, PurchasingStrategy::None, settings);

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 1000, "tok")
        .await
        .unwrap();

    assert_eq!(leases.len(), 60);
    assert_eq!(max_counts(&compute), vec![50, 10]);
}

#[tokio::test]
async fn partial_batch_requests_only_the_remainder() {
    let compute = FakeCompute::new();
    compute.script_creates([CreateOutcome::Partial(5)]);
    let mut h = harness(&compute, 10, PurchasingStrategy::None, fast_settings());

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 10, "tok")
        .await
        .unwrap();

    assert_eq!(max_counts(&compute), vec![10, 5]);
    assert_eq!(leases.len(), 10);

    let requests = compute.create_requests();
    let first: HashSet<_> = requests[0].labels.iter().collect();
    assert!(requests[1].labels.iter().all(|l| !first.contains(l)));
}

#[tokio::test]
async fn empty_create_counts_as_a_failure() {
    let compute = FakeCompute::new();
    compute.script_creates([CreateOutcome::Empty]);
    let mut h = harness(&compute, 3, PurchasingStrategy::None, fast_settings());

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 3, "tok")
        .await
        .unwrap();

    assert_eq!(max_counts(&compute), vec![3, 3]);
    assert_eq!(leases.len(), 3);
}

#[tokio::test]
async fn best_effort_falls_back_to_on_demand_after_capacity_failure() {
    let compute = FakeCompute::new()
        .with_spot_price("c5.large", 0.05)
        .with_on_demand_price("c5.large", 0.10);
    compute.script_creates([CreateOutcome::Fail(ComputeErrorKind::Capacity)]);
    let mut h = harness(&compute, 4, PurchasingStrategy::BestEffort, fast_settings());

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 4, "tok")
        .await
        .unwrap();
    assert_eq!(leases.len(), 4);

    let requests = compute.create_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].is_spot());
    assert!(!requests[1].is_spot());

    let tags = &requests[1].tag_specifications[0].tags;
    assert!(tags.contains(&Tag::new(APPLIED_STRATEGY_TAG, "none")));
}

#[tokio::test]
async fn fallback_happens_on_odd_failures_only() {
    let compute = FakeCompute::new()
        .with_spot_price("c5.large", 0.05)
        .with_on_demand_price("c5.large", 0.10);
    compute.script_creates([CreateOutcome::Fail(ComputeErrorKind::Capacity); 3]);
    let mut h = harness(&compute, 2, PurchasingStrategy::BestEffort, fast_settings());

    h.provisioner
        .provision(&mut h.ctx, &h.pricing, 2, "tok")
        .await
        .unwrap();

    // The second failure comes from the on-demand request, so the third
    // attempt is spot again.
    let spot: Vec<bool> = compute
        .create_requests()
        .iter()
        .map(|r| r.is_spot())
        .collect();
    assert_eq!(spot, vec![true, false, true, false]);
}

#[tokio::test]
async fn failure_cap_degrades_to_a_partial_fleet() {
    let compute = FakeCompute::new();
    compute.script_creates([
        CreateOutcome::Partial(2),
        CreateOutcome::Fail(ComputeErrorKind::Api),
        CreateOutcome::Fail(ComputeErrorKind::Api),
        CreateOutcome::Fail(ComputeErrorKind::Api),
    ]);
    let settings = RunSettings {
        max_total_failures: 3,
        successive_failure_ceiling: 10,
        ..fast_settings()
    };
    let mut h = harness(&compute, 10, PurchasingStrategy::None, settings);

    let leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 10, "tok")
        .await
        .unwrap();

    assert_eq!(leases.len(), 2);
    assert_eq!(compute.create_requests().len(), 4);
}

#[tokio::test]
async fn successive_failures_exhaust_retry_rounds() {
    let compute = FakeCompute::new();
    compute.script_creates([CreateOutcome::Fail(ComputeErrorKind::Throttled); 30]);
    let mut h = harness(&compute, 5, PurchasingStrategy::None, fast_settings());

    let err = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 5, "tok")
        .await
        .unwrap_err();

    // Ceiling 5, three backoff rounds: the 20th failure in a row gives up.
    match err {
        FleetError::ProvisioningExhausted { errors } => {
            assert_eq!(errors.len(), 20);
            assert!(errors.iter().all(|e| e.is_throttled()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(compute.create_requests().len(), 20);
}

#[tokio::test]
async fn no_instances_at_all_is_no_capacity() {
    let compute = FakeCompute::new();
    compute.script_creates([CreateOutcome::Empty; 2]);
    let settings = RunSettings {
        max_total_failures: 2,
        successive_failure_ceiling: 10,
        ..fast_settings()
    };
    let mut h = harness(&compute, 5, PurchasingStrategy::None, settings);

    let err = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 5, "tok")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FleetError::NoCapacity {
            requested: 5,
            failures: 2
        }
    ));
}

#[tokio::test]
async fn failed_waits_are_retried_for_those_instances_only() {
    let compute = FakeCompute::new();
    compute.fail_next_waits(2);
    let mut h = harness(&compute, 3, PurchasingStrategy::None, fast_settings());

    let mut leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 3, "tok")
        .await
        .unwrap();
    h.provisioner
        .wait_until_running(&mut h.ctx, &mut leases)
        .await;

    assert_eq!(compute.wait_calls(), 5);
    assert!(leases.iter().all(|l| l.state == LeaseState::Running));
    assert!(h
        .ctx
        .leases()
        .iter()
        .all(|l| l.state == LeaseState::Running));
}

#[tokio::test]
async fn waits_give_up_after_the_last_retry() {
    let compute = FakeCompute::new();
    compute.fail_next_waits(100);
    let mut h = harness(&compute, 2, PurchasingStrategy::None, fast_settings());

    let mut leases = h
        .provisioner
        .provision(&mut h.ctx, &h.pricing, 2, "tok")
        .await
        .unwrap();
    h.provisioner
        .wait_until_running(&mut h.ctx, &mut leases)
        .await;

    // One attempt plus three retries, two instances each.
    assert_eq!(compute.wait_calls(), 8);
    assert!(leases.iter().all(|l| l.state == LeaseState::Requested));
}
