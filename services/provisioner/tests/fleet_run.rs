use std::collections::HashSet;
use std::sync::Arc;

use fleet_id::InstanceId;
use fleet_provisioner::{
    ComputeErrorKind, FleetError, FleetRunner, ProvisionConfig, PurchasingStrategy,
};
use fleet_testing::{
    fast_settings, test_config, CreateOutcome, FakeCompute, FakeInstanceState, FakePlatform,
    TEST_BASE_LABEL,
};

fn runner(compute: &FakeCompute, platform: &FakePlatform, config: ProvisionConfig) -> FleetRunner {
    FleetRunner::new(
        Arc::new(compute.clone()),
        Arc::new(platform.clone()),
        config,
        fast_settings(),
    )
}

fn id(n: u32) -> InstanceId {
    InstanceId::parse(&format!("i-{n:08x}")).unwrap()
}

#[tokio::test]
async fn start_returns_a_pair_per_registered_runner() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new().registering_all(platform.clone());

    let report = runner(&compute, &platform, test_config(5, PurchasingStrategy::None))
        .start()
        .await
        .unwrap();

    assert_eq!(report.requested, 5);
    assert_eq!(report.rounds, 1);
    assert_eq!(report.base_label, TEST_BASE_LABEL);
    assert_eq!(report.pairs.len(), 5);
    for pair in &report.pairs {
        assert_eq!(platform.runners_with_label(pair.label.as_str()).len(), 1);
    }
    assert_eq!(platform.runners_with_label(TEST_BASE_LABEL).len(), 5);

    assert_eq!(platform.tokens_issued(), 1);
    assert_eq!(report.counters.create_attempts, 1);
    assert!(compute.stop_calls().is_empty());
    assert!(compute.terminate_calls().is_empty());
}

#[tokio::test]
async fn stragglers_are_stopped_and_replaced_with_fresh_labels() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new().with_registrar(platform.clone(), Arc::new(|n, _| n != 2));

    let report = runner(&compute, &platform, test_config(10, PurchasingStrategy::None))
        .start()
        .await
        .unwrap();

    assert_eq!(report.rounds, 2);
    assert_eq!(report.pairs.len(), 10);
    assert_eq!(compute.stop_calls(), vec![vec![id(3)]]);
    assert_eq!(platform.tokens_issued(), 2);

    let requests = compute.create_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].max_count, 1);
    let first: HashSet<_> = requests[0].labels.iter().collect();
    assert!(!first.contains(&requests[1].labels[0]));

    let paired: HashSet<_> = report.pairs.iter().map(|p| p.instance_id.clone()).collect();
    assert!(!paired.contains(&id(3)));
    assert!(paired.contains(&id(11)));
}

#[tokio::test]
async fn exhausted_registration_budget_rolls_back_the_whole_run() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new().with_registrar(platform.clone(), Arc::new(|n, _| n < 7));

    let err = runner(&compute, &platform, test_config(10, PurchasingStrategy::None))
        .start()
        .await
        .unwrap_err();

    match &err {
        FleetError::RegistrationBudgetExhausted {
            rounds,
            unregistered,
        } => {
            assert_eq!(*rounds, 5);
            assert_eq!(unregistered.len(), 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    let max_counts: Vec<u32> = compute
        .create_requests()
        .iter()
        .map(|r| r.max_count)
        .collect();
    assert_eq!(max_counts, vec![10, 3, 3, 3, 3]);

    // Round one's stragglers are stopped first, one call each.
    let stops = compute.stop_calls();
    assert_eq!(stops.len(), 12);
    assert_eq!(&stops[..3], &[vec![id(8)], vec![id(9)], vec![id(10)]]);

    // Rollback covers everything created: registered runners, the stragglers
    // stopped in earlier rounds and the last round's three.
    let terminates = compute.terminate_calls();
    assert_eq!(terminates.len(), 1);
    let terminated: HashSet<_> = terminates[0].iter().cloned().collect();
    let expected: HashSet<_> = (1..=22).map(id).collect();
    assert_eq!(terminated, expected);

    for n in 1..=22 {
        assert_eq!(
            compute.state_of(&id(n)),
            Some(FakeInstanceState::Terminated),
            "instance {n} survived the rollback"
        );
    }
    assert!(compute.running().is_empty());
    assert!(platform.runners().is_empty());
    assert_eq!(platform.deleted().len(), 7);
}

#[tokio::test]
async fn a_failed_token_request_is_retried() {
    let platform = FakePlatform::new();
    platform.fail_tokens_after(1, 1);
    let compute = FakeCompute::new().with_registrar(platform.clone(), Arc::new(|n, _| n != 2));

    let report = runner(&compute, &platform, test_config(10, PurchasingStrategy::None))
        .start()
        .await
        .unwrap();

    assert_eq!(report.rounds, 2);
    assert_eq!(report.pairs.len(), 10);
    assert_eq!(platform.token_requests(), 3);
    assert_eq!(platform.tokens_issued(), 2);
    assert!(compute.terminate_calls().is_empty());
}

#[tokio::test]
async fn token_retries_run_out_and_the_run_rolls_back() {
    let platform = FakePlatform::new();
    platform.fail_tokens_after(1, 100);
    let compute = FakeCompute::new().with_registrar(platform.clone(), Arc::new(|n, _| n != 2));

    let err = runner(&compute, &platform, test_config(10, PurchasingStrategy::None))
        .start()
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Platform(_)));
    // One good token, then a first try and three retries.
    assert_eq!(platform.token_requests(), 5);

    // The stopped straggler is terminated along with the registered runners.
    let terminates = compute.terminate_calls();
    assert_eq!(terminates.len(), 1);
    let terminated: HashSet<_> = terminates[0].iter().cloned().collect();
    assert_eq!(terminated, (1..=10).map(id).collect::<HashSet<_>>());
    assert_eq!(compute.state_of(&id(3)), Some(FakeInstanceState::Terminated));
    assert!(platform.runners().is_empty());
}

#[tokio::test]
async fn provisioning_failure_terminates_what_was_created() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new().registering_all(platform.clone());
    compute.script_creates([CreateOutcome::Partial(2)]);
    compute.script_creates([CreateOutcome::Fail(ComputeErrorKind::Throttled); 30]);

    let err = runner(&compute, &platform, test_config(10, PurchasingStrategy::None))
        .start()
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::ProvisioningExhausted { .. }));
    assert_eq!(compute.terminate_calls(), vec![vec![id(1), id(2)]]);
    assert!(compute.running().is_empty());
    assert!(platform.runners().is_empty());
}

#[tokio::test]
async fn invalid_configuration_touches_nothing() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new();

    let err = runner(&compute, &platform, test_config(0, PurchasingStrategy::None))
        .start()
        .await
        .unwrap_err();

    assert!(err.is_fatal_config());
    assert!(compute.create_requests().is_empty());
    assert_eq!(platform.tokens_issued(), 0);
}

#[tokio::test]
async fn start_without_a_label_generates_one() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new().registering_all(platform.clone());
    let config = ProvisionConfig {
        label: None,
        ..test_config(2, PurchasingStrategy::None)
    };

    let report = runner(&compute, &platform, config).start().await.unwrap();

    assert_eq!(report.base_label.len(), 8);
    assert_ne!(report.base_label, TEST_BASE_LABEL);
    assert_eq!(platform.runners_with_label(&report.base_label).len(), 2);
    assert!(report
        .pairs
        .iter()
        .all(|p| p.label.as_str() != report.base_label));
}

#[tokio::test]
async fn stop_terminates_the_fleet_and_removes_its_runners() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new();
    let tags = [("Team", "ci"), ("gh-runner-label", TEST_BASE_LABEL)];
    let a = compute.seed_instance("i-0a", &tags);
    let b = compute.seed_instance("i-0b", &tags);
    let other = compute.seed_instance("i-0c", &[("Team", "ci"), ("gh-runner-label", "other")]);
    let r1 = platform.register(&[TEST_BASE_LABEL, "lbl00001"]);
    let r2 = platform.register(&[TEST_BASE_LABEL, "lbl00002"]);
    platform.register(&["other", "lbl00003"]);

    let report = runner(&compute, &platform, test_config(1, PurchasingStrategy::None))
        .stop()
        .await
        .unwrap();

    assert_eq!(report.terminated, vec![a, b]);
    assert_eq!(report.removed, vec![r1, r2]);
    assert_eq!(compute.running(), vec![other]);
    assert_eq!(platform.runners().len(), 1);
}

#[tokio::test]
async fn stop_with_nothing_running_succeeds() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new();

    let report = runner(&compute, &platform, test_config(1, PurchasingStrategy::None))
        .stop()
        .await
        .unwrap();

    assert!(report.terminated.is_empty());
    assert!(report.removed.is_empty());
    assert!(compute.terminate_calls().is_empty());
}

#[tokio::test]
async fn stop_requires_a_label() {
    let platform = FakePlatform::new();
    let compute = FakeCompute::new();
    let config = ProvisionConfig {
        label: None,
        ..test_config(1, PurchasingStrategy::None)
    };

    let err = runner(&compute, &platform, config).stop().await.unwrap_err();
    assert!(err.is_fatal_config());
}
