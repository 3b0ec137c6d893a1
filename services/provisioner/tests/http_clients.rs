use fleet_id::{InstanceId, RunnerId};
use fleet_provisioner::compute::{ComputeProvider, Filter, RunInstancesRequest};
use fleet_provisioner::context::RunCounters;
use fleet_provisioner::platform::RunnerPlatform;
use fleet_provisioner::registration::collect_registrations;
use fleet_provisioner::{GithubClient, HttpComputeClient, PlatformError, RepoRef};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RUNNERS_PATH: &str = "/repos/acme/widgets/actions/runners";

fn github(server: &MockServer) -> GithubClient {
    GithubClient::new(&server.uri(), "t0ken", RepoRef::parse("acme/widgets").unwrap()).unwrap()
}

fn runner_json(id: u64, labels: &[&str]) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("ip-10-0-0-{id}"),
        "os": "linux",
        "status": "online",
        "busy": false,
        "labels": labels.iter().map(|l| json!({"name": l, "type": "custom"})).collect::<Vec<_>>(),
    })
}

#[tokio::test]
async fn github_listing_is_paged_and_authenticated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RUNNERS_PATH))
        .and(query_param("per_page", "100"))
        .and(query_param("page", "1"))
        .and(header("authorization", "Bearer t0ken"))
        .and(header("x-github-api-version", "2022-11-28"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 3,
            "runners": [
                runner_json(1, &["self-hosted", "fleet01", "lbl00001"]),
                runner_json(2, &["self-hosted", "other"]),
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RUNNERS_PATH))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 3,
            "runners": [runner_json(3, &["self-hosted", "fleet01", "lbl00002"])],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = github(&server);
    let counters = RunCounters::default();
    let found = collect_registrations(&client, &counters, &["lbl00001", "lbl00002", "lbl00003"])
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found["lbl00001"].id, RunnerId::new(1));
    assert_eq!(found["lbl00002"].id, RunnerId::new(3));
}

#[tokio::test]
async fn github_registration_token_is_created_with_a_post() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{RUNNERS_PATH}/registration-token")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "token": "AABF3JGZDX3P5PMEXLND6TS6FCWO6",
            "expires_at": "2026-10-18T12:00:00Z",
        })))
        .mount(&server)
        .await;

    let token = github(&server).create_registration_token().await.unwrap();
    assert_eq!(token, "AABF3JGZDX3P5PMEXLND6TS6FCWO6");
}

#[tokio::test]
async fn github_delete_maps_missing_runners_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{RUNNERS_PATH}/7")))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{RUNNERS_PATH}/8")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .mount(&server)
        .await;

    let client = github(&server);
    client.delete_runner(RunnerId::new(7)).await.unwrap();
    let err = client.delete_runner(RunnerId::new(8)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn github_errors_carry_status_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RUNNERS_PATH))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"message": "Resource not accessible"})),
        )
        .mount(&server)
        .await;

    let err = github(&server).list_runners(1).await.unwrap_err();
    match err {
        PlatformError::Api { status, message } => {
            assert_eq!(status, 403);
            assert_eq!(message, "Resource not accessible");
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn compute(server: &MockServer) -> HttpComputeClient {
    HttpComputeClient::new(&server.uri(), Some("gw-token"), "us-east-1").unwrap()
}

fn run_request() -> RunInstancesRequest {
    RunInstancesRequest {
        image_id: "ami-1".to_string(),
        instance_type: "c5.large".to_string(),
        min_count: 1,
        max_count: 2,
        labels: Vec::new(),
        user_data: String::new(),
        subnet_id: None,
        security_group_ids: vec!["sg-1".to_string()],
        iam_instance_profile: None,
        tag_specifications: Vec::new(),
        shutdown_behavior: Some("terminate".to_string()),
        spot: None,
    }
}

#[tokio::test]
async fn compute_create_sends_region_and_reads_launch_indexes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances"))
        .and(header("x-fleet-region", "us-east-1"))
        .and(header("authorization", "Bearer gw-token"))
        .and(body_partial_json(json!({"instanceType": "c5.large", "maxCount": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {"instanceId": "i-0001", "launchIndex": 0},
                {"instanceId": "i-0002", "launchIndex": 1},
            ],
        })))
        .mount(&server)
        .await;

    let created = compute(&server).run_instances(&run_request()).await.unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1].instance_id, InstanceId::parse("i-0002").unwrap());
    assert_eq!(created[1].launch_index, 1);
}

#[tokio::test]
async fn compute_capacity_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "InsufficientInstanceCapacity",
            "message": "There is no Spot capacity available that matches your request.",
        })))
        .mount(&server)
        .await;

    let err = compute(&server)
        .run_instances(&run_request())
        .await
        .unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(err.code.as_deref(), Some("InsufficientInstanceCapacity"));
}

#[tokio::test]
async fn compute_throttling_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances/stop"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"message": "slow down"})))
        .mount(&server)
        .await;

    let err = compute(&server)
        .stop_instances(&[InstanceId::parse("i-0001").unwrap()])
        .await
        .unwrap_err();
    assert!(err.is_throttled());
}

#[tokio::test]
async fn compute_describe_forwards_filters_and_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances/describe"))
        .and(body_partial_json(json!({
            "filters": [{"name": "tag:gh-runner-label", "values": ["fleet01"]}],
            "nextToken": "page-2",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": ["i-0003"],
            "nextToken": null,
        })))
        .mount(&server)
        .await;

    let page = compute(&server)
        .describe_instances(&[Filter::tag("gh-runner-label", "fleet01")], Some("page-2"))
        .await
        .unwrap();
    assert_eq!(page.items, vec![InstanceId::parse("i-0003").unwrap()]);
    assert!(page.next_token.is_none());
}

#[tokio::test]
async fn compute_products_are_queried_for_the_ec2_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pricing/products"))
        .and(body_partial_json(json!({"serviceCode": "AmazonEC2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let page = compute(&server).on_demand_products(&[], None).await.unwrap();
    assert!(page.items.is_empty());
}
