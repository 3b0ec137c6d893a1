//! JSON gateway client for the compute provider.

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::InstanceId;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    ComputeProvider, CreatedInstance, Filter, InstanceTypeInfo, Page, ProductFilter,
    RunInstancesRequest, SpotPricePoint, SpotPriceQuery,
};
use crate::error::{ComputeError, ComputeErrorKind};

/// Header carrying the target region on every gateway request.
const REGION_HEADER: &str = "x-fleet-region";

/// Provider error codes that mean "no capacity for this request".
const CAPACITY_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientCapacity",
    "SpotMaxPriceTooLow",
    "MaxSpotInstanceCountExceeded",
];

/// Provider error codes that mean "slow down".
const THROTTLE_CODES: &[&str] = &["RequestLimitExceeded", "Throttling", "ThrottlingException"];

/// Compute provider reached through an HTTP/JSON gateway.
#[derive(Debug, Clone)]
pub struct HttpComputeClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpComputeClient {
    /// Create a client for `base_url`, scoped to `region`.
    pub fn new(base_url: &str, token: Option<&str>, region: &str) -> Result<Self, ComputeError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(REGION_HEADER),
            HeaderValue::from_str(region).map_err(|e| {
                ComputeError::new(
                    "client",
                    ComputeErrorKind::Transport,
                    format!("invalid region: {e}"),
                )
            })?,
        );

        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                    ComputeError::new(
                        "client",
                        ComputeErrorKind::Transport,
                        format!("invalid token: {e}"),
                    )
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                ComputeError::new(
                    "client",
                    ComputeErrorKind::Transport,
                    format!("failed to build HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, T>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, ComputeError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(operation, path, "compute request");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;
        handle_response(operation, response).await
    }

    async fn post_empty<B>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<(), ComputeError>
    where
        B: Serialize + ?Sized,
    {
        debug!(operation, path, "compute request");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(operation, response).await)
        }
    }
}

async fn handle_response<T: DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, ComputeError> {
    if response.status().is_success() {
        response.json().await.map_err(|e| {
            ComputeError::new(
                operation,
                ComputeErrorKind::Api,
                format!("failed to parse response: {e}"),
            )
        })
    } else {
        Err(handle_error(operation, response).await)
    }
}

async fn handle_error(operation: &'static str, response: reqwest::Response) -> ComputeError {
    let status = response.status();
    let body: GatewayErrorBody = response.json().await.unwrap_or_else(|_| GatewayErrorBody {
        code: None,
        message: format!("HTTP {status}"),
    });

    let kind = classify(status, body.code.as_deref());
    warn!(operation, status = %status, code = ?body.code, ?kind, "compute request failed");

    let err = ComputeError::new(operation, kind, body.message);
    match body.code {
        Some(code) => err.with_code(code),
        None => err,
    }
}

/// Map an HTTP status and provider error code onto an error kind.
fn classify(status: StatusCode, code: Option<&str>) -> ComputeErrorKind {
    if let Some(code) = code {
        if CAPACITY_CODES.contains(&code) {
            return ComputeErrorKind::Capacity;
        }
        if THROTTLE_CODES.contains(&code) {
            return ComputeErrorKind::Throttled;
        }
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => ComputeErrorKind::Throttled,
        StatusCode::NOT_FOUND => ComputeErrorKind::NotFound,
        _ => ComputeErrorKind::Api,
    }
}

fn transport(operation: &'static str, err: reqwest::Error) -> ComputeError {
    ComputeError::new(operation, ComputeErrorKind::Transport, err.to_string())
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceIdsBody<'a> {
    instance_ids: &'a [InstanceId],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeBody<'a> {
    filters: &'a [Filter],
    next_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceTypesBody<'a> {
    family: &'a str,
    bare_metal: bool,
    next_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProductsBody<'a> {
    service_code: &'static str,
    filters: &'a [ProductFilter],
    next_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RunInstancesResponse {
    instances: Vec<CreatedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubnetResponse {
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
struct SpotPriceResponse {
    prices: Vec<SpotPricePoint>,
}

#[async_trait]
impl ComputeProvider for HttpComputeClient {
    async fn run_instances(
        &self,
        request: &RunInstancesRequest,
    ) -> Result<Vec<CreatedInstance>, ComputeError> {
        let response: RunInstancesResponse =
            self.post("run_instances", "/instances", request).await?;
        Ok(response.instances)
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), ComputeError> {
        self.post_empty("stop_instances", "/instances/stop", &InstanceIdsBody { instance_ids: ids })
            .await
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ComputeError> {
        self.post_empty(
            "terminate_instances",
            "/instances/terminate",
            &InstanceIdsBody { instance_ids: ids },
        )
        .await
    }

    async fn describe_instances(
        &self,
        filters: &[Filter],
        next_token: Option<&str>,
    ) -> Result<Page<InstanceId>, ComputeError> {
        self.post(
            "describe_instances",
            "/instances/describe",
            &DescribeBody { filters, next_token },
        )
        .await
    }

    async fn wait_until_running(&self, ids: &[InstanceId]) -> Result<(), ComputeError> {
        self.post_empty(
            "wait_until_running",
            "/instances/wait-running",
            &InstanceIdsBody { instance_ids: ids },
        )
        .await
    }

    async fn subnet_availability_zone(&self, subnet_id: &str) -> Result<String, ComputeError> {
        let operation = "describe_subnet";
        let response = self
            .client
            .get(self.url(&format!("/subnets/{subnet_id}")))
            .send()
            .await
            .map_err(|e| transport(operation, e))?;
        let subnet: SubnetResponse = handle_response(operation, response).await?;
        Ok(subnet.availability_zone)
    }

    async fn spot_price_history(
        &self,
        query: &SpotPriceQuery,
    ) -> Result<Vec<SpotPricePoint>, ComputeError> {
        let response: SpotPriceResponse = self
            .post("spot_price_history", "/spot-price-history", query)
            .await?;
        Ok(response.prices)
    }

    async fn describe_instance_types(
        &self,
        family: &str,
        bare_metal: bool,
        next_token: Option<&str>,
    ) -> Result<Page<InstanceTypeInfo>, ComputeError> {
        self.post(
            "describe_instance_types",
            "/instance-types",
            &InstanceTypesBody {
                family,
                bare_metal,
                next_token,
            },
        )
        .await
    }

    async fn on_demand_products(
        &self,
        filters: &[ProductFilter],
        next_token: Option<&str>,
    ) -> Result<Page<serde_json::Value>, ComputeError> {
        self.post(
            "get_products",
            "/pricing/products",
            &ProductsBody {
                service_code: "AmazonEC2",
                filters,
                next_token,
            },
        )
        .await
    }
}
