//! Compute provider abstraction.
//!
//! The engine never talks to a cloud SDK directly; it drives a
//! [`ComputeProvider`], which the binary backs with [`HttpComputeClient`]
//! and tests back with an in-memory fake.

mod http;

pub use http::HttpComputeClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{InstanceId, Label};
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// A key/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Tags applied to one resource type at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSpecification {
    pub resource_type: String,
    pub tags: Vec<Tag>,
}

/// A describe filter. Values are OR-ed, filters are AND-ed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// `tag:<key>` equals `value`.
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{key}"), vec![value.into()])
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// A page with no continuation.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Spot market parameters for a create request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotMarketOptions {
    /// Maximum hourly price in USD. `None` lets the provider cap at on-demand.
    pub max_price: Option<f64>,
    pub interruption_behavior: InterruptionBehavior,
    pub one_time: bool,
}

impl SpotMarketOptions {
    /// One-time spot request that terminates on interruption.
    pub fn one_time(max_price: Option<f64>) -> Self {
        Self {
            max_price,
            interruption_behavior: InterruptionBehavior::Terminate,
            one_time: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptionBehavior {
    Terminate,
    Stop,
    Hibernate,
}

/// A request to create `min_count..=max_count` identical instances.
///
/// `labels` is positional: the instance created with launch index `i` must
/// register with `labels[i]`. The user data script reads the index from the
/// instance metadata to pick its own label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInstancesRequest {
    pub image_id: String,
    pub instance_type: String,
    pub min_count: u32,
    pub max_count: u32,
    pub labels: Vec<Label>,
    /// Base64-encoded bootstrap script.
    pub user_data: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub iam_instance_profile: Option<String>,
    pub tag_specifications: Vec<TagSpecification>,
    pub shutdown_behavior: Option<String>,
    pub spot: Option<SpotMarketOptions>,
}

impl RunInstancesRequest {
    /// Append a tag to every tag specification.
    pub fn add_tag(&mut self, key: &str, value: &str) {
        for spec in &mut self.tag_specifications {
            spec.tags.push(Tag::new(key, value));
        }
    }

    pub fn is_spot(&self) -> bool {
        self.spot.is_some()
    }
}

/// One instance confirmed by a create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedInstance {
    pub instance_id: InstanceId,
    pub launch_index: u32,
}

/// Parameters for a spot price history lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotPriceQuery {
    pub instance_type: String,
    pub availability_zone: Option<String>,
    pub product_description: String,
    pub start_time: DateTime<Utc>,
}

/// One spot price sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotPricePoint {
    pub instance_type: String,
    pub availability_zone: String,
    pub price_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Instance type metadata used to order sizes within a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeInfo {
    pub instance_type: String,
    pub default_cores: Option<u32>,
}

/// A term-match filter for the price list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilter {
    pub field: String,
    pub value: String,
}

impl ProductFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Operations the engine needs from a compute provider.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create instances. Returns the instances actually created, which may be
    /// fewer than requested when `min_count < max_count`.
    async fn run_instances(
        &self,
        request: &RunInstancesRequest,
    ) -> Result<Vec<CreatedInstance>, ComputeError>;

    /// Stop instances.
    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), ComputeError>;

    /// Terminate instances.
    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ComputeError>;

    /// List instance ids matching every filter.
    async fn describe_instances(
        &self,
        filters: &[Filter],
        next_token: Option<&str>,
    ) -> Result<Page<InstanceId>, ComputeError>;

    /// Block until every instance reports running, or fail.
    async fn wait_until_running(&self, ids: &[InstanceId]) -> Result<(), ComputeError>;

    /// Availability zone of a subnet.
    async fn subnet_availability_zone(&self, subnet_id: &str) -> Result<String, ComputeError>;

    /// Recent spot price samples.
    async fn spot_price_history(
        &self,
        query: &SpotPriceQuery,
    ) -> Result<Vec<SpotPricePoint>, ComputeError>;

    /// Instance types in a family.
    async fn describe_instance_types(
        &self,
        family: &str,
        bare_metal: bool,
        next_token: Option<&str>,
    ) -> Result<Page<InstanceTypeInfo>, ComputeError>;

    /// Raw on-demand price list entries matching the filters.
    async fn on_demand_products(
        &self,
        filters: &[ProductFilter],
        next_token: Option<&str>,
    ) -> Result<Page<serde_json::Value>, ComputeError>;
}
