//! Price lookups and instance size ordering.
//!
//! Prices are fetched fresh for every decision and never cached. A price of
//! `0.0` means the provider had nothing to report.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::compute::{ComputeProvider, InstanceTypeInfo, ProductFilter, SpotPriceQuery};
use crate::context::RunCounters;
use crate::error::ComputeError;
use crate::model::PriceQuote;

/// Product description used for spot price lookups.
pub const SPOT_PRODUCT_DESCRIPTION: &str = "Linux/UNIX";

/// The largest size reachable without the spot price exceeding a budget.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeChoice {
    pub instance_type: String,
    /// On-demand price of the base type the climb started from.
    pub budget_usd: f64,
}

/// Answers price and sizing questions for one region.
pub struct PricingAdvisor {
    compute: Arc<dyn ComputeProvider>,
    region: String,
    subnet_id: Option<String>,
    zone: OnceCell<Option<String>>,
    counters: Arc<RunCounters>,
}

impl PricingAdvisor {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        region: impl Into<String>,
        subnet_id: Option<String>,
        counters: Arc<RunCounters>,
    ) -> Self {
        Self {
            compute,
            region: region.into(),
            subnet_id,
            zone: OnceCell::new(),
            counters,
        }
    }

    /// Availability zone of the configured subnet, resolved once per run.
    pub async fn availability_zone(&self) -> Result<Option<String>, ComputeError> {
        let zone = self
            .zone
            .get_or_try_init(|| async {
                match &self.subnet_id {
                    Some(subnet_id) => {
                        self.counters.compute_request();
                        let zone = self.compute.subnet_availability_zone(subnet_id).await?;
                        Ok::<_, ComputeError>(Some(zone))
                    }
                    None => Ok::<_, ComputeError>(None),
                }
            })
            .await?;
        Ok(zone.clone())
    }

    /// Most recent spot price for `instance_type`, or 0 without history.
    pub async fn spot_price(
        &self,
        instance_type: &str,
        availability_zone: Option<&str>,
    ) -> Result<f64, ComputeError> {
        let query = SpotPriceQuery {
            instance_type: instance_type.to_string(),
            availability_zone: availability_zone.map(str::to_string),
            product_description: SPOT_PRODUCT_DESCRIPTION.to_string(),
            start_time: Utc::now(),
        };

        self.counters.compute_request();
        let points = self.compute.spot_price_history(&query).await?;
        let price = points
            .iter()
            .max_by_key(|point| point.timestamp)
            .map(|point| point.price_usd)
            .unwrap_or(0.0);

        debug!(instance_type, zone = ?availability_zone, price, "spot price");
        Ok(price)
    }

    /// Spot price in the configured subnet's zone.
    pub async fn spot_price_for(&self, instance_type: &str) -> Result<f64, ComputeError> {
        let zone = self.availability_zone().await?;
        self.spot_price(instance_type, zone.as_deref()).await
    }

    /// Published on-demand Linux price for the region, or 0 if not listed.
    pub async fn on_demand_price(&self, instance_type: &str) -> Result<f64, ComputeError> {
        let filters = on_demand_filters(&self.region, instance_type);
        let mut next_token: Option<String> = None;

        loop {
            self.counters.compute_request();
            let page = self
                .compute
                .on_demand_products(&filters, next_token.as_deref())
                .await?;

            if let Some(price) = find_on_demand_price(instance_type, &page.items) {
                debug!(instance_type, price, "on-demand price");
                return Ok(price);
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        debug!(instance_type, "no on-demand price listed");
        Ok(0.0)
    }

    /// Both prices for `instance_type`.
    pub async fn quote(&self, instance_type: &str) -> Result<PriceQuote, ComputeError> {
        let (on_demand_usd, spot_usd) = tokio::try_join!(
            self.on_demand_price(instance_type),
            self.spot_price_for(instance_type)
        )?;
        Ok(PriceQuote {
            instance_type: instance_type.to_string(),
            on_demand_usd,
            spot_usd,
        })
    }

    /// Non-metal sizes of `family`, smallest first.
    pub async fn instance_sizes(&self, family: &str) -> Result<Vec<String>, ComputeError> {
        let mut types = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            self.counters.compute_request();
            let page = self
                .compute
                .describe_instance_types(family, false, next_token.as_deref())
                .await?;
            types.extend(page.items);

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Ok(size_ladder(types))
    }

    /// The next size up in the same family, or `instance_type` itself if it
    /// is the largest (or not listed).
    pub async fn next_larger_size(&self, instance_type: &str) -> Result<String, ComputeError> {
        let ladder = self.instance_sizes(family_of(instance_type)).await?;
        Ok(step_up(&ladder, instance_type).to_string())
    }

    /// Climb the size ladder while the next size's spot price stays below the
    /// base type's on-demand price.
    ///
    /// Every step is compared against the on-demand price of `base_type`, not
    /// of the size reached so far.
    pub async fn best_size_within_on_demand_budget(
        &self,
        base_type: &str,
    ) -> Result<SizeChoice, ComputeError> {
        let budget_usd = self.on_demand_price(base_type).await?;
        let mut choice = SizeChoice {
            instance_type: base_type.to_string(),
            budget_usd,
        };
        if budget_usd <= 0.0 {
            return Ok(choice);
        }

        let ladder = self.instance_sizes(family_of(base_type)).await?;
        let zone = self.availability_zone().await?;

        loop {
            let next = step_up(&ladder, &choice.instance_type).to_string();
            if next == choice.instance_type {
                break;
            }

            let spot = self.spot_price(&next, zone.as_deref()).await?;
            if spot > 0.0 && spot < budget_usd {
                debug!(
                    from = %choice.instance_type,
                    to = %next,
                    spot,
                    budget_usd,
                    "size upgrade fits budget"
                );
                choice.instance_type = next;
            } else {
                break;
            }
        }

        if choice.instance_type != base_type {
            info!(base_type, chosen = %choice.instance_type, budget_usd, "upgraded instance size");
        }
        Ok(choice)
    }
}

/// `c5.large` -> `c5`.
pub fn family_of(instance_type: &str) -> &str {
    instance_type
        .split_once('.')
        .map(|(family, _)| family)
        .unwrap_or(instance_type)
}

/// Drop bare-metal sizes and sizes without a core count, then order by cores.
///
/// The sort is stable, so sizes with equal core counts keep provider order.
pub fn size_ladder(types: Vec<InstanceTypeInfo>) -> Vec<String> {
    let mut sized: Vec<(u32, String)> = types
        .into_iter()
        .filter(|info| !info.instance_type.contains("metal"))
        .filter_map(|info| info.default_cores.map(|cores| (cores, info.instance_type)))
        .collect();
    sized.sort_by_key(|(cores, _)| *cores);
    sized.into_iter().map(|(_, name)| name).collect()
}

fn step_up<'a>(ladder: &'a [String], current: &'a str) -> &'a str {
    ladder
        .iter()
        .position(|name| name == current)
        .and_then(|idx| ladder.get(idx + 1))
        .map(String::as_str)
        .unwrap_or(current)
}

/// Price list filters for a Linux on-demand instance without licensed software.
pub fn on_demand_filters(region: &str, instance_type: &str) -> Vec<ProductFilter> {
    vec![
        ProductFilter::new("ServiceCode", "AmazonEC2"),
        ProductFilter::new("regionCode", region),
        ProductFilter::new("marketoption", "OnDemand"),
        ProductFilter::new("instanceType", instance_type),
        ProductFilter::new("operatingSystem", "Linux"),
        ProductFilter::new("licenseModel", "No License required"),
        ProductFilter::new("preInstalledSw", "NA"),
    ]
}

/// Find the hourly on-demand Linux rate for `instance_type` in price list
/// documents. Documents may arrive as JSON objects or as JSON-encoded strings.
pub fn find_on_demand_price(instance_type: &str, products: &[Value]) -> Option<f64> {
    let needle = format!("on demand linux {instance_type} instance hour").to_lowercase();

    products.iter().find_map(|product| {
        let parsed;
        let product = match product {
            Value::String(raw) => {
                parsed = serde_json::from_str::<Value>(raw).ok()?;
                &parsed
            }
            other => other,
        };

        product
            .pointer("/terms/OnDemand")?
            .as_object()?
            .values()
            .filter_map(|term| term.get("priceDimensions")?.as_object())
            .flat_map(|dimensions| dimensions.values())
            .find(|dimension| {
                dimension
                    .get("description")
                    .and_then(Value::as_str)
                    .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .and_then(|dimension| dimension.pointer("/pricePerUnit/USD")?.as_str()?.parse().ok())
    })
}
