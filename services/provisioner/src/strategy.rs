//! Purchasing strategy application.

use tracing::{debug, info};

use crate::compute::{RunInstancesRequest, SpotMarketOptions};
use crate::config::APPLIED_STRATEGY_TAG;
use crate::error::ComputeError;
use crate::model::PurchasingStrategy;
use crate::pricing::PricingAdvisor;

/// Instances shut down from inside the guest are terminated, not stopped.
pub const SHUTDOWN_BEHAVIOR: &str = "terminate";

/// Rewrite `request` according to `strategy`.
///
/// Only the prices a strategy needs are fetched. A zero price means the
/// provider had no data; strategies fall back to on-demand, or omit the
/// spot price cap, rather than bid zero.
pub async fn apply_strategy(
    mut request: RunInstancesRequest,
    strategy: PurchasingStrategy,
    pricing: &PricingAdvisor,
) -> Result<RunInstancesRequest, ComputeError> {
    request.shutdown_behavior = Some(SHUTDOWN_BEHAVIOR.to_string());
    request.spot = None;

    match strategy {
        PurchasingStrategy::SpotOnly => {
            let spot = pricing.spot_price_for(&request.instance_type).await?;
            request.spot = Some(SpotMarketOptions::one_time(known(spot)));
            debug!(instance_type = %request.instance_type, spot, "spot only");
        }
        PurchasingStrategy::BestEffort => {
            let quote = pricing.quote(&request.instance_type).await?;
            if quote.spot_is_cheaper() {
                request.spot = Some(SpotMarketOptions::one_time(Some(quote.on_demand_usd)));
                debug!(
                    instance_type = %request.instance_type,
                    spot = quote.spot_usd,
                    on_demand = quote.on_demand_usd,
                    "spot is cheaper, using spot market"
                );
            } else {
                info!(
                    instance_type = %request.instance_type,
                    spot = quote.spot_usd,
                    on_demand = quote.on_demand_usd,
                    "spot not cheaper or unpriced, using on-demand"
                );
            }
        }
        PurchasingStrategy::MaxPerformance => {
            let choice = pricing
                .best_size_within_on_demand_budget(&request.instance_type)
                .await?;
            request.instance_type = choice.instance_type;
            request.spot = Some(SpotMarketOptions::one_time(known(choice.budget_usd)));
        }
        PurchasingStrategy::None => {}
    }

    request.add_tag(APPLIED_STRATEGY_TAG, strategy.as_str());
    Ok(request)
}

fn known(price: f64) -> Option<f64> {
    (price > 0.0).then_some(price)
}
