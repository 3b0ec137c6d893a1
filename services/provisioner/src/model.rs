//! Shared data model: leases, strategies, quotes and runner records.

use std::collections::BTreeSet;

use fleet_id::{InstanceId, Label, RunnerId};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lifecycle of one instance within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// The provider confirmed creation.
    Requested,
    /// The provider reports the instance as running.
    Running,
    /// A worker registration carrying the lease's label was observed.
    Registered,
    /// Not registered within the timeout. The instance may have been
    /// stopped, but it still exists until terminated.
    Stale,
    /// Terminated by teardown.
    Terminated,
}

impl LeaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Requested => write!(f, "requested"),
            LeaseState::Running => write!(f, "running"),
            LeaseState::Registered => write!(f, "registered"),
            LeaseState::Stale => write!(f, "stale"),
            LeaseState::Terminated => write!(f, "terminated"),
        }
    }
}

/// One instance tied to the label it is expected to register with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceLease {
    pub label: Label,
    pub instance_id: InstanceId,
    pub state: LeaseState,
}

impl InstanceLease {
    /// A freshly created instance.
    pub fn requested(label: Label, instance_id: InstanceId) -> Self {
        Self {
            label,
            instance_id,
            state: LeaseState::Requested,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn pair(&self) -> LabelInstancePair {
        LabelInstancePair {
            label: self.label.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

/// The mapping emitted when a run succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelInstancePair {
    pub label: Label,
    pub instance_id: InstanceId,
}

/// How instances are purchased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PurchasingStrategy {
    /// Always spot, capped at the current spot price.
    SpotOnly,
    /// Spot when it is cheaper than on-demand, on-demand otherwise.
    BestEffort,
    /// The largest size whose spot price fits the base on-demand price.
    MaxPerformance,
    /// Plain on-demand.
    #[default]
    None,
}

impl PurchasingStrategy {
    pub const ALL: [PurchasingStrategy; 4] = [
        PurchasingStrategy::SpotOnly,
        PurchasingStrategy::BestEffort,
        PurchasingStrategy::MaxPerformance,
        PurchasingStrategy::None,
    ];

    /// Name used on the command line and in instance tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchasingStrategy::SpotOnly => "spotonly",
            PurchasingStrategy::BestEffort => "besteffort",
            PurchasingStrategy::MaxPerformance => "maxperformance",
            PurchasingStrategy::None => "none",
        }
    }
}

impl std::fmt::Display for PurchasingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PurchasingStrategy {
    type Err = ConfigError;

    /// Case-insensitive; `-` and `_` are ignored so `best-effort` also parses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();

        PurchasingStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| ConfigError::InvalidStrategy(s.to_string()))
    }
}

impl Serialize for PurchasingStrategy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Prices for one instance type, fetched for a single decision.
///
/// A price of `0.0` means the provider had no data, not that the instance is free.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub instance_type: String,
    pub on_demand_usd: f64,
    pub spot_usd: f64,
}

impl PriceQuote {
    pub fn on_demand_known(&self) -> bool {
        self.on_demand_usd > 0.0
    }

    pub fn spot_known(&self) -> bool {
        self.spot_usd > 0.0
    }

    /// Spot is known and strictly cheaper than a known on-demand price.
    pub fn spot_is_cheaper(&self) -> bool {
        self.on_demand_known() && self.spot_known() && self.spot_usd < self.on_demand_usd
    }
}

/// Whether the platform currently sees the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Online,
    Offline,
}

/// A worker registration as reported by the platform. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerRecord {
    pub id: RunnerId,
    pub name: String,
    pub labels: BTreeSet<String>,
    pub status: RunnerStatus,
}

impl RunnerRecord {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("spotonly", PurchasingStrategy::SpotOnly)]
    #[case("SpotOnly", PurchasingStrategy::SpotOnly)]
    #[case("best-effort", PurchasingStrategy::BestEffort)]
    #[case("BESTEFFORT", PurchasingStrategy::BestEffort)]
    #[case("max_performance", PurchasingStrategy::MaxPerformance)]
    #[case("none", PurchasingStrategy::None)]
    fn test_strategy_parse(#[case] input: &str, #[case] expected: PurchasingStrategy) {
        assert_eq!(input.parse::<PurchasingStrategy>().unwrap(), expected);
    }

    #[test]
    fn test_strategy_parse_rejects_unknown() {
        let err = "cheapest".parse::<PurchasingStrategy>().unwrap_err();
        assert_eq!(err, ConfigError::InvalidStrategy("cheapest".to_string()));
    }

    #[test]
    fn test_strategy_name_roundtrip() {
        for strategy in PurchasingStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<PurchasingStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_quote_zero_means_unknown() {
        let quote = PriceQuote {
            instance_type: "c5.large".to_string(),
            on_demand_usd: 0.0,
            spot_usd: 0.03,
        };
        assert!(!quote.on_demand_known());
        assert!(!quote.spot_is_cheaper());
    }

    #[test]
    fn test_pair_serializes_camel_case() {
        let lease = InstanceLease::requested(
            Label::parse("abcd1234").unwrap(),
            InstanceId::parse("i-001").unwrap(),
        );
        let json = serde_json::to_value(lease.pair()).unwrap();
        assert_eq!(json["label"], "abcd1234");
        assert_eq!(json["instanceId"], "i-001");
    }

    #[test]
    fn test_terminated_lease_is_not_live() {
        let mut lease = InstanceLease::requested(
            Label::parse("abcd1234").unwrap(),
            InstanceId::parse("i-001").unwrap(),
        );
        assert!(lease.is_live());
        lease.state = LeaseState::Terminated;
        assert!(!lease.is_live());
    }
}
