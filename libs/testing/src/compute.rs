//! In-memory compute provider.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fleet_id::{InstanceId, Label};
use fleet_provisioner::compute::{
    ComputeProvider, CreatedInstance, Filter, InstanceTypeInfo, Page, ProductFilter,
    RunInstancesRequest, SpotPricePoint, SpotPriceQuery, Tag,
};
use fleet_provisioner::config::LABEL_TAG;
use fleet_provisioner::{ComputeError, ComputeErrorKind};
use serde_json::{json, Value};

use crate::platform::FakePlatform;

/// Decides whether the instance created `n`-th in the run (0-based) registers
/// with its label.
pub type Registrar = Arc<dyn Fn(usize, &Label) -> bool + Send + Sync>;

/// Scripted result of one create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Create everything requested.
    Succeed,
    /// Create at most this many.
    Partial(usize),
    /// Succeed with zero instances.
    Empty,
    /// Fail with this kind.
    Fail(ComputeErrorKind),
}

/// Lifecycle state of a fake instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeInstanceState {
    Running,
    Stopped,
    Terminated,
}

impl FakeInstanceState {
    fn as_str(&self) -> &'static str {
        match self {
            FakeInstanceState::Running => "running",
            FakeInstanceState::Stopped => "stopped",
            FakeInstanceState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone)]
struct FakeInstance {
    id: InstanceId,
    tags: Vec<Tag>,
    state: FakeInstanceState,
}

impl FakeInstance {
    fn matches(&self, filter: &Filter) -> bool {
        if filter.name == "instance-state-name" {
            return filter.values.iter().any(|v| v == self.state.as_str());
        }
        match filter.name.strip_prefix("tag:") {
            Some(key) => self
                .tags
                .iter()
                .any(|tag| tag.key == key && filter.values.contains(&tag.value)),
            None => false,
        }
    }
}

struct ComputeState {
    script: VecDeque<CreateOutcome>,
    create_requests: Vec<RunInstancesRequest>,
    instances: Vec<FakeInstance>,
    created_total: usize,
    stop_calls: Vec<Vec<InstanceId>>,
    terminate_calls: Vec<Vec<InstanceId>>,
    wait_calls: usize,
    failing_stops: u32,
    failing_waits: u32,
    failing_describes: u32,
    describe_page_size: usize,
    instance_types: Vec<InstanceTypeInfo>,
    types_page_size: usize,
    spot_prices: HashMap<String, f64>,
    on_demand_prices: HashMap<String, f64>,
    price_queries: Vec<SpotPriceQuery>,
    zone: String,
    registrar: Option<(FakePlatform, Registrar)>,
}

/// A compute provider that lives in memory. Clones share state.
#[derive(Clone)]
pub struct FakeCompute {
    state: Arc<Mutex<ComputeState>>,
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCompute {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ComputeState {
                script: VecDeque::new(),
                create_requests: Vec::new(),
                instances: Vec::new(),
                created_total: 0,
                stop_calls: Vec::new(),
                terminate_calls: Vec::new(),
                wait_calls: 0,
                failing_stops: 0,
                failing_waits: 0,
                failing_describes: 0,
                describe_page_size: 1000,
                instance_types: Vec::new(),
                types_page_size: 1000,
                spot_prices: HashMap::new(),
                on_demand_prices: HashMap::new(),
                price_queries: Vec::new(),
                zone: "us-east-1a".to_string(),
                registrar: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ComputeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue outcomes for upcoming create calls; unscripted calls succeed.
    pub fn script_creates(&self, outcomes: impl IntoIterator<Item = CreateOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Register created instances on `platform` when `registrar` says so,
    /// carrying the fleet's base label and the instance's own label.
    pub fn with_registrar(self, platform: FakePlatform, registrar: Registrar) -> Self {
        self.lock().registrar = Some((platform, registrar));
        self
    }

    /// Every created instance registers.
    pub fn registering_all(self, platform: FakePlatform) -> Self {
        self.with_registrar(platform, Arc::new(|_, _| true))
    }

    pub fn with_instance_types(self, types: &[(&str, Option<u32>)]) -> Self {
        self.lock().instance_types = types
            .iter()
            .map(|(name, cores)| InstanceTypeInfo {
                instance_type: name.to_string(),
                default_cores: *cores,
            })
            .collect();
        self
    }

    pub fn with_types_page_size(self, n: usize) -> Self {
        self.lock().types_page_size = n.max(1);
        self
    }

    pub fn with_describe_page_size(self, n: usize) -> Self {
        self.lock().describe_page_size = n.max(1);
        self
    }

    pub fn with_spot_price(self, instance_type: &str, usd: f64) -> Self {
        self.lock()
            .spot_prices
            .insert(instance_type.to_string(), usd);
        self
    }

    pub fn with_on_demand_price(self, instance_type: &str, usd: f64) -> Self {
        self.lock()
            .on_demand_prices
            .insert(instance_type.to_string(), usd);
        self
    }

    pub fn fail_next_stops(&self, n: u32) {
        self.lock().failing_stops = n;
    }

    pub fn fail_next_waits(&self, n: u32) {
        self.lock().failing_waits = n;
    }

    pub fn fail_next_describes(&self, n: u32) {
        self.lock().failing_describes = n;
    }

    /// Seed a running instance that was not created through this fake.
    pub fn seed_instance(&self, id: &str, tags: &[(&str, &str)]) -> InstanceId {
        let id = InstanceId::parse(id).unwrap_or_else(|_| panic!("invalid seeded id '{id}'"));
        self.lock().instances.push(FakeInstance {
            id: id.clone(),
            tags: tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
            state: FakeInstanceState::Running,
        });
        id
    }

    pub fn create_requests(&self) -> Vec<RunInstancesRequest> {
        self.lock().create_requests.clone()
    }

    pub fn stop_calls(&self) -> Vec<Vec<InstanceId>> {
        self.lock().stop_calls.clone()
    }

    pub fn terminate_calls(&self) -> Vec<Vec<InstanceId>> {
        self.lock().terminate_calls.clone()
    }

    pub fn wait_calls(&self) -> usize {
        self.lock().wait_calls
    }

    pub fn price_queries(&self) -> Vec<SpotPriceQuery> {
        self.lock().price_queries.clone()
    }

    pub fn state_of(&self, id: &InstanceId) -> Option<FakeInstanceState> {
        self.lock()
            .instances
            .iter()
            .find(|i| &i.id == id)
            .map(|i| i.state)
    }

    /// Ids of instances currently running.
    pub fn running(&self) -> Vec<InstanceId> {
        self.lock()
            .instances
            .iter()
            .filter(|i| i.state == FakeInstanceState::Running)
            .map(|i| i.id.clone())
            .collect()
    }

    fn set_state(&self, ids: &[InstanceId], state: FakeInstanceState) {
        let mut guard = self.lock();
        for instance in guard.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.state = state;
        }
    }
}

fn paginate<T: Clone>(items: &[T], page_size: usize, token: Option<&str>) -> Page<T> {
    let start: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
    let end = (start + page_size).min(items.len());
    let slice = items.get(start..end).unwrap_or_default().to_vec();
    Page {
        items: slice,
        next_token: (end < items.len()).then(|| end.to_string()),
    }
}

fn price_document(instance_type: &str, usd: f64) -> Value {
    json!({
        "product": {"attributes": {"instanceType": instance_type, "operatingSystem": "Linux"}},
        "terms": {
            "OnDemand": {
                "SKU.TERM": {
                    "priceDimensions": {
                        "SKU.TERM.RATE": {
                            "description": format!("${usd} per On Demand Linux {instance_type} Instance Hour"),
                            "unit": "Hrs",
                            "pricePerUnit": {"USD": usd.to_string()}
                        }
                    }
                }
            }
        }
    })
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn run_instances(
        &self,
        request: &RunInstancesRequest,
    ) -> Result<Vec<CreatedInstance>, ComputeError> {
        let (created, registrations) = {
            let mut state = self.lock();
            state.create_requests.push(request.clone());

            let wanted = request.max_count as usize;
            let count = match state.script.pop_front().unwrap_or(CreateOutcome::Succeed) {
                CreateOutcome::Succeed => wanted,
                CreateOutcome::Partial(n) => n.min(wanted),
                CreateOutcome::Empty => 0,
                CreateOutcome::Fail(kind) => {
                    let err = ComputeError::new("run_instances", kind, "scripted failure");
                    return Err(match kind {
                        ComputeErrorKind::Capacity => err.with_code("InsufficientInstanceCapacity"),
                        _ => err,
                    });
                }
            };

            let tags: Vec<Tag> = request
                .tag_specifications
                .iter()
                .find(|spec| spec.resource_type == "instance")
                .map(|spec| spec.tags.clone())
                .unwrap_or_default();
            let base_label = tags
                .iter()
                .find(|tag| tag.key == LABEL_TAG)
                .map(|tag| tag.value.clone())
                .unwrap_or_default();

            let mut created = Vec::with_capacity(count);
            let mut registrations: Vec<(String, Label)> = Vec::new();
            for launch_index in 0..count {
                state.created_total += 1;
                let ordinal = state.created_total - 1;
                let id = InstanceId::parse(&format!("i-{:08x}", state.created_total))
                    .unwrap_or_else(|_| unreachable!("generated ids are never empty"));
                state.instances.push(FakeInstance {
                    id: id.clone(),
                    tags: tags.clone(),
                    state: FakeInstanceState::Running,
                });
                created.push(CreatedInstance {
                    instance_id: id,
                    launch_index: launch_index as u32,
                });

                if let (Some((_, registrar)), Some(label)) =
                    (&state.registrar, request.labels.get(launch_index))
                {
                    if registrar(ordinal, label) {
                        registrations.push((base_label.clone(), label.clone()));
                    }
                }
            }

            let platform = state.registrar.as_ref().map(|(platform, _)| platform.clone());
            (created, platform.map(|p| (p, registrations)))
        };

        if let Some((platform, registrations)) = registrations {
            for (base_label, label) in registrations {
                platform.register(&[base_label.as_str(), label.as_str()]);
            }
        }

        Ok(created)
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), ComputeError> {
        {
            let mut state = self.lock();
            state.stop_calls.push(ids.to_vec());
            if state.failing_stops > 0 {
                state.failing_stops -= 1;
                return Err(ComputeError::new(
                    "stop_instances",
                    ComputeErrorKind::Throttled,
                    "scripted failure",
                ));
            }
        }
        self.set_state(ids, FakeInstanceState::Stopped);
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ComputeError> {
        self.lock().terminate_calls.push(ids.to_vec());
        self.set_state(ids, FakeInstanceState::Terminated);
        Ok(())
    }

    async fn describe_instances(
        &self,
        filters: &[Filter],
        next_token: Option<&str>,
    ) -> Result<Page<InstanceId>, ComputeError> {
        let mut state = self.lock();
        if state.failing_describes > 0 {
            state.failing_describes -= 1;
            return Err(ComputeError::new(
                "describe_instances",
                ComputeErrorKind::Api,
                "scripted failure",
            ));
        }
        let matching: Vec<InstanceId> = state
            .instances
            .iter()
            .filter(|instance| filters.iter().all(|f| instance.matches(f)))
            .map(|instance| instance.id.clone())
            .collect();
        Ok(paginate(&matching, state.describe_page_size, next_token))
    }

    async fn wait_until_running(&self, _ids: &[InstanceId]) -> Result<(), ComputeError> {
        let mut state = self.lock();
        state.wait_calls += 1;
        if state.failing_waits > 0 {
            state.failing_waits -= 1;
            return Err(ComputeError::new(
                "wait_until_running",
                ComputeErrorKind::Api,
                "max attempts exceeded",
            ));
        }
        Ok(())
    }

    async fn subnet_availability_zone(&self, _subnet_id: &str) -> Result<String, ComputeError> {
        Ok(self.lock().zone.clone())
    }

    async fn spot_price_history(
        &self,
        query: &SpotPriceQuery,
    ) -> Result<Vec<SpotPricePoint>, ComputeError> {
        let mut state = self.lock();
        state.price_queries.push(query.clone());
        let Some(price) = state.spot_prices.get(&query.instance_type).copied() else {
            return Ok(Vec::new());
        };

        let zone = query
            .availability_zone
            .clone()
            .unwrap_or_else(|| state.zone.clone());
        let now = Utc::now();
        // Stale sample last: picking by position instead of timestamp gets it wrong.
        Ok(vec![
            SpotPricePoint {
                instance_type: query.instance_type.clone(),
                availability_zone: zone.clone(),
                price_usd: price,
                timestamp: now,
            },
            SpotPricePoint {
                instance_type: query.instance_type.clone(),
                availability_zone: zone,
                price_usd: price * 3.0,
                timestamp: now - Duration::hours(1),
            },
        ])
    }

    async fn describe_instance_types(
        &self,
        family: &str,
        _bare_metal: bool,
        next_token: Option<&str>,
    ) -> Result<Page<InstanceTypeInfo>, ComputeError> {
        let state = self.lock();
        let prefix = format!("{family}.");
        let matching: Vec<InstanceTypeInfo> = state
            .instance_types
            .iter()
            .filter(|info| info.instance_type.starts_with(&prefix))
            .cloned()
            .collect();
        Ok(paginate(&matching, state.types_page_size, next_token))
    }

    async fn on_demand_products(
        &self,
        filters: &[ProductFilter],
        _next_token: Option<&str>,
    ) -> Result<Page<Value>, ComputeError> {
        let state = self.lock();
        let instance_type = filters
            .iter()
            .find(|f| f.field == "instanceType")
            .map(|f| f.value.as_str())
            .unwrap_or_default();

        let items = state
            .on_demand_prices
            .get(instance_type)
            .map(|usd| vec![Value::String(price_document(instance_type, *usd).to_string())])
            .unwrap_or_default();
        Ok(Page::last(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (0..5).collect();
        let first = paginate(&items, 2, None);
        assert_eq!(first.items, vec![0, 1]);
        assert_eq!(first.next_token.as_deref(), Some("2"));
        let last = paginate(&items, 2, Some("4"));
        assert_eq!(last.items, vec![4]);
        assert!(last.next_token.is_none());
    }

    #[test]
    fn test_tag_filter_matching() {
        let instance = FakeInstance {
            id: InstanceId::parse("i-1").unwrap(),
            tags: vec![Tag::new("gh-runner-label", "fleet01")],
            state: FakeInstanceState::Running,
        };
        assert!(instance.matches(&Filter::tag("gh-runner-label", "fleet01")));
        assert!(!instance.matches(&Filter::tag("gh-runner-label", "other")));
        assert!(instance.matches(&Filter::new("instance-state-name", vec!["running".into()])));
    }
}
