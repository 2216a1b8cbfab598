//! The elastic provider manager.
//!
//! Turns "more capacity for this requirement" and "less of this worker"
//! into calls on the owning provider and keeps the pending-request
//! bookkeeping consistent across providers.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use elastic_core::{CloudResources, CoreCatalog, CoreId, ElasticityConfig, MethodResources};

use crate::catalog::core_slots;
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{CloudProvider, CreationRequest, Offer, ProviderState};

/// A reduction chosen by `get_best_destruction`.
#[derive(Debug, Clone, PartialEq)]
pub struct Destruction {
    pub provider: String,
    pub worker: String,
    pub reduction: CloudResources,
    /// Task instances lost per task type.
    pub freed_slots: BTreeMap<CoreId, u32>,
}

/// How a reduction weighs against the per-task-type recommendation.
/// Compared lexicographically: fewer unrecommended task types harmed,
/// then fewer unrecommended slots destroyed, then more recommended slots
/// freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DestructionScore {
    undesired_cores: u32,
    undesired_slots: u64,
    desired_slots: Reverse<u64>,
}

fn score_reduction(
    runnable: &BTreeMap<CoreId, u32>,
    reduced: &BTreeMap<CoreId, u32>,
    recommended: &BTreeMap<CoreId, i64>,
) -> DestructionScore {
    let mut undesired_cores = 0;
    let mut undesired_slots = 0u64;
    let mut desired_slots = 0u64;
    for core_id in runnable.keys() {
        let lost = i64::from(reduced.get(core_id).copied().unwrap_or(0));
        let wanted = recommended.get(core_id).copied().unwrap_or(0);
        if wanted < 1 && lost > 0 {
            undesired_cores += 1;
            undesired_slots += lost.unsigned_abs();
        } else {
            let excess = lost - wanted;
            if excess < 0 {
                desired_slots += lost.unsigned_abs();
            } else {
                desired_slots += wanted.unsigned_abs();
                undesired_slots += excess.unsigned_abs();
            }
        }
    }
    DestructionScore {
        undesired_cores,
        undesired_slots,
        desired_slots: Reverse(desired_slots),
    }
}

/// Serializable view of the manager for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    pub min_vms: u32,
    pub max_vms: u32,
    pub current_vms: u32,
    pub pending_vms: u32,
    pub cost_per_hour: f64,
    pub providers: Vec<ProviderState>,
}

/// Every registered provider plus the fleet-wide VM limits.
#[derive(Debug)]
pub struct ElasticProviderManager {
    limits: ElasticityConfig,
    providers: BTreeMap<String, CloudProvider>,
    next_request_id: u64,
}

impl ElasticProviderManager {
    /// A manager with no providers, bounded by `limits`.
    pub fn new(limits: ElasticityConfig) -> Self {
        Self {
            limits,
            providers: BTreeMap::new(),
            next_request_id: 1,
        }
    }

    pub fn min_vms(&self) -> u32 {
        self.limits.min_vms
    }

    pub fn initial_vms(&self) -> u32 {
        self.limits.initial_vms
    }

    pub fn max_vms(&self) -> u32 {
        self.limits.max_vms
    }

    /// Add a provider. Names must be unique.
    pub fn register_provider(&mut self, provider: CloudProvider) -> ProviderResult<()> {
        if self.providers.contains_key(provider.name()) {
            return Err(ProviderError::DuplicateProvider(provider.name().to_string()));
        }
        info!(
            provider = %provider.name(),
            types = provider.instance_types().count(),
            images = provider.images().count(),
            "provider registered"
        );
        self.providers.insert(provider.name().to_string(), provider);
        Ok(())
    }

    /// The provider called `name`, or `UnknownProvider`.
    pub fn provider(&self, name: &str) -> ProviderResult<&CloudProvider> {
        self.providers
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    fn provider_mut(&mut self, name: &str) -> ProviderResult<&mut CloudProvider> {
        self.providers
            .get_mut(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    pub fn providers(&self) -> impl Iterator<Item = &CloudProvider> {
        self.providers.values()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The cheapest offer across every provider for `amount` copies of
    /// `reqs`. Equal values keep the provider registered first by name.
    pub fn best_offer(&self, amount: u32, reqs: &MethodResources, contained: bool) -> Option<Offer> {
        self.providers
            .values()
            .filter_map(|p| p.best_increase(amount, reqs, contained))
            .fold(None, |best: Option<Offer>, offer| match best {
                Some(b) if b.value <= offer.value => Some(b),
                _ => Some(offer),
            })
    }

    /// Ask for a new worker able to run `amount` copies of `reqs`.
    ///
    /// Returns `Ok(None)` when no provider can offer the shape or the
    /// chosen provider declines. Nothing is recorded unless the provider
    /// accepts.
    pub fn ask_for_resources(
        &mut self,
        amount: u32,
        reqs: &MethodResources,
        contained: bool,
        catalog: &CoreCatalog,
    ) -> ProviderResult<Option<CreationRequest>> {
        let Some(offer) = self.best_offer(amount, reqs, contained) else {
            warn!(amount, contained, "no provider offers a matching instance");
            return Ok(None);
        };
        debug!(
            provider = %offer.provider,
            instance_type = %offer.type_name,
            image = %offer.image,
            value = offer.value,
            "selected cheapest offer"
        );
        self.request_creation(&offer.provider, &offer.type_name, &offer.image, catalog)
    }

    /// Ask `provider` for one instance of `type_name` booted with `image`.
    pub fn request_creation(
        &mut self,
        provider: &str,
        type_name: &str,
        image: &str,
        catalog: &CoreCatalog,
    ) -> ProviderResult<Option<CreationRequest>> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let target = self.provider_mut(provider)?;
        if !target.can_host_more_instances() {
            debug!(%provider, "provider at its instance limit");
            return Ok(None);
        }
        let request = target.prepare_request(request_id, type_name, image, catalog)?;
        if !target.request_creation(request.clone())? {
            return Ok(None);
        }
        Ok(Some(request))
    }

    fn owner_of_request(&self, request_id: u64) -> ProviderResult<&str> {
        self.providers
            .values()
            .find(|p| p.pending_request(request_id).is_some())
            .map(CloudProvider::name)
            .ok_or(ProviderError::RequestNotPending(request_id))
    }

    /// A pending request materialized as `worker`.
    pub fn confirmed_request(
        &mut self,
        request_id: u64,
        worker: &str,
        granted: &CloudResources,
    ) -> ProviderResult<CreationRequest> {
        let owner = self.owner_of_request(request_id)?.to_string();
        self.provider_mut(&owner)?.confirmed_creation(request_id, worker, granted)
    }

    /// The provider gave up on a pending creation.
    pub fn refused_request(&mut self, request_id: u64) -> ProviderResult<CreationRequest> {
        let owner = self.owner_of_request(request_id)?.to_string();
        self.provider_mut(&owner)?.refused_creation(request_id)
    }

    /// Among every single-instance reduction of `workers`, the one that
    /// harms the recommendation least. `recommended` holds, per task type,
    /// how many simultaneous slots may go.
    pub fn get_best_destruction(
        &self,
        workers: &[String],
        recommended: &BTreeMap<CoreId, i64>,
        catalog: &CoreCatalog,
    ) -> Option<Destruction> {
        let mut best: Option<(DestructionScore, Destruction)> = None;
        for worker in workers {
            let Some(provider) = self.providers.values().find(|p| p.hosts(worker)) else {
                continue;
            };
            let Some(hosted) = provider.hosted_worker(worker) else {
                continue;
            };
            let runnable = core_slots(&hosted.base, catalog);
            for reduction in provider.possible_reductions(worker) {
                let reduced = core_slots(&reduction.base, catalog);
                let score = score_reduction(&runnable, &reduced, recommended);
                if best.as_ref().is_none_or(|(current, _)| score < *current) {
                    best = Some((
                        score,
                        Destruction {
                            provider: provider.name().to_string(),
                            worker: worker.clone(),
                            reduction,
                            freed_slots: reduced,
                        },
                    ));
                }
            }
        }
        best.map(|(_, destruction)| destruction)
    }

    /// Stop `reduction` on `worker`. Returns what is left of the worker,
    /// or `None` when it is gone. A connector failure is reported and
    /// leaves every count untouched.
    pub fn destroy_resources(
        &mut self,
        worker: &str,
        reduction: &CloudResources,
    ) -> ProviderResult<Option<CloudResources>> {
        let owner = self
            .owner_of(worker)
            .ok_or_else(|| ProviderError::UnknownVm(worker.to_string()))?
            .to_string();
        self.provider_mut(&owner)?.request_reduction(worker, reduction)
    }

    /// Stop everything on every provider. Every provider is attempted;
    /// the first failure is returned.
    pub fn terminate_all(&mut self) -> ProviderResult<()> {
        let mut first_error = None;
        for provider in self.providers.values_mut() {
            if let Err(e) = provider.terminate_all() {
                warn!(provider = %provider.name(), error = %e, "terminate_all failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Running plus pending VMs across every provider.
    pub fn current_vm_count(&self) -> u32 {
        self.providers.values().map(CloudProvider::current_vm_count).sum()
    }

    pub fn pending_vm_count(&self) -> u32 {
        self.providers.values().map(CloudProvider::pending_vm_count).sum()
    }

    pub fn pending_core_count(&self, core_id: CoreId) -> u32 {
        self.providers.values().map(|p| p.pending_core_count(core_id)).sum()
    }

    /// Creations requested but not confirmed yet, on every provider.
    pub fn pending_requests(&self) -> Vec<&CreationRequest> {
        self.providers.values().flat_map(CloudProvider::pending_requests).collect()
    }

    /// What the running and pending instances cost per hour.
    pub fn current_cost_per_hour(&self) -> f64 {
        self.providers.values().map(CloudProvider::current_cost_per_hour).sum()
    }

    /// Name of the provider hosting `worker`.
    pub fn owner_of(&self, worker: &str) -> Option<&str> {
        self.providers.values().find(|p| p.hosts(worker)).map(CloudProvider::name)
    }

    /// Serializable view for monitoring sinks.
    pub fn current_state(&self) -> ManagerState {
        ManagerState {
            min_vms: self.limits.min_vms,
            max_vms: self.limits.max_vms,
            current_vms: self.current_vm_count(),
            pending_vms: self.pending_vm_count(),
            cost_per_hour: self.current_cost_per_hour(),
            providers: self.providers.values().map(CloudProvider::current_state).collect(),
        }
    }
}
