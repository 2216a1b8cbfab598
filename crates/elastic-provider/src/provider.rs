//! One elastic provider: its catalog, its connector and the machines it
//! has started or been asked to start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use elastic_core::{CloudResources, CoreCatalog, CoreId, MethodResources, Timestamp};

use crate::catalog::{core_slots, Image, InstanceType};
use crate::connector::ProviderConnector;
use crate::error::{ProviderError, ProviderResult};

/// A creation the provider accepted but that has not materialized yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationRequest {
    pub id: u64,
    pub provider: String,
    pub type_name: String,
    pub image: String,
    pub description: CloudResources,
    /// Task instances the new worker will run at once, per task type.
    pub core_slots: BTreeMap<CoreId, u32>,
    #[serde(skip, default = "Instant::now")]
    pub requested_at: Instant,
}

impl CreationRequest {
    /// Instances this request starts.
    pub fn vm_count(&self) -> u32 {
        self.description.vm_count()
    }

    /// Milliseconds since the request was sent.
    pub fn elapsed_ms(&self) -> Timestamp {
        Timestamp::try_from(self.requested_at.elapsed().as_millis()).unwrap_or(Timestamp::MAX)
    }
}

/// The cheapest shape a provider can start for a requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub provider: String,
    pub type_name: String,
    pub image: String,
    /// Copies of the requirement one instance runs at once.
    pub slots: u32,
    /// Cost per hour of one instance.
    pub value: f64,
}

/// Serializable view of a provider for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderState {
    pub name: String,
    pub limit: Option<u32>,
    pub current_vms: u32,
    pub pending_requests: Vec<u64>,
    pub pending_cores: BTreeMap<CoreId, u32>,
    pub hosted_workers: Vec<String>,
    pub cost_per_hour: f64,
}

/// One elastic provider: what it offers, what it hosts and what it
/// has been asked to start.
#[derive(Debug)]
pub struct CloudProvider {
    name: String,
    limit: Option<u32>,
    types: BTreeMap<String, InstanceType>,
    images: BTreeMap<String, Image>,
    connector: Arc<dyn ProviderConnector>,
    /// Running plus pending VMs.
    current_vms: u32,
    pending: BTreeMap<u64, CreationRequest>,
    pending_cores: BTreeMap<CoreId, u32>,
    hosted: BTreeMap<String, CloudResources>,
}

impl CloudProvider {
    /// An empty offer behind `connector`. `limit` caps its instance count.
    pub fn new(name: &str, limit: Option<u32>, connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            name: name.to_string(),
            limit,
            types: BTreeMap::new(),
            images: BTreeMap::new(),
            connector,
            current_vms: 0,
            pending: BTreeMap::new(),
            pending_cores: BTreeMap::new(),
            hosted: BTreeMap::new(),
        }
    }

    pub fn with_instance_type(mut self, instance_type: InstanceType) -> Self {
        self.add_instance_type(instance_type);
        self
    }

    pub fn with_image(mut self, image: Image) -> Self {
        self.add_image(image);
        self
    }

    pub fn add_instance_type(&mut self, instance_type: InstanceType) {
        self.types.insert(instance_type.name.clone(), instance_type);
    }

    pub fn add_image(&mut self, image: Image) {
        self.images.insert(image.name.clone(), image);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// The instance type called `type_name`.
    pub fn instance_type(&self, type_name: &str) -> ProviderResult<&InstanceType> {
        self.types.get(type_name).ok_or_else(|| ProviderError::UnknownType {
            provider: self.name.clone(),
            type_name: type_name.to_string(),
        })
    }

    /// The image called `image`.
    pub fn image(&self, image: &str) -> ProviderResult<&Image> {
        self.images.get(image).ok_or_else(|| ProviderError::UnknownImage {
            provider: self.name.clone(),
            image: image.to_string(),
        })
    }

    pub fn instance_types(&self) -> impl Iterator<Item = &InstanceType> {
        self.types.values()
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    /// Running plus pending instances.
    pub fn current_vm_count(&self) -> u32 {
        self.current_vms
    }

    pub fn pending_vm_count(&self) -> u32 {
        self.pending.values().map(CreationRequest::vm_count).sum()
    }

    /// Instances of `core_id` the pending creations will run at once.
    pub fn pending_core_count(&self, core_id: CoreId) -> u32 {
        self.pending_cores.get(&core_id).copied().unwrap_or(0)
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &CreationRequest> {
        self.pending.values()
    }

    /// The pending creation with id `request_id`.
    pub fn pending_request(&self, request_id: u64) -> Option<&CreationRequest> {
        self.pending.get(&request_id)
    }

    /// Whether `worker` runs on this provider.
    pub fn hosts(&self, worker: &str) -> bool {
        self.hosted.contains_key(worker)
    }

    /// What this provider runs for `worker`.
    pub fn hosted_worker(&self, worker: &str) -> Option<&CloudResources> {
        self.hosted.get(worker)
    }

    pub fn hosted_workers(&self) -> impl Iterator<Item = (&String, &CloudResources)> {
        self.hosted.iter()
    }

    /// Whether the provider limit leaves room for one more instance.
    pub fn can_host_more_instances(&self) -> bool {
        match self.limit {
            None => true,
            Some(limit) => self.current_vms < limit,
        }
    }

    /// Cost per hour of one instance of `type_name` booted with `image`.
    pub fn instance_cost_per_hour(&self, type_name: &str, image: &str) -> ProviderResult<f64> {
        Ok(self.instance_type(type_name)?.price_per_hour + self.image(image)?.price_per_hour)
    }

    /// Cost per hour of everything this provider currently runs.
    pub fn current_cost_per_hour(&self) -> f64 {
        self.hosted
            .values()
            .map(|cloud| {
                let image_price = self.images.get(&cloud.image).map_or(0.0, |i| i.price_per_hour);
                cloud
                    .composition
                    .iter()
                    .map(|(type_name, component)| {
                        let type_price = self.types.get(type_name).map_or(0.0, |t| t.price_per_hour);
                        f64::from(component.count) * (type_price + image_price)
                    })
                    .sum::<f64>()
            })
            .sum()
    }

    /// One instance of `type_name` booted with `image`, as a worker
    /// composition.
    pub fn compose(&self, type_name: &str, image: &str) -> ProviderResult<CloudResources> {
        let instance_type = self.instance_type(type_name)?;
        let image = self.image(image)?;
        Ok(CloudResources::of_type(
            &self.name,
            &image.name,
            &instance_type.name,
            &image.apply(&instance_type.resources),
            1,
        ))
    }

    /// The instance shape that best matches `amount` copies of `reqs`.
    ///
    /// With `contained` the smallest shape hosting at least `amount` copies
    /// wins; otherwise the largest shape hosting at most `amount` copies.
    /// Ties go to the cheaper shape. The image is the first one (by name)
    /// whose software and OS satisfy `reqs`.
    pub fn best_increase(&self, amount: u32, reqs: &MethodResources, contained: bool) -> Option<Offer> {
        if !self.can_host_more_instances() {
            debug!(provider = %self.name, "provider at its instance limit");
            return None;
        }

        let mut best: Option<(&InstanceType, &Image, u32, i64)> = None;
        for instance_type in self.types.values() {
            let Some(image) = self
                .images
                .values()
                .find(|image| image.apply(&instance_type.resources).can_host_static(reqs))
            else {
                continue;
            };
            let slots = image.apply(&instance_type.resources).capacity.fit_count(&reqs.capacity);
            if slots == 0 {
                continue;
            }
            let distance = i64::from(slots) - i64::from(amount);
            if (contained && distance < 0) || (!contained && distance > 0) {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, _, _, best_distance)) => {
                    let closer = if contained {
                        distance < best_distance
                    } else {
                        distance > best_distance
                    };
                    closer || (distance == best_distance && instance_type.price_per_hour < current.price_per_hour)
                }
            };
            if better {
                best = Some((instance_type, image, slots, distance));
            }
        }

        let Some((instance_type, image, slots, _)) = best else {
            debug!(provider = %self.name, amount, contained, "no instance type matches");
            return None;
        };
        Some(Offer {
            provider: self.name.clone(),
            type_name: instance_type.name.clone(),
            image: image.name.clone(),
            slots,
            value: instance_type.price_per_hour + image.price_per_hour,
        })
    }

    /// Build (but do not submit) a creation request for one instance.
    pub fn prepare_request(
        &self,
        request_id: u64,
        type_name: &str,
        image: &str,
        catalog: &CoreCatalog,
    ) -> ProviderResult<CreationRequest> {
        let description = self.compose(type_name, image)?;
        let core_slots = core_slots(&description.base, catalog);
        Ok(CreationRequest {
            id: request_id,
            provider: self.name.clone(),
            type_name: type_name.to_string(),
            image: image.to_string(),
            description,
            core_slots,
            requested_at: Instant::now(),
        })
    }

    /// Ask the connector to start `request`. Nothing is recorded unless the
    /// connector accepts.
    pub fn request_creation(&mut self, request: CreationRequest) -> ProviderResult<bool> {
        let accepted = match self.connector.turn_on(&request) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(provider = %self.name, request = request.id, error = %e, "creation call failed");
                return Err(e.into());
            }
        };
        if !accepted {
            info!(provider = %self.name, request = request.id, "creation declined");
            return Ok(false);
        }

        self.current_vms += request.vm_count();
        for (core_id, slots) in &request.core_slots {
            *self.pending_cores.entry(*core_id).or_insert(0) += slots;
        }
        info!(
            provider = %self.name,
            request = request.id,
            instance_type = %request.type_name,
            image = %request.image,
            "creation requested"
        );
        self.pending.insert(request.id, request);
        Ok(true)
    }

    fn take_pending(&mut self, request_id: u64) -> ProviderResult<CreationRequest> {
        let request = self
            .pending
            .remove(&request_id)
            .ok_or(ProviderError::RequestNotPending(request_id))?;
        for (core_id, slots) in &request.core_slots {
            if let Some(pending) = self.pending_cores.get_mut(core_id) {
                *pending = pending.saturating_sub(*slots);
                if *pending == 0 {
                    self.pending_cores.remove(core_id);
                }
            }
        }
        Ok(request)
    }

    /// The provider could not start a pending request.
    pub fn refused_creation(&mut self, request_id: u64) -> ProviderResult<CreationRequest> {
        let request = self.take_pending(request_id)?;
        self.current_vms = self.current_vms.saturating_sub(request.vm_count());
        info!(provider = %self.name, request = request_id, "creation refused");
        Ok(request)
    }

    /// A pending request materialized as (part of) `worker`. `granted` is
    /// what was actually started, which may differ from what was asked.
    pub fn confirmed_creation(
        &mut self,
        request_id: u64,
        worker: &str,
        granted: &CloudResources,
    ) -> ProviderResult<CreationRequest> {
        let request = self.take_pending(request_id)?;
        self.current_vms = self.current_vms.saturating_sub(request.vm_count()) + granted.vm_count();
        self.hosted
            .entry(worker.to_string())
            .and_modify(|hosted| hosted.increase(granted))
            .or_insert_with(|| granted.clone());
        info!(provider = %self.name, request = request_id, %worker, vms = granted.vm_count(), "creation confirmed");
        Ok(request)
    }

    /// Single-instance reductions `worker` could undergo.
    pub fn possible_reductions(&self, worker: &str) -> Vec<CloudResources> {
        self.hosted
            .get(worker)
            .map(CloudResources::possible_reductions)
            .unwrap_or_default()
    }

    /// Stop `reduction` on `worker`. Returns what is left of the worker,
    /// or `None` when it is gone. A connector failure changes nothing.
    pub fn request_reduction(
        &mut self,
        worker: &str,
        reduction: &CloudResources,
    ) -> ProviderResult<Option<CloudResources>> {
        if !self.hosted.contains_key(worker) {
            return Err(ProviderError::UnknownVm(worker.to_string()));
        }
        if let Err(e) = self.connector.turn_off(worker, reduction) {
            warn!(provider = %self.name, %worker, error = %e, "reduction call failed");
            return Err(e.into());
        }

        let Some(hosted) = self.hosted.get_mut(worker) else {
            return Err(ProviderError::UnknownVm(worker.to_string()));
        };
        let before = hosted.vm_count();
        hosted.reduce(reduction);
        let removed = before - hosted.vm_count();
        self.current_vms = self.current_vms.saturating_sub(removed);
        info!(provider = %self.name, %worker, vms = removed, "reduction requested");

        if hosted.is_empty() {
            self.hosted.remove(worker);
            return Ok(None);
        }
        Ok(Some(hosted.clone()))
    }

    /// Stop every instance and forget every pending creation.
    pub fn terminate_all(&mut self) -> ProviderResult<()> {
        self.connector.terminate_all()?;
        self.hosted.clear();
        self.pending.clear();
        self.pending_cores.clear();
        self.current_vms = 0;
        info!(provider = %self.name, "all instances terminated");
        Ok(())
    }

    /// Serializable view for monitoring sinks.
    pub fn current_state(&self) -> ProviderState {
        ProviderState {
            name: self.name.clone(),
            limit: self.limit,
            current_vms: self.current_vms,
            pending_requests: self.pending.keys().copied().collect(),
            pending_cores: self.pending_cores.clone(),
            hosted_workers: self.hosted.keys().cloned().collect(),
            cost_per_hour: self.current_cost_per_hour(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorCall, ConnectorError, LoopbackConnector};
    use elastic_core::{Capacity, ResourceDescription};

    #[derive(Debug)]
    struct BrokenConnector;

    impl ProviderConnector for BrokenConnector {
        fn turn_on(&self, _request: &CreationRequest) -> Result<bool, ConnectorError> {
            Err(ConnectorError::new("broken", "api unreachable"))
        }

        fn turn_off(&self, _worker: &str, _reduction: &CloudResources) -> Result<(), ConnectorError> {
            Err(ConnectorError::new("broken", "api unreachable"))
        }

        fn terminate_all(&self) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn make_provider(connector: Arc<dyn ProviderConnector>, limit: Option<u32>) -> CloudProvider {
        CloudProvider::new("aws", limit, connector)
            .with_instance_type(InstanceType::new("small", MethodResources::new(Capacity::cpus(2)), 0.10))
            .with_instance_type(InstanceType::new("medium", MethodResources::new(Capacity::cpus(4)), 0.20))
            .with_instance_type(InstanceType::new("large", MethodResources::new(Capacity::cpus(8)), 0.40))
            .with_image(Image::new("ubuntu").with_os("linux").with_creation_time(60_000))
    }

    fn cpu_catalog() -> CoreCatalog {
        let mut catalog = CoreCatalog::new();
        let core = catalog.register_core("work");
        catalog
            .add_implementations(core, vec![("work".into(), ResourceDescription::cpus(1))])
            .unwrap();
        catalog
    }

    #[test]
    fn contained_picks_smallest_type_that_fits() {
        let provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None);
        let offer = provider
            .best_increase(3, &MethodResources::new(Capacity::cpus(1)), true)
            .unwrap();
        assert_eq!(offer.type_name, "medium");
        assert_eq!(offer.slots, 4);
    }

    #[test]
    fn containing_picks_largest_type_within_amount() {
        let provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None);
        let offer = provider
            .best_increase(5, &MethodResources::new(Capacity::cpus(1)), false)
            .unwrap();
        assert_eq!(offer.type_name, "medium");
        assert_eq!(offer.image, "ubuntu");
    }

    #[test]
    fn ties_go_to_the_cheaper_type() {
        let provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None).with_instance_type(
            InstanceType::new("medium-spot", MethodResources::new(Capacity::cpus(4)), 0.05),
        );
        let offer = provider
            .best_increase(4, &MethodResources::new(Capacity::cpus(1)), true)
            .unwrap();
        assert_eq!(offer.type_name, "medium-spot");
        assert!((offer.value - 0.05).abs() < 1e-9);
    }

    #[test]
    fn incompatible_image_yields_no_offer() {
        let provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None);
        let reqs = MethodResources::new(Capacity::cpus(1)).with_software("matlab");
        assert!(provider.best_increase(1, &reqs, true).is_none());
    }

    #[test]
    fn limit_stops_offers() {
        let connector = Arc::new(LoopbackConnector::new("aws"));
        let mut provider = make_provider(connector, Some(1));
        let catalog = cpu_catalog();
        let request = provider.prepare_request(1, "small", "ubuntu", &catalog).unwrap();
        assert!(provider.request_creation(request).unwrap());

        assert!(!provider.can_host_more_instances());
        assert!(provider.best_increase(1, &MethodResources::new(Capacity::cpus(1)), true).is_none());
    }

    #[test]
    fn accepted_creation_counts_pending_cores() {
        let connector = Arc::new(LoopbackConnector::new("aws"));
        let mut provider = make_provider(connector.clone(), None);
        let catalog = cpu_catalog();

        let request = provider.prepare_request(7, "medium", "ubuntu", &catalog).unwrap();
        assert!(provider.request_creation(request).unwrap());

        assert_eq!(provider.current_vm_count(), 1);
        assert_eq!(provider.pending_vm_count(), 1);
        assert_eq!(provider.pending_core_count(0), 4);
        assert_eq!(connector.calls(), vec![ConnectorCall::TurnOn(7)]);
    }

    #[test]
    fn declined_or_failed_creation_leaves_no_trace() {
        let catalog = cpu_catalog();

        let mut declined = make_provider(Arc::new(LoopbackConnector::declining("aws")), None);
        let request = declined.prepare_request(1, "small", "ubuntu", &catalog).unwrap();
        assert!(!declined.request_creation(request).unwrap());
        assert_eq!(declined.current_vm_count(), 0);
        assert_eq!(declined.pending_requests().count(), 0);

        let mut broken = make_provider(Arc::new(BrokenConnector), None);
        let request = broken.prepare_request(2, "small", "ubuntu", &catalog).unwrap();
        assert!(matches!(broken.request_creation(request), Err(ProviderError::Connector(_))));
        assert_eq!(broken.current_vm_count(), 0);
        assert_eq!(broken.pending_core_count(0), 0);
    }

    #[test]
    fn confirmation_moves_request_to_hosted() {
        let mut provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None);
        let catalog = cpu_catalog();
        let request = provider.prepare_request(3, "large", "ubuntu", &catalog).unwrap();
        let granted = request.description.clone();
        provider.request_creation(request).unwrap();

        provider.confirmed_creation(3, "vm-1", &granted).unwrap();

        assert_eq!(provider.pending_vm_count(), 0);
        assert_eq!(provider.pending_core_count(0), 0);
        assert_eq!(provider.current_vm_count(), 1);
        assert!(provider.hosts("vm-1"));
        assert!((provider.current_cost_per_hour() - 0.40).abs() < 1e-9);
        assert!(matches!(
            provider.confirmed_creation(3, "vm-1", &granted),
            Err(ProviderError::RequestNotPending(3))
        ));
    }

    #[test]
    fn refusal_rolls_back_counts() {
        let mut provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None);
        let catalog = cpu_catalog();
        let request = provider.prepare_request(4, "small", "ubuntu", &catalog).unwrap();
        provider.request_creation(request).unwrap();

        provider.refused_creation(4).unwrap();

        assert_eq!(provider.current_vm_count(), 0);
        assert_eq!(provider.pending_core_count(0), 0);
    }

    #[test]
    fn reduction_removes_empty_worker() {
        let mut provider = make_provider(Arc::new(LoopbackConnector::new("aws")), None);
        let catalog = cpu_catalog();
        let request = provider.prepare_request(5, "small", "ubuntu", &catalog).unwrap();
        let mut granted = request.description.clone();
        let large = provider.compose("large", "ubuntu").unwrap();
        granted.increase(&large);
        provider.request_creation(request).unwrap();
        provider.confirmed_creation(5, "vm-1", &granted).unwrap();
        assert_eq!(provider.current_vm_count(), 2);

        let options = provider.possible_reductions("vm-1");
        assert_eq!(options.len(), 2);

        let left = provider.request_reduction("vm-1", &large).unwrap().unwrap();
        assert_eq!(left.vm_count(), 1);
        assert_eq!(provider.current_vm_count(), 1);

        let small = provider.compose("small", "ubuntu").unwrap();
        assert!(provider.request_reduction("vm-1", &small).unwrap().is_none());
        assert!(!provider.hosts("vm-1"));
        assert_eq!(provider.current_vm_count(), 0);
    }

    #[test]
    fn failed_reduction_changes_nothing() {
        let mut provider = make_provider(Arc::new(BrokenConnector), None);
        let granted = provider.compose("small", "ubuntu").unwrap();
        provider.hosted.insert("vm-1".into(), granted.clone());
        provider.current_vms = 1;

        assert!(provider.request_reduction("vm-1", &granted).is_err());
        assert!(provider.hosts("vm-1"));
        assert_eq!(provider.current_vm_count(), 1);
    }
}
