//! Resource descriptions.
//!
//! A description has a static part (architecture, OS, software, service
//! identity) that decides *whether* a worker can host an implementation,
//! and a dynamic `Capacity` that decides *how many* copies fit at once.
//! Gaps on a worker timeline only ever carry capacities.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The divisible, consumable part of a resource description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capacity {
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default)]
    pub fpga: u32,
    #[serde(default)]
    pub other: u32,
    #[serde(default)]
    pub memory_mb: u64,
    /// Connection slots offered by a service worker.
    #[serde(default)]
    pub slots: u32,
}

impl Capacity {
    /// No capacity at all.
    pub const EMPTY: Capacity = Capacity {
        cpu: 0,
        gpu: 0,
        fpga: 0,
        other: 0,
        memory_mb: 0,
        slots: 0,
    };

    /// Capacity made only of CPU computing units.
    pub fn cpus(cpu: u32) -> Self {
        Self {
            cpu,
            ..Self::EMPTY
        }
    }

    /// Capacity made only of service slots.
    pub fn slots(slots: u32) -> Self {
        Self {
            slots,
            ..Self::EMPTY
        }
    }

    pub fn with_gpus(mut self, gpu: u32) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_fpgas(mut self, fpga: u32) -> Self {
        self.fpga = fpga;
        self
    }

    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// True when nothing is left to consume.
    pub fn is_useless(&self) -> bool {
        *self == Self::EMPTY
    }

    /// True when using this capacity takes something from its holder.
    pub fn is_consuming(&self) -> bool {
        !self.is_useless()
    }

    /// Whether every dimension of `other` fits inside `self`.
    pub fn contains(&self, other: &Capacity) -> bool {
        self.dims()
            .iter()
            .zip(other.dims().iter())
            .all(|(have, need)| have >= need)
    }

    /// Subtract `other`, saturating at zero.
    pub fn reduce(&mut self, other: &Capacity) {
        self.cpu = self.cpu.saturating_sub(other.cpu);
        self.gpu = self.gpu.saturating_sub(other.gpu);
        self.fpga = self.fpga.saturating_sub(other.fpga);
        self.other = self.other.saturating_sub(other.other);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        self.slots = self.slots.saturating_sub(other.slots);
    }

    pub fn increase(&mut self, other: &Capacity) {
        self.cpu = self.cpu.saturating_add(other.cpu);
        self.gpu = self.gpu.saturating_add(other.gpu);
        self.fpga = self.fpga.saturating_add(other.fpga);
        self.other = self.other.saturating_add(other.other);
        self.memory_mb = self.memory_mb.saturating_add(other.memory_mb);
        self.slots = self.slots.saturating_add(other.slots);
    }

    /// Multiply every dimension by `count`.
    pub fn times(&self, count: u32) -> Capacity {
        Capacity {
            cpu: self.cpu.saturating_mul(count),
            gpu: self.gpu.saturating_mul(count),
            fpga: self.fpga.saturating_mul(count),
            other: self.other.saturating_mul(count),
            memory_mb: self.memory_mb.saturating_mul(u64::from(count)),
            slots: self.slots.saturating_mul(count),
        }
    }

    /// Remove from both `available` and `required` the amount they share,
    /// returning that shared amount.
    pub fn reduce_common(available: &mut Capacity, required: &mut Capacity) -> Capacity {
        let used = Capacity {
            cpu: available.cpu.min(required.cpu),
            gpu: available.gpu.min(required.gpu),
            fpga: available.fpga.min(required.fpga),
            other: available.other.min(required.other),
            memory_mb: available.memory_mb.min(required.memory_mb),
            slots: available.slots.min(required.slots),
        };
        available.reduce(&used);
        required.reduce(&used);
        used
    }

    /// How many copies of `req` fit simultaneously.
    ///
    /// An empty requirement fits an unbounded number of times.
    pub fn fit_count(&self, req: &Capacity) -> u32 {
        let mut count = u64::from(u32::MAX);
        for (have, need) in self.dims().iter().zip(req.dims().iter()) {
            if *need > 0 {
                count = count.min(have / need);
            }
        }
        count as u32
    }

    /// Sum of all countable units, used for conservation checks.
    pub fn total_units(&self) -> u64 {
        u64::from(self.cpu)
            + u64::from(self.gpu)
            + u64::from(self.fpga)
            + u64::from(self.other)
            + u64::from(self.slots)
    }

    fn dims(&self) -> [u64; 6] {
        [
            u64::from(self.cpu),
            u64::from(self.gpu),
            u64::from(self.fpga),
            u64::from(self.other),
            self.memory_mb,
            u64::from(self.slots),
        ]
    }
}

// ── Method workers ─────────────────────────────────────────────────

/// Description of a worker (or requirement) that runs method tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodResources {
    #[serde(default)]
    pub capacity: Capacity,
    /// Required / offered processor architecture. `None` matches anything.
    #[serde(default)]
    pub processor_arch: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub software: BTreeSet<String>,
    #[serde(default)]
    pub storage_mb: u64,
}

impl MethodResources {
    /// A description with `capacity` and no software or platform constraints.
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_arch(mut self, arch: &str) -> Self {
        self.processor_arch = Some(arch.to_string());
        self
    }

    pub fn with_os(mut self, os: &str) -> Self {
        self.os_type = Some(os.to_string());
        self
    }

    pub fn with_software(mut self, software: &str) -> Self {
        self.software.insert(software.to_string());
        self
    }

    pub fn with_storage(mut self, storage_mb: u64) -> Self {
        self.storage_mb = storage_mb;
        self
    }

    /// Static compatibility: features requested by `req` are offered here.
    pub fn can_host_static(&self, req: &MethodResources) -> bool {
        let arch_ok = match (&req.processor_arch, &self.processor_arch) {
            (None, _) => true,
            (Some(wanted), Some(offered)) => wanted == offered,
            (Some(_), None) => false,
        };
        let os_ok = match (&req.os_type, &self.os_type) {
            (None, _) => true,
            (Some(wanted), Some(offered)) => wanted.eq_ignore_ascii_case(offered),
            (Some(_), None) => false,
        };
        arch_ok && os_ok && req.software.is_subset(&self.software) && self.storage_mb >= req.storage_mb
    }

    /// Whether one copy of `req` fits.
    pub fn can_host(&self, req: &MethodResources) -> bool {
        self.can_host_static(req) && self.capacity.contains(&req.capacity)
    }

    /// Add another description (e.g. an extra cloud instance).
    pub fn increase(&mut self, other: &MethodResources) {
        self.capacity.increase(&other.capacity);
        self.storage_mb = self.storage_mb.saturating_add(other.storage_mb);
        self.software.extend(other.software.iter().cloned());
        if self.processor_arch.is_none() {
            self.processor_arch = other.processor_arch.clone();
        }
        if self.os_type.is_none() {
            self.os_type = other.os_type.clone();
        }
    }

    pub fn reduce(&mut self, other: &MethodResources) {
        self.capacity.reduce(&other.capacity);
        self.storage_mb = self.storage_mb.saturating_sub(other.storage_mb);
    }
}

// ── Service workers ────────────────────────────────────────────────

/// A remote service endpoint hosting service tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceResources {
    pub namespace: String,
    pub service_name: String,
    pub port: String,
    #[serde(default)]
    pub capacity: Capacity,
}

impl ServiceResources {
    /// A service endpoint offering `slots` concurrent calls.
    pub fn new(namespace: &str, service_name: &str, port: &str, slots: u32) -> Self {
        Self {
            namespace: namespace.to_string(),
            service_name: service_name.to_string(),
            port: port.to_string(),
            capacity: Capacity::slots(slots),
        }
    }

    /// Whether `req` targets this very endpoint.
    pub fn can_host_static(&self, req: &ServiceResources) -> bool {
        self.namespace == req.namespace && self.service_name == req.service_name && self.port == req.port
    }
}

// ── Cloud workers ──────────────────────────────────────────────────

/// One instance type inside a cloud worker composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeComponent {
    pub count: u32,
    /// Resources of a single instance of this type.
    pub resources: MethodResources,
}

/// A cloud worker: a method description built from instance types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudResources {
    pub base: MethodResources,
    pub provider: String,
    pub image: String,
    #[serde(default)]
    pub composition: BTreeMap<String, TypeComponent>,
}

impl CloudResources {
    /// An empty composition on `provider` using `image`.
    pub fn new(provider: &str, image: &str) -> Self {
        Self {
            base: MethodResources::default(),
            provider: provider.to_string(),
            image: image.to_string(),
            composition: BTreeMap::new(),
        }
    }

    /// A composition holding `count` instances of one type.
    pub fn of_type(provider: &str, image: &str, type_name: &str, resources: &MethodResources, count: u32) -> Self {
        let mut cloud = Self::new(provider, image);
        cloud.extend(type_name, resources, count);
        cloud
    }

    /// Add `count` instances of `type_name`.
    pub fn extend(&mut self, type_name: &str, resources: &MethodResources, count: u32) {
        for _ in 0..count {
            self.base.increase(resources);
        }
        self.composition
            .entry(type_name.to_string())
            .and_modify(|c| c.count += count)
            .or_insert_with(|| TypeComponent {
                count,
                resources: resources.clone(),
            });
    }

    /// Merge another composition into this one.
    pub fn increase(&mut self, other: &CloudResources) {
        for (name, component) in &other.composition {
            self.extend(name, &component.resources, component.count);
        }
    }

    /// Remove every component listed in `other`. Components not present
    /// here are ignored.
    pub fn reduce(&mut self, other: &CloudResources) {
        for (name, component) in &other.composition {
            let Some(own) = self.composition.get_mut(name) else {
                continue;
            };
            let removed = own.count.min(component.count);
            own.count -= removed;
            for _ in 0..removed {
                self.base.reduce(&component.resources);
            }
            if own.count == 0 {
                self.composition.remove(name);
            }
        }
    }

    /// Single-instance reductions this worker could undergo, one per type.
    pub fn possible_reductions(&self) -> Vec<CloudResources> {
        self.composition
            .iter()
            .map(|(name, component)| {
                CloudResources::of_type(&self.provider, &self.image, name, &component.resources, 1)
            })
            .collect()
    }

    /// Number of VM instances in the composition.
    pub fn vm_count(&self) -> u32 {
        self.composition.values().map(|c| c.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.composition.is_empty()
    }
}

// ── Tagged union ───────────────────────────────────────────────────

/// Any worker description or implementation requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceDescription {
    Method(MethodResources),
    Service(ServiceResources),
    Cloud(CloudResources),
}

impl ResourceDescription {
    /// Shorthand for a method requirement of `cpu` units.
    pub fn cpus(cpu: u32) -> Self {
        ResourceDescription::Method(MethodResources::new(Capacity::cpus(cpu)))
    }

    /// Countable capacity, whatever the kind.
    pub fn capacity(&self) -> Capacity {
        match self {
            ResourceDescription::Method(m) => m.capacity,
            ResourceDescription::Service(s) => s.capacity,
            ResourceDescription::Cloud(c) => c.base.capacity,
        }
    }

    /// The method view of a method or cloud description.
    pub fn method(&self) -> Option<&MethodResources> {
        match self {
            ResourceDescription::Method(m) => Some(m),
            ResourceDescription::Cloud(c) => Some(&c.base),
            ResourceDescription::Service(_) => None,
        }
    }

    /// The elastic part, for cloud workers.
    pub fn as_cloud(&self) -> Option<&CloudResources> {
        match self {
            ResourceDescription::Cloud(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_cloud_mut(&mut self) -> Option<&mut CloudResources> {
        match self {
            ResourceDescription::Cloud(c) => Some(c),
            _ => None,
        }
    }

    /// Whether this worker can be partially reduced by an elastic provider.
    pub fn is_elastic(&self) -> bool {
        matches!(self, ResourceDescription::Cloud(_))
    }

    /// Static compatibility with a requirement, ignoring current occupation.
    pub fn can_host_static(&self, req: &ResourceDescription) -> bool {
        match (self, req) {
            (ResourceDescription::Service(worker), ResourceDescription::Service(wanted)) => {
                worker.can_host_static(wanted)
            }
            (ResourceDescription::Service(_), _) | (_, ResourceDescription::Service(_)) => false,
            _ => match (self.method(), req.method()) {
                (Some(worker), Some(wanted)) => worker.can_host_static(wanted),
                _ => false,
            },
        }
    }

    /// Whether the dynamic part of `req` fits in this description.
    pub fn can_host_dynamic(&self, req: &ResourceDescription) -> bool {
        self.capacity().contains(&req.capacity())
    }

    /// Whether one copy of `req` fits right now.
    pub fn can_host(&self, req: &ResourceDescription) -> bool {
        self.can_host_static(req) && self.can_host_dynamic(req)
    }

    /// How many copies of `req` this description hosts at once.
    pub fn simultaneous_capacity(&self, req: &ResourceDescription) -> u32 {
        if !self.can_host_static(req) {
            return 0;
        }
        self.capacity().fit_count(&req.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_type() -> MethodResources {
        MethodResources::new(Capacity::cpus(2).with_memory(4096)).with_os("linux")
    }

    #[test]
    fn reduce_common_takes_shared_amount_from_both() {
        let mut gap = Capacity::cpus(4).with_memory(1024);
        let mut req = Capacity::cpus(6).with_memory(512);

        let used = Capacity::reduce_common(&mut gap, &mut req);

        assert_eq!(used, Capacity::cpus(4).with_memory(512));
        assert_eq!(gap, Capacity::EMPTY.with_memory(512));
        assert_eq!(req, Capacity::cpus(2));
    }

    #[test]
    fn empty_capacity_is_useless() {
        assert!(Capacity::EMPTY.is_useless());
        assert!(!Capacity::cpus(1).is_useless());
        assert!(Capacity::EMPTY.with_memory(1).is_consuming());
    }

    #[test]
    fn fit_count_uses_tightest_dimension() {
        let worker = Capacity::cpus(8).with_memory(1000);
        let req = Capacity::cpus(2).with_memory(400);
        assert_eq!(worker.fit_count(&req), 2);
        assert_eq!(worker.fit_count(&Capacity::EMPTY), u32::MAX);
        assert_eq!(Capacity::cpus(1).fit_count(&Capacity::cpus(2)), 0);
    }

    #[test]
    fn method_static_features_must_match() {
        let worker = MethodResources::new(Capacity::cpus(4))
            .with_arch("amd64")
            .with_os("Linux")
            .with_software("java");
        let ok = MethodResources::new(Capacity::cpus(2)).with_os("linux").with_software("java");
        let wrong_arch = MethodResources::new(Capacity::cpus(1)).with_arch("arm64");
        let missing_sw = MethodResources::new(Capacity::cpus(1)).with_software("python");

        assert!(worker.can_host(&ok));
        assert!(!worker.can_host(&wrong_arch));
        assert!(!worker.can_host(&missing_sw));
        assert!(!worker.can_host(&MethodResources::new(Capacity::cpus(5))));
    }

    #[test]
    fn service_and_method_never_mix() {
        let service = ResourceDescription::Service(ServiceResources::new("ns", "svc", "80", 4));
        let method = ResourceDescription::cpus(1);
        assert!(!service.can_host_static(&method));
        assert!(!method.can_host_static(&service));
        let call = ResourceDescription::Service(ServiceResources::new("ns", "svc", "80", 1));
        assert_eq!(service.simultaneous_capacity(&call), 4);
    }

    #[test]
    fn cloud_worker_hosts_method_requirements() {
        let cloud = ResourceDescription::Cloud(CloudResources::of_type("p", "img", "small", &small_type(), 2));
        let req = ResourceDescription::Method(MethodResources::new(Capacity::cpus(3)).with_os("linux"));
        assert!(cloud.can_host(&req));
        assert_eq!(cloud.simultaneous_capacity(&ResourceDescription::cpus(1)), 4);
    }

    #[test]
    fn cloud_composition_extends_and_reduces() {
        let large = MethodResources::new(Capacity::cpus(8));
        let mut cloud = CloudResources::of_type("p", "img", "small", &small_type(), 1);
        cloud.extend("large", &large, 1);
        assert_eq!(cloud.vm_count(), 2);
        assert_eq!(cloud.base.capacity.cpu, 10);

        let reductions = cloud.possible_reductions();
        assert_eq!(reductions.len(), 2);

        let small_only = reductions.iter().find(|r| r.composition.contains_key("small")).unwrap();
        cloud.reduce(small_only);
        assert_eq!(cloud.vm_count(), 1);
        assert_eq!(cloud.base.capacity.cpu, 8);
        assert!(!cloud.composition.contains_key("small"));

        cloud.reduce(&CloudResources::of_type("p", "img", "large", &large, 1));
        assert!(cloud.is_empty());
        assert!(cloud.base.capacity.is_useless());
    }

    #[test]
    fn description_round_trips_through_tagged_json() {
        let desc = ResourceDescription::Method(MethodResources::new(Capacity::cpus(2)).with_os("linux"));
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"kind\":\"method\""));
        let back: ResourceDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
