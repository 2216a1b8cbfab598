//! Instance types and images offered by a provider.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use elastic_core::{CoreCatalog, CoreId, ImplId, MethodResources, Profile, ResourceDescription, Timestamp};

/// A machine shape a provider can start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub resources: MethodResources,
    pub price_per_hour: f64,
    /// Power drawn by an idle instance, in watts.
    #[serde(default)]
    pub idle_power: f64,
    /// Price of an idle instance, per hour.
    #[serde(default)]
    pub idle_price: f64,
    /// Known execution profiles of implementations on this shape.
    #[serde(default)]
    pub profiles: BTreeMap<CoreId, BTreeMap<ImplId, Profile>>,
}

impl InstanceType {
    /// An instance type with no idle draw and no recorded profiles.
    pub fn new(name: &str, resources: MethodResources, price_per_hour: f64) -> Self {
        Self {
            name: name.to_string(),
            resources,
            price_per_hour,
            idle_power: 0.0,
            idle_price: 0.0,
            profiles: BTreeMap::new(),
        }
    }

    pub fn with_idle(mut self, idle_power: f64, idle_price: f64) -> Self {
        self.idle_power = idle_power;
        self.idle_price = idle_price;
        self
    }

    /// Expected profile of implementation `impl_id` of `core_id` on this type.
    pub fn with_profile(mut self, core_id: CoreId, impl_id: ImplId, profile: Profile) -> Self {
        self.profiles.entry(core_id).or_default().insert(impl_id, profile);
        self
    }

    /// The profile of `(core_id, impl_id)` on this shape, or the default
    /// profile when none has been recorded.
    pub fn profile(&self, core_id: CoreId, impl_id: ImplId) -> Profile {
        self.profiles
            .get(&core_id)
            .and_then(|by_impl| by_impl.get(&impl_id))
            .copied()
            .unwrap_or_default()
    }

    /// How many copies of `req` one instance runs at once.
    pub fn can_host_simultaneously(&self, req: &MethodResources) -> u32 {
        if !self.resources.can_host_static(req) {
            return 0;
        }
        self.resources.capacity.fit_count(&req.capacity)
    }
}

/// A boot image: the operating system and software installed on a new
/// instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub software: BTreeSet<String>,
    #[serde(default)]
    pub price_per_hour: f64,
    /// Time between the creation request and the worker being usable.
    #[serde(default)]
    pub creation_time_ms: Timestamp,
}

impl Image {
    /// An image that boots instantly and adds nothing.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_os(mut self, os: &str) -> Self {
        self.os_type = Some(os.to_string());
        self
    }

    pub fn with_software(mut self, software: &str) -> Self {
        self.software.insert(software.to_string());
        self
    }

    /// Time from request to a usable instance.
    pub fn with_creation_time(mut self, creation_time_ms: Timestamp) -> Self {
        self.creation_time_ms = creation_time_ms;
        self
    }

    pub fn with_price(mut self, price_per_hour: f64) -> Self {
        self.price_per_hour = price_per_hour;
        self
    }

    /// `resources` as they look once this image is booted on them.
    pub fn apply(&self, resources: &MethodResources) -> MethodResources {
        let mut booted = resources.clone();
        if self.os_type.is_some() {
            booted.os_type = self.os_type.clone();
        }
        booted.software.extend(self.software.iter().cloned());
        booted
    }
}

/// Per task type, how many instances one machine of `resources` runs at
/// once (best implementation). Task types it cannot run are left out.
pub fn core_slots(resources: &MethodResources, catalog: &CoreCatalog) -> BTreeMap<CoreId, u32> {
    let description = ResourceDescription::Method(resources.clone());
    catalog
        .core_ids()
        .filter_map(|core_id| {
            let best = catalog
                .implementations(core_id)
                .iter()
                .map(|i| description.simultaneous_capacity(&i.requirements))
                .max()
                .unwrap_or(0);
            (best > 0).then_some((core_id, best))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::Capacity;

    #[test]
    fn image_adds_os_and_software() {
        let resources = MethodResources::new(Capacity::cpus(4)).with_arch("x86_64");
        let image = Image::new("ubuntu").with_os("linux").with_software("python");

        let booted = image.apply(&resources);

        assert_eq!(booted.os_type.as_deref(), Some("linux"));
        assert!(booted.software.contains("python"));
        assert_eq!(booted.capacity, Capacity::cpus(4));
    }

    #[test]
    fn missing_profile_falls_back_to_default() {
        let ty = InstanceType::new("small", MethodResources::new(Capacity::cpus(2)), 0.1)
            .with_profile(0, 0, Profile::with_average(400));

        assert_eq!(ty.profile(0, 0).avg_time, 400);
        assert_eq!(ty.profile(0, 1), Profile::default());
    }

    #[test]
    fn core_slots_use_best_implementation() {
        let mut catalog = CoreCatalog::new();
        let core = catalog.register_core("fit");
        catalog
            .add_implementations(
                core,
                vec![
                    ("fit_big".into(), ResourceDescription::cpus(4)),
                    ("fit_small".into(), ResourceDescription::cpus(1)),
                ],
            )
            .unwrap();
        let other = catalog.register_core("gpu_only");
        catalog
            .add_implementations(
                other,
                vec![(
                    "gpu".into(),
                    ResourceDescription::Method(MethodResources::new(Capacity::cpus(1).with_gpus(1))),
                )],
            )
            .unwrap();

        let slots = core_slots(&MethodResources::new(Capacity::cpus(8)), &catalog);

        assert_eq!(slots.get(&core), Some(&8));
        assert!(!slots.contains_key(&other));
    }
}
