//! Worker registry and task-type index.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use elastic_core::{CoreCatalog, CoreId, ResourceDescription};

use crate::error::{PoolError, PoolResult};

/// Which set a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Static,
    Critical,
    NonCritical,
}

/// A registered worker and the simultaneous capacity it offers per task
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolWorker {
    pub name: String,
    pub description: ResourceDescription,
    pub dynamic: bool,
    pub cost_per_hour: f64,
    pub core_capacity: BTreeMap<CoreId, u32>,
}

impl PoolWorker {
    fn new(name: &str, description: ResourceDescription, dynamic: bool, cost_per_hour: f64) -> Self {
        Self {
            name: name.to_string(),
            description,
            dynamic,
            cost_per_hour,
            core_capacity: BTreeMap::new(),
        }
    }

    pub fn executable_cores(&self) -> Vec<CoreId> {
        self.core_capacity.keys().copied().collect()
    }

    /// Instances of `core_id` this worker runs at once.
    pub fn fit_count(&self, core_id: CoreId) -> u32 {
        self.core_capacity.get(&core_id).copied().unwrap_or(0)
    }
}

/// How many instances of each task type `description` runs at once: the
/// best implementation wins. Task types it cannot run are left out.
pub fn simultaneous_capacity(description: &ResourceDescription, catalog: &CoreCatalog) -> BTreeMap<CoreId, u32> {
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

/// One worker as reported by `current_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub name: String,
    pub kind: WorkerKind,
    pub cost_per_hour: f64,
    pub cores: BTreeMap<CoreId, u32>,
}

/// Serializable view of the pool for monitoring sinks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub workers: Vec<WorkerState>,
    pub core_max: BTreeMap<CoreId, u32>,
}

/// Every worker of the session, split into static, critical and
/// non-critical sets, with a per-task-type index.
#[derive(Debug, Default)]
pub struct ResourcePool {
    static_set: BTreeMap<String, PoolWorker>,
    critical_set: BTreeMap<String, PoolWorker>,
    non_critical_set: BTreeMap<String, PoolWorker>,
    core_index: BTreeMap<CoreId, BTreeSet<String>>,
    core_max: BTreeMap<CoreId, u32>,
}

impl ResourcePool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a worker that lives as long as the session.
    pub fn add_static_worker(
        &mut self,
        name: &str,
        description: ResourceDescription,
        catalog: &CoreCatalog,
    ) -> PoolResult<()> {
        self.ensure_absent(name)?;
        self.static_set
            .insert(name.to_string(), PoolWorker::new(name, description, false, 0.0));
        let cores = self.add_resource_links(name, catalog)?;
        info!(worker = name, cores, "static worker registered");
        Ok(())
    }

    /// Register a freshly created elastic worker. New workers start in
    /// the critical set until `define_critical_set` says otherwise.
    pub fn add_dynamic_worker(
        &mut self,
        name: &str,
        description: ResourceDescription,
        cost_per_hour: f64,
        catalog: &CoreCatalog,
    ) -> PoolResult<()> {
        self.ensure_absent(name)?;
        self.critical_set.insert(
            name.to_string(),
            PoolWorker::new(name, description, true, cost_per_hour),
        );
        let cores = self.add_resource_links(name, catalog)?;
        info!(worker = name, cores, cost_per_hour, "dynamic worker registered");
        Ok(())
    }

    /// Apply an elastic extension or reduction. Returns false when the
    /// worker no longer runs any task type and was deleted.
    pub fn update_dynamic_worker(
        &mut self,
        name: &str,
        description: ResourceDescription,
        cost_per_hour: f64,
        catalog: &CoreCatalog,
    ) -> PoolResult<bool> {
        let worker = self.worker_mut(name)?;
        if !worker.dynamic {
            return Err(PoolError::NotDynamic(name.to_string()));
        }
        worker.description = description;
        worker.cost_per_hour = cost_per_hour;

        if self.add_resource_links(name, catalog)? == 0 {
            self.delete_worker(name)?;
            info!(worker = name, "worker runs no task type anymore, deleted");
            return Ok(false);
        }
        Ok(true)
    }

    /// Recompute the capacity `name` offers and fold it into the index.
    /// Returns the number of task types it runs.
    pub fn add_resource_links(&mut self, name: &str, catalog: &CoreCatalog) -> PoolResult<usize> {
        self.remove_resource_links(name)?;
        let worker = self.worker_mut(name)?;
        worker.core_capacity = simultaneous_capacity(&worker.description, catalog);
        let links: Vec<(CoreId, u32)> = worker.core_capacity.iter().map(|(c, n)| (*c, *n)).collect();

        for (core_id, count) in &links {
            self.core_index.entry(*core_id).or_default().insert(name.to_string());
            *self.core_max.entry(*core_id).or_default() += count;
        }
        debug!(worker = name, cores = links.len(), "resource links added");
        Ok(links.len())
    }

    /// Take `name` out of the index and the capacity counters.
    pub fn remove_resource_links(&mut self, name: &str) -> PoolResult<()> {
        let worker = self.worker_mut(name)?;
        let links = std::mem::take(&mut worker.core_capacity);

        for (core_id, count) in links {
            if let Some(workers) = self.core_index.get_mut(&core_id) {
                workers.remove(name);
                if workers.is_empty() {
                    self.core_index.remove(&core_id);
                }
            }
            if let Some(max) = self.core_max.get_mut(&core_id) {
                *max = max.saturating_sub(count);
                if *max == 0 {
                    self.core_max.remove(&core_id);
                }
            }
        }
        Ok(())
    }

    /// Recompute every worker after new task types were registered.
    pub fn core_elements_updated(&mut self, catalog: &CoreCatalog) -> PoolResult<()> {
        let names: Vec<String> = self.find_all_workers().iter().map(|w| w.name.clone()).collect();
        for name in names {
            self.add_resource_links(&name, catalog)?;
        }
        Ok(())
    }

    /// Drop `name` from whichever set holds it and unlink its task types.
    pub fn delete_worker(&mut self, name: &str) -> PoolResult<PoolWorker> {
        self.remove_resource_links(name)?;
        let worker = self
            .static_set
            .remove(name)
            .or_else(|| self.critical_set.remove(name))
            .or_else(|| self.non_critical_set.remove(name))
            .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))?;
        info!(worker = name, "worker removed from pool");
        Ok(worker)
    }

    // ── Critical set ───────────────────────────────────────────────

    /// Keep in the critical set only the dynamic workers that make some
    /// task type runnable, cheapest first. Returns the demoted workers.
    ///
    /// Non-critical workers are promoted back when a task type they run
    /// lost its last critical or static host.
    pub fn define_critical_set(&mut self) -> Vec<String> {
        let mut runnable: BTreeSet<CoreId> = self
            .static_set
            .values()
            .flat_map(|w| w.core_capacity.keys().copied())
            .collect();

        let mut demoted = Vec::new();
        for name in cost_order(&self.critical_set) {
            let Some(worker) = self.critical_set.get(&name) else {
                continue;
            };
            let needed = worker.core_capacity.keys().any(|c| !runnable.contains(c));
            if needed {
                runnable.extend(worker.core_capacity.keys().copied());
            } else if let Some(worker) = self.critical_set.remove(&name) {
                self.non_critical_set.insert(name.clone(), worker);
                demoted.push(name);
            }
        }

        for name in cost_order(&self.non_critical_set) {
            let Some(worker) = self.non_critical_set.get(&name) else {
                continue;
            };
            if worker.core_capacity.keys().any(|c| !runnable.contains(c)) {
                runnable.extend(worker.core_capacity.keys().copied());
                if let Some(worker) = self.non_critical_set.remove(&name) {
                    info!(worker = %name, "worker promoted to critical");
                    self.critical_set.insert(name, worker);
                }
            }
        }

        if !demoted.is_empty() {
            debug!(demoted = ?demoted, "critical set redefined");
        }
        demoted
    }

    /// Whether reducing critical worker `name` to `reduced` keeps every
    /// task type that static and critical workers run today runnable.
    pub fn is_critical_removal_safe(&self, name: &str, reduced: &ResourceDescription, catalog: &CoreCatalog) -> bool {
        let Some(worker) = self.critical_set.get(name) else {
            return true;
        };
        let mut covered: BTreeSet<CoreId> = self
            .static_set
            .values()
            .chain(self.critical_set.values().filter(|w| w.name != name))
            .flat_map(|w| w.core_capacity.keys().copied())
            .collect();
        covered.extend(simultaneous_capacity(reduced, catalog).into_keys());
        worker.core_capacity.keys().all(|c| covered.contains(c))
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Look `name` up in every set.
    pub fn find_worker(&self, name: &str) -> Option<&PoolWorker> {
        self.static_set
            .get(name)
            .or_else(|| self.critical_set.get(name))
            .or_else(|| self.non_critical_set.get(name))
    }

    /// The set `name` belongs to, if it is in the pool.
    pub fn kind_of(&self, name: &str) -> Option<WorkerKind> {
        if self.static_set.contains_key(name) {
            Some(WorkerKind::Static)
        } else if self.critical_set.contains_key(name) {
            Some(WorkerKind::Critical)
        } else if self.non_critical_set.contains_key(name) {
            Some(WorkerKind::NonCritical)
        } else {
            None
        }
    }

    /// Every worker, sorted by name.
    pub fn find_all_workers(&self) -> Vec<&PoolWorker> {
        let mut all: Vec<&PoolWorker> = self
            .static_set
            .values()
            .chain(self.critical_set.values())
            .chain(self.non_critical_set.values())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Workers able to run `core_id`, sorted by name.
    pub fn compatible_workers(&self, core_id: CoreId) -> Vec<String> {
        self.core_index
            .get(&core_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Instances of `core_id` the whole pool runs at once.
    pub fn core_max_task_count(&self, core_id: CoreId) -> u32 {
        self.core_max.get(&core_id).copied().unwrap_or(0)
    }

    /// Task types worker `name` runs.
    pub fn executable_cores(&self, name: &str) -> Vec<CoreId> {
        self.find_worker(name).map(PoolWorker::executable_cores).unwrap_or_default()
    }

    pub fn static_workers(&self) -> Vec<&PoolWorker> {
        self.static_set.values().collect()
    }

    pub fn critical_workers(&self) -> Vec<&PoolWorker> {
        self.critical_set.values().collect()
    }

    pub fn non_critical_workers(&self) -> Vec<&PoolWorker> {
        self.non_critical_set.values().collect()
    }

    /// Critical and non-critical workers together.
    pub fn dynamic_workers(&self) -> Vec<&PoolWorker> {
        self.critical_set.values().chain(self.non_critical_set.values()).collect()
    }

    pub fn len(&self) -> usize {
        self.static_set.len() + self.critical_set.len() + self.non_critical_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_state(&self) -> PoolState {
        let workers = self
            .find_all_workers()
            .into_iter()
            .filter_map(|w| {
                Some(WorkerState {
                    name: w.name.clone(),
                    kind: self.kind_of(&w.name)?,
                    cost_per_hour: w.cost_per_hour,
                    cores: w.core_capacity.clone(),
                })
            })
            .collect();
        PoolState {
            workers,
            core_max: self.core_max.clone(),
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn ensure_absent(&self, name: &str) -> PoolResult<()> {
        if self.find_worker(name).is_some() {
            return Err(PoolError::DuplicateWorker(name.to_string()));
        }
        Ok(())
    }

    fn worker_mut(&mut self, name: &str) -> PoolResult<&mut PoolWorker> {
        if let Some(w) = self.static_set.get_mut(name) {
            return Ok(w);
        }
        if let Some(w) = self.critical_set.get_mut(name) {
            return Ok(w);
        }
        self.non_critical_set
            .get_mut(name)
            .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))
    }
}

/// Names ordered by `(cost_per_hour, name)`.
fn cost_order(set: &BTreeMap<String, PoolWorker>) -> Vec<String> {
    let mut order: Vec<&PoolWorker> = set.values().collect();
    order.sort_by(|a, b| a.cost_per_hour.total_cmp(&b.cost_per_hour).then_with(|| a.name.cmp(&b.name)));
    order.into_iter().map(|w| w.name.clone()).collect()
}
