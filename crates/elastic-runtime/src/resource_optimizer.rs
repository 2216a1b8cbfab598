//! Elasticity controller: decides whether to grow or shrink the fleet.
//!
//! Every pass estimates what the current fleet (plus pending creations)
//! would spend finishing the pending workload, does the same for each
//! single-step change (add one instance, remove one component) and
//! commits the change that best serves the optimization goal within the
//! remaining budgets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use elastic_core::{
    CloudResources, CoreCatalog, CoreId, Implementation, Profile, ResourceDescription, Timestamp, NEVER,
};
use elastic_pool::ResourcePool;
use elastic_provider::{core_slots, CreationRequest, ElasticProviderManager};
use elastic_scheduler::WorkerSnapshot;

use crate::configuration::{select_best_action, simulate, Budgets, ConfigurationCost, SimResource};
use crate::error::RuntimeResult;
use crate::session::{ElasticSession, Reduction};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// A single-step change of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Candidate {
    Add {
        provider: String,
        type_name: String,
        image: String,
    },
    Remove {
        worker: String,
        reduction: CloudResources,
    },
}

/// What a pass of `apply_policies` did.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    /// Nothing improves on the current fleet.
    Unchanged,
    CreationRequested(CreationRequest),
    WorkerReduced { worker: String, reduction: CloudResources },
    /// No improving change could be carried out. Holds the best one,
    /// which a provider declined or whose capacity was in use.
    Rejected(Candidate),
}

/// An existing worker as seen by the simulation, with the
/// implementation picked for every core it runs.
#[derive(Debug, Clone)]
struct WorkerContext {
    resource: SimResource,
    description: ResourceDescription,
    implementations: BTreeMap<CoreId, Implementation>,
}

/// Everything a pass needs, gathered once.
#[derive(Debug, Clone)]
struct FleetContext {
    workers: Vec<WorkerContext>,
    pending: Vec<SimResource>,
    load: BTreeMap<CoreId, u32>,
    elapsed: ConfigurationCost,
}

impl FleetContext {
    fn resources(&self) -> Vec<SimResource> {
        self.workers
            .iter()
            .map(|w| w.resource.clone())
            .chain(self.pending.iter().cloned())
            .collect()
    }
}

/// Periodic elasticity controller over one session.
pub struct ResourceOptimizer {
    session: Arc<ElasticSession>,
}

impl ResourceOptimizer {
    /// An optimizer acting on `session`.
    pub fn new(session: Arc<ElasticSession>) -> Self {
        Self { session }
    }

    /// Run one elasticity decision and carry it out. When the best change
    /// is refused, the next best is tried.
    pub async fn apply_policies(&self) -> RuntimeResult<PolicyOutcome> {
        let mut snapshots = Vec::new();
        for handle in self.session.worker_handles().await {
            snapshots.push(handle.snapshot().await?);
        }

        let catalog = self.session.catalog();
        let catalog = catalog.read().await;
        let pool = self.session.pool();
        let providers = self.session.providers();
        let (context, mut candidates) = {
            let pool = pool.read().await;
            let providers = providers.lock().await;
            let context = self.context(&snapshots, &catalog, &providers);
            let candidates = self.candidates(&context, &catalog, &pool, &providers);
            (context, candidates)
        };
        drop(catalog);

        let current = simulate(&context.load, &context.resources(), 0, 0.0, 0.0);
        let budgets = Budgets::remaining(&self.session.config().optimization, &context.elapsed);
        debug!(
            workers = context.workers.len(),
            pending = context.pending.len(),
            candidates = candidates.len(),
            time_s = current.time,
            energy_wh = current.energy,
            cost = current.cost,
            "fleet evaluated"
        );

        let goal = self.session.config().optimization.goal;
        let mut first_rejected = None;
        loop {
            let costs: Vec<ConfigurationCost> = candidates.iter().map(|(_, cost)| *cost).collect();
            let Some(index) = select_best_action(&current, &costs, &budgets, goal) else {
                debug!(%goal, "no fleet change improves the current configuration");
                break;
            };
            let (candidate, cost) = candidates.remove(index);
            info!(?candidate, time_s = cost.time, energy_wh = cost.energy, cost = cost.cost, "fleet change selected");
            match self.perform(candidate).await? {
                PolicyOutcome::Rejected(candidate) => {
                    debug!(?candidate, "fleet change rejected, trying the next best");
                    first_rejected.get_or_insert(candidate);
                }
                outcome => return Ok(outcome),
            }
        }
        Ok(first_rejected.map_or(PolicyOutcome::Unchanged, PolicyOutcome::Rejected))
    }

    async fn perform(&self, candidate: Candidate) -> RuntimeResult<PolicyOutcome> {
        match &candidate {
            Candidate::Add {
                provider,
                type_name,
                image,
            } => {
                let catalog = self.session.catalog();
                let catalog = catalog.read().await;
                let providers = self.session.providers();
                let request = providers
                    .lock()
                    .await
                    .request_creation(provider, type_name, image, &catalog)?;
                match request {
                    Some(request) => {
                        info!(request = request.id, %provider, instance_type = %type_name, "instance requested");
                        Ok(PolicyOutcome::CreationRequested(request))
                    }
                    None => Ok(PolicyOutcome::Rejected(candidate)),
                }
            }
            Candidate::Remove { worker, reduction } => {
                match self.session.reduce_worker(worker, reduction).await? {
                    Reduction::Refused => Ok(PolicyOutcome::Rejected(candidate)),
                    Reduction::Shrunk | Reduction::Removed { .. } => Ok(PolicyOutcome::WorkerReduced {
                        worker: worker.clone(),
                        reduction: reduction.clone(),
                    }),
                }
            }
        }
    }

    // ── Context ────────────────────────────────────────────────────

    fn context(
        &self,
        snapshots: &[WorkerSnapshot],
        catalog: &CoreCatalog,
        providers: &ElasticProviderManager,
    ) -> FleetContext {
        let now = self.session.now_ms();
        let mut load: BTreeMap<CoreId, u32> = BTreeMap::new();
        let mut run_energy = 0.0;
        let mut run_cost = 0.0;

        let workers = snapshots
            .iter()
            .map(|snapshot| {
                run_energy += snapshot.accounting.run_energy;
                run_cost += snapshot.accounting.run_cost;
                for stats in &snapshot.implementations {
                    *load.entry(stats.core_id).or_default() += stats.scheduled.saturating_sub(stats.running);
                }
                worker_context(snapshot, now, catalog)
            })
            .collect();

        let pending = providers
            .pending_requests()
            .into_iter()
            .filter_map(|request| pending_resource(request, catalog, providers))
            .collect();

        FleetContext {
            workers,
            pending,
            load,
            elapsed: ConfigurationCost {
                time: now.max(0) as f64 / 1000.0,
                energy: run_energy / MS_PER_HOUR,
                cost: run_cost / MS_PER_HOUR,
                power: 0.0,
                price: 0.0,
            },
        }
    }

    // ── Candidates ─────────────────────────────────────────────────

    fn candidates(
        &self,
        context: &FleetContext,
        catalog: &CoreCatalog,
        pool: &ResourcePool,
        providers: &ElasticProviderManager,
    ) -> Vec<(Candidate, ConfigurationCost)> {
        let mut candidates = Vec::new();
        let vms = providers.current_vm_count();
        if vms < providers.max_vms() {
            self.acquisitions(context, catalog, providers, &mut candidates);
        }
        if vms > providers.min_vms() {
            self.releases(context, catalog, pool, providers, &mut candidates);
        }
        candidates
    }

    fn acquisitions(
        &self,
        context: &FleetContext,
        catalog: &CoreCatalog,
        providers: &ElasticProviderManager,
        out: &mut Vec<(Candidate, ConfigurationCost)>,
    ) {
        let mut resources = context.resources();
        for provider in providers.providers() {
            if !provider.can_host_more_instances() {
                continue;
            }
            for instance_type in provider.instance_types() {
                for image in provider.images() {
                    let Ok(composed) = provider.compose(&instance_type.name, &image.name) else {
                        continue;
                    };
                    let mut resource = SimResource::new(&format!("{}/{}", provider.name(), instance_type.name));
                    resource.idle_power = instance_type.idle_power;
                    resource.idle_price = instance_type.idle_price;
                    resource.start_time = image.creation_time_ms;
                    resource.capacity = core_slots(&composed.base, catalog);
                    let booted = ResourceDescription::Method(composed.base.clone());
                    for core_id in resource.capacity.keys() {
                        if let Some(best) = widest_implementation(&booted, *core_id, catalog) {
                            resource
                                .profiles
                                .insert(*core_id, instance_type.profile(*core_id, best.impl_id));
                        }
                    }

                    resources.push(resource);
                    let cost = simulate(&context.load, &resources, 0, 0.0, 0.0);
                    resources.pop();

                    let candidate = Candidate::Add {
                        provider: provider.name().to_string(),
                        type_name: instance_type.name.clone(),
                        image: image.name.clone(),
                    };
                    debug!(?candidate, time_s = cost.time, energy_wh = cost.energy, cost = cost.cost, "candidate");
                    out.push((candidate, cost));
                }
            }
        }
    }

    /// Removal candidates. A reduction that would leave a task type
    /// without a critical host is never offered.
    fn releases(
        &self,
        context: &FleetContext,
        catalog: &CoreCatalog,
        pool: &ResourcePool,
        providers: &ElasticProviderManager,
        out: &mut Vec<(Candidate, ConfigurationCost)>,
    ) {
        let mut resources = context.resources();
        for (index, worker) in context.workers.iter().enumerate() {
            if worker.resource.pending_modification {
                continue;
            }
            let Some(cloud) = worker.description.as_cloud() else {
                continue;
            };
            let Ok(provider) = providers.provider(&cloud.provider) else {
                continue;
            };
            let excluded = &worker.resource;
            let min_time = excluded.start_time;
            let min_energy = excluded.idle_power * min_time as f64 + excluded.start_energy;
            let min_cost = excluded.start_cost;

            for reduction in cloud.possible_reductions() {
                let mut reduced = cloud.clone();
                reduced.reduce(&reduction);
                let emptied = reduced.is_empty();
                let reduced_description = ResourceDescription::Cloud(reduced);
                if !pool.is_critical_removal_safe(&excluded.name, &reduced_description, catalog) {
                    debug!(worker = %excluded.name, "reduction would strand a task type, skipped");
                    continue;
                }

                let cost = if emptied {
                    let remaining: Vec<SimResource> = resources
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .map(|(_, r)| r.clone())
                        .collect();
                    simulate(&context.load, &remaining, min_time, min_energy, min_cost)
                } else {
                    let mut shrunk = excluded.clone();
                    for (type_name, component) in &reduction.composition {
                        if let Ok(instance_type) = provider.instance_type(type_name) {
                            let count = f64::from(component.count);
                            shrunk.idle_power -= instance_type.idle_power * count;
                            shrunk.idle_price -= instance_type.idle_price * count;
                        }
                    }
                    shrunk.capacity = worker
                        .implementations
                        .iter()
                        .map(|(core_id, i)| (*core_id, reduced_description.simultaneous_capacity(&i.requirements)))
                        .filter(|(_, slots)| *slots > 0)
                        .collect();
                    resources[index] = shrunk;
                    let cost = simulate(&context.load, &resources, min_time, min_energy, min_cost);
                    resources[index] = excluded.clone();
                    cost
                };

                let candidate = Candidate::Remove {
                    worker: excluded.name.clone(),
                    reduction,
                };
                debug!(?candidate, time_s = cost.time, energy_wh = cost.energy, cost = cost.cost, "candidate");
                out.push((candidate, cost));
            }
        }
    }

    /// Run `apply_policies` every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs_f64(), "resource optimizer started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.apply_policies().await {
                        Ok(PolicyOutcome::Unchanged) => {}
                        Ok(outcome) => debug!(?outcome, "resource optimization applied"),
                        Err(e) => tracing::error!(error = %e, "resource optimization failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource optimizer shutting down");
                    break;
                }
            }
        }
    }
}

/// The implementation of `core_id` that fits most copies on `description`.
fn widest_implementation<'a>(
    description: &ResourceDescription,
    core_id: CoreId,
    catalog: &'a CoreCatalog,
) -> Option<&'a Implementation> {
    catalog
        .implementations(core_id)
        .iter()
        .map(|i| (description.simultaneous_capacity(&i.requirements), i))
        .filter(|(slots, _)| *slots > 0)
        .max_by(|(a, ia), (b, ib)| a.cmp(b).then_with(|| ib.impl_id.cmp(&ia.impl_id)))
        .map(|(_, i)| i)
}

/// How long from `now` the running work keeps a worker busy. An unknown
/// end counts as free now.
fn busy_for(end_running: Timestamp, now: Timestamp) -> Timestamp {
    match end_running {
        NEVER => 0,
        end => end.saturating_sub(now).max(0),
    }
}

fn worker_context(snapshot: &WorkerSnapshot, now: i64, catalog: &CoreCatalog) -> WorkerContext {
    let mut resource = SimResource::new(&snapshot.worker);
    resource.idle_power = snapshot.idle_power;
    resource.idle_price = snapshot.idle_price;
    resource.start_energy = snapshot.accounting.running_energy;
    resource.start_cost = snapshot.accounting.running_cost;
    resource.start_time = busy_for(snapshot.accounting.end_running, now);

    let mut implementations = BTreeMap::new();
    for core_id in catalog.core_ids() {
        let hostable: Vec<&Implementation> = catalog
            .implementations(core_id)
            .iter()
            .filter(|i| snapshot.description.simultaneous_capacity(&i.requirements) > 0)
            .collect();
        let profile_of = |i: &Implementation| {
            snapshot
                .stats(core_id, i.impl_id)
                .map(|s| s.profile)
                .unwrap_or_default()
        };
        let scheduled_of = |i: &Implementation| snapshot.stats(core_id, i.impl_id).map_or(0, |s| s.scheduled);

        // Favour the implementation the worker already runs most; fall
        // back to the fastest profile.
        let favourite = hostable
            .iter()
            .copied()
            .filter(|i| scheduled_of(i) > 0)
            .max_by(|a, b| scheduled_of(a).cmp(&scheduled_of(b)).then_with(|| b.impl_id.cmp(&a.impl_id)));
        let chosen = favourite.or_else(|| {
            hostable
                .iter()
                .copied()
                .min_by_key(|i| (profile_of(i).avg_time, i.impl_id))
        });
        let Some(chosen) = chosen else {
            continue;
        };

        resource.profiles.insert(core_id, profile_of(chosen));
        resource.capacity.insert(
            core_id,
            snapshot.description.simultaneous_capacity(&chosen.requirements),
        );
        implementations.insert(core_id, chosen.clone());
    }

    WorkerContext {
        resource,
        description: snapshot.description.clone(),
        implementations,
    }
}

/// A creation not yet confirmed, costed as if it were already running.
fn pending_resource(
    request: &CreationRequest,
    catalog: &CoreCatalog,
    providers: &ElasticProviderManager,
) -> Option<SimResource> {
    let provider = providers.provider(&request.provider).ok()?;
    let instance_type = provider.instance_type(&request.type_name).ok()?;
    let image = provider.image(&request.image).ok()?;
    let count = request.vm_count().max(1);

    let mut resource = SimResource::new(&format!("request-{}", request.id));
    resource.idle_power = instance_type.idle_power * f64::from(count);
    resource.idle_price = instance_type.idle_price * f64::from(count);
    resource.start_time = image
        .creation_time_ms
        .saturating_sub(request.elapsed_ms())
        .max(0);
    resource.pending_modification = true;
    resource.capacity = request.core_slots.clone();

    let description = ResourceDescription::Cloud(request.description.clone());
    for core_id in request.core_slots.keys() {
        let profile = widest_implementation(&description, *core_id, catalog)
            .map(|best| instance_type.profile(*core_id, best.impl_id))
            .unwrap_or_else(Profile::default);
        resource.profiles.insert(*core_id, profile);
    }
    Some(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::{Capacity, ElasticConfig, MethodResources, OptimizationGoal};
    use elastic_provider::{CloudProvider, Image, InstanceType, LoopbackConnector};
    use elastic_scheduler::SchedulableAction;

    async fn elastic_session(max_vms: u32, goal: OptimizationGoal) -> Arc<ElasticSession> {
        let mut config = ElasticConfig::default();
        config.elasticity.max_vms = max_vms;
        config.optimization.goal = goal;
        let (session, _rx) = ElasticSession::new(config, CoreCatalog::new());
        session
            .register_core("work", vec![("work".into(), ResourceDescription::cpus(1))])
            .await
            .unwrap();
        let provider = CloudProvider::new("cloud", None, Arc::new(LoopbackConnector::new("cloud")))
            .with_instance_type(
                InstanceType::new("small", MethodResources::new(Capacity::cpus(2)), 0.5)
                    .with_idle(10.0, 0.5)
                    .with_profile(0, 0, Profile::with_average(100)),
            )
            .with_image(Image::new("base"));
        session.register_provider(provider).await.unwrap();
        Arc::new(session)
    }

    #[tokio::test]
    async fn idle_fleet_stays_unchanged() {
        let session = elastic_session(4, OptimizationGoal::Time).await;
        session.add_worker("local", ResourceDescription::cpus(1), None).await.unwrap();

        let outcome = ResourceOptimizer::new(Arc::clone(&session)).apply_policies().await.unwrap();

        assert_eq!(outcome, PolicyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn backlog_requests_an_instance_under_time_goal() {
        let session = elastic_session(4, OptimizationGoal::Time).await;
        session.add_worker("local", ResourceDescription::cpus(1), None).await.unwrap();
        for id in 1..=20 {
            session.submit(SchedulableAction::new(id, 0)).await.unwrap();
        }

        let outcome = ResourceOptimizer::new(Arc::clone(&session)).apply_policies().await.unwrap();

        let PolicyOutcome::CreationRequested(request) = outcome else {
            panic!("expected a creation request, got {outcome:?}");
        };
        assert_eq!(request.provider, "cloud");
        assert_eq!(session.providers().lock().await.pending_vm_count(), 1);
    }

    #[tokio::test]
    async fn ceiling_blocks_acquisitions() {
        let session = elastic_session(0, OptimizationGoal::Time).await;
        session.add_worker("local", ResourceDescription::cpus(1), None).await.unwrap();
        for id in 1..=20 {
            session.submit(SchedulableAction::new(id, 0)).await.unwrap();
        }

        let outcome = ResourceOptimizer::new(Arc::clone(&session)).apply_policies().await.unwrap();

        assert_eq!(outcome, PolicyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn idle_cloud_worker_is_released_under_cost_goal() {
        let session = elastic_session(4, OptimizationGoal::Cost).await;
        session.add_worker("local", ResourceDescription::cpus(1), None).await.unwrap();
        let request = {
            let catalog = session.catalog();
            let catalog = catalog.read().await;
            session
                .providers()
                .lock()
                .await
                .request_creation("cloud", "small", "base", &catalog)
                .unwrap()
                .unwrap()
        };
        session
            .creation_confirmed(request.id, "vm-1", request.description.clone())
            .await
            .unwrap();
        session.submit(SchedulableAction::new(1, 0)).await.unwrap();

        let outcome = ResourceOptimizer::new(Arc::clone(&session)).apply_policies().await.unwrap();

        assert!(
            matches!(&outcome, PolicyOutcome::WorkerReduced { worker, .. } if worker == "vm-1"),
            "unexpected outcome {outcome:?}"
        );
        assert!(session.worker("vm-1").await.is_none());
        assert_eq!(session.providers().lock().await.current_vm_count(), 0);
    }

    #[tokio::test]
    async fn sole_host_of_a_task_type_is_kept_and_the_other_released() {
        let mut config = ElasticConfig::default();
        config.elasticity.max_vms = 4;
        config.optimization.goal = OptimizationGoal::Cost;
        let (session, _rx) = ElasticSession::new(config, CoreCatalog::new());
        session
            .register_core("work", vec![("work".into(), ResourceDescription::cpus(1))])
            .await
            .unwrap();
        let licensed = MethodResources::new(Capacity::cpus(1)).with_software("sw");
        session
            .register_core("licensed", vec![("licensed".into(), ResourceDescription::Method(licensed))])
            .await
            .unwrap();
        let provider = CloudProvider::new("cloud", None, Arc::new(LoopbackConnector::new("cloud")))
            .with_instance_type(
                InstanceType::new("plain", MethodResources::new(Capacity::cpus(2)), 0.5).with_idle(10.0, 0.5),
            )
            .with_instance_type(
                InstanceType::new("licensed", MethodResources::new(Capacity::cpus(2)).with_software("sw"), 2.0)
                    .with_idle(10.0, 2.0),
            )
            .with_image(Image::new("base"));
        session.register_provider(provider).await.unwrap();
        session.add_worker("local", ResourceDescription::cpus(1), None).await.unwrap();
        let session = Arc::new(session);

        for (type_name, worker) in [("licensed", "vm-licensed"), ("plain", "vm-plain")] {
            let request = {
                let catalog = session.catalog();
                let catalog = catalog.read().await;
                session
                    .providers()
                    .lock()
                    .await
                    .request_creation("cloud", type_name, "base", &catalog)
                    .unwrap()
                    .unwrap()
            };
            session
                .creation_confirmed(request.id, worker, request.description.clone())
                .await
                .unwrap();
        }
        session.submit(SchedulableAction::new(1, 0)).await.unwrap();

        let outcome = ResourceOptimizer::new(Arc::clone(&session)).apply_policies().await.unwrap();

        assert!(
            matches!(&outcome, PolicyOutcome::WorkerReduced { worker, .. } if worker == "vm-plain"),
            "unexpected outcome {outcome:?}"
        );
        assert!(session.worker("vm-licensed").await.is_some());
        assert!(session.worker("vm-plain").await.is_none());
    }

    #[test]
    fn unknown_running_end_counts_as_free_now() {
        assert_eq!(busy_for(NEVER, 500), 0);
        assert_eq!(busy_for(800, 500), 300);
        assert_eq!(busy_for(200, 500), 0);
    }
}
