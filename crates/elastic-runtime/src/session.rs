//! Scheduler session: the context object every component works through.
//!
//! The session owns the task catalog, the shared action board, the
//! worker pool, the provider manager and one actor per worker. Callers
//! (the task engine, the optimizer loops, provider callbacks) share it
//! behind an `Arc`; it holds no lock across a call into a worker actor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use elastic_core::{
    CloudResources, CoreCatalog, CoreId, ElasticConfig, ImplId, Implementation, MoScore, ResourceDescription,
    Timestamp, WorkerRecord, NEVER,
};
use elastic_pool::{PoolState, ResourcePool};
use elastic_provider::{CloudProvider, CreationRequest, ElasticProviderManager, ManagerState};
use elastic_scheduler::{
    selection_order, ActionBoard, ActionId, BlockReason, CapacityChange, OptimizationReport, PlacementResult,
    ResourceScheduler, SchedulableAction, SchedulerError, WorkerHandle, WorkerSnapshot,
};

use crate::error::{RuntimeError, RuntimeResult};

/// An action is ready to run on `worker` with implementation `impl_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchEvent {
    pub action: ActionId,
    pub worker: String,
    pub impl_id: ImplId,
}

/// Session-level view of a submitted action.
#[derive(Debug, Clone)]
struct ActionRecord {
    action: SchedulableAction,
    worker: Option<String>,
    impl_id: Option<ImplId>,
    placement: PlacementResult,
    /// A launch event was emitted for the current placement.
    dispatched: bool,
}

/// What `reduce_worker` did to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// Verification failed; the worker is unchanged.
    Refused,
    /// The worker keeps running with less capacity.
    Shrunk,
    /// The worker is gone. Its pending actions were placed again.
    Removed { resubmitted: Vec<ActionId> },
}

struct WorkerSlot {
    handle: WorkerHandle,
    task: JoinHandle<()>,
}

/// Serializable view of the whole session for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub clock_ms: Timestamp,
    pub pool: PoolState,
    pub providers: ManagerState,
    pub workers: Vec<WorkerSnapshot>,
    pub tracked_actions: usize,
}

/// Shared state of one scheduling session.
pub struct ElasticSession {
    config: ElasticConfig,
    catalog: Arc<RwLock<CoreCatalog>>,
    board: ActionBoard,
    pool: Arc<RwLock<ResourcePool>>,
    providers: Arc<Mutex<ElasticProviderManager>>,
    workers: RwLock<BTreeMap<String, WorkerSlot>>,
    actions: RwLock<BTreeMap<ActionId, ActionRecord>>,
    data_successors: RwLock<BTreeMap<ActionId, BTreeSet<ActionId>>>,
    launches: mpsc::UnboundedSender<LaunchEvent>,
    started: Instant,
}

impl ElasticSession {
    /// Create a session. Launch events are delivered on the returned
    /// receiver.
    pub fn new(config: ElasticConfig, catalog: CoreCatalog) -> (Self, mpsc::UnboundedReceiver<LaunchEvent>) {
        let (launches, rx) = mpsc::unbounded_channel();
        let providers = ElasticProviderManager::new(config.elasticity.clone());
        let session = Self {
            config,
            catalog: Arc::new(RwLock::new(catalog)),
            board: ActionBoard::new(),
            pool: Arc::new(RwLock::new(ResourcePool::new())),
            providers: Arc::new(Mutex::new(providers)),
            workers: RwLock::new(BTreeMap::new()),
            actions: RwLock::new(BTreeMap::new()),
            data_successors: RwLock::new(BTreeMap::new()),
            launches,
            started: Instant::now(),
        };
        (session, rx)
    }

    /// Settings the session was built with.
    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    /// Session-wide timing table.
    pub fn board(&self) -> &ActionBoard {
        &self.board
    }

    /// Task types and implementations. Lock before `pool`.
    pub fn catalog(&self) -> Arc<RwLock<CoreCatalog>> {
        Arc::clone(&self.catalog)
    }

    /// The worker pool. Lock after `catalog` and before `providers`.
    pub fn pool(&self) -> Arc<RwLock<ResourcePool>> {
        Arc::clone(&self.pool)
    }

    /// The provider manager. Always the last lock taken.
    pub fn providers(&self) -> Arc<Mutex<ElasticProviderManager>> {
        Arc::clone(&self.providers)
    }

    /// Milliseconds since the session started. Every timestamp handed to
    /// a worker is on this clock.
    pub fn now_ms(&self) -> Timestamp {
        Timestamp::try_from(self.started.elapsed().as_millis()).unwrap_or(NEVER)
    }

    // ── Catalog and providers ──────────────────────────────────────

    /// Register a task type (or more variants of a known one) and refresh
    /// the pool index.
    pub async fn register_core(
        &self,
        signature: &str,
        implementations: Vec<(String, ResourceDescription)>,
    ) -> RuntimeResult<CoreId> {
        let mut catalog = self.catalog.write().await;
        let core_id = catalog.register_core(signature);
        catalog.add_implementations(core_id, implementations)?;
        self.pool.write().await.core_elements_updated(&catalog)?;
        info!(core_id, %signature, "task type registered");
        Ok(core_id)
    }

    /// Make an elastic provider available to the resource optimizer.
    pub async fn register_provider(&self, provider: CloudProvider) -> RuntimeResult<()> {
        self.providers.lock().await.register_provider(provider)?;
        Ok(())
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Handle to the actor of `name`.
    pub async fn worker(&self, name: &str) -> Option<WorkerHandle> {
        self.workers.read().await.get(name).map(|s| s.handle.clone())
    }

    /// Handles of every worker, ordered by name.
    pub async fn worker_handles(&self) -> Vec<WorkerHandle> {
        self.workers.read().await.values().map(|s| s.handle.clone()).collect()
    }

    /// Register a worker. Cloud descriptions join the pool as dynamic
    /// workers; anything else is static. `record` seeds its profiles.
    pub async fn add_worker(
        &self,
        name: &str,
        description: ResourceDescription,
        record: Option<WorkerRecord>,
    ) -> RuntimeResult<()> {
        if self.workers.read().await.contains_key(name) {
            return Err(RuntimeError::DuplicateWorker(name.to_string()));
        }

        let defaults = self.config.defaults;
        let mut scheduler = ResourceScheduler::new(
            name,
            description.clone(),
            self.board.clone(),
            defaults.idle_power_w,
            defaults.idle_price_per_h,
        );
        let cost = match description.as_cloud() {
            Some(cloud) => Some(self.cost_per_hour_of(cloud).await),
            None => None,
        };
        {
            let catalog = self.catalog.read().await;
            if let Some(record) = &record {
                scheduler.load_worker_record(&catalog, record);
            }
            let mut pool = self.pool.write().await;
            match cost {
                Some(cost) => {
                    pool.add_dynamic_worker(name, description.clone(), cost, &catalog)?;
                    pool.define_critical_set();
                }
                None => pool.add_static_worker(name, description.clone(), &catalog)?,
            }
        }

        let (handle, task) = WorkerHandle::spawn(scheduler);
        self.workers
            .write()
            .await
            .insert(name.to_string(), WorkerSlot { handle, task });
        info!(worker = %name, elastic = description.is_elastic(), "worker added");

        self.retry_blocked().await?;
        Ok(())
    }

    /// Stop a worker and hand every action it held to the remaining
    /// workers. Returns the resubmitted actions.
    pub async fn remove_worker(&self, name: &str) -> RuntimeResult<Vec<ActionId>> {
        self.stop_actor(name).await?;
        {
            let mut pool = self.pool.write().await;
            pool.delete_worker(name)?;
            pool.define_critical_set();
        }
        let resubmitted = self.resubmit_orphans(name).await;
        info!(worker = %name, resubmitted = resubmitted.len(), "worker removed");
        Ok(resubmitted)
    }

    /// Take the actor of `name` out of the session and wait for it to stop.
    async fn stop_actor(&self, name: &str) -> RuntimeResult<()> {
        let slot = self
            .workers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RuntimeError::UnknownWorker(name.to_string()))?;
        if let Err(e) = slot.handle.shutdown().await {
            warn!(worker = %name, error = %e, "worker actor already gone");
        }
        if let Err(e) = slot.task.await {
            warn!(worker = %name, error = %e, "worker actor ended abnormally");
        }
        Ok(())
    }

    /// The pool dropped `name` because it runs no task type anymore. Stop
    /// its actor, hand back what it still owns to its provider and place
    /// its actions elsewhere.
    async fn retire_worker(&self, name: &str, leftover: &CloudResources) -> RuntimeResult<Vec<ActionId>> {
        self.stop_actor(name).await?;
        if !leftover.is_empty() {
            if let Err(e) = self.providers.lock().await.destroy_resources(name, leftover) {
                warn!(worker = %name, error = %e, "releasing the leftover instances failed");
            }
        }
        let resubmitted = self.resubmit_orphans(name).await;
        info!(worker = %name, resubmitted = resubmitted.len(), "worker runs no task type anymore, retired");
        Ok(resubmitted)
    }

    /// Unlink every action assigned to `name` and place it again.
    async fn resubmit_orphans(&self, name: &str) -> Vec<ActionId> {
        let orphans: Vec<SchedulableAction> = {
            let mut actions = self.actions.write().await;
            actions
                .values_mut()
                .filter(|r| r.worker.as_deref() == Some(name))
                .map(|r| {
                    r.worker = None;
                    r.impl_id = None;
                    r.dispatched = false;
                    self.board.mark_unscheduled(r.action.id);
                    r.action.clone()
                })
                .collect()
        };

        let mut resubmitted = Vec::with_capacity(orphans.len());
        for action in orphans {
            let id = action.id;
            match self.place(action).await {
                Ok(_) => resubmitted.push(id),
                Err(e) => warn!(action = id, error = %e, "orphaned action could not be placed"),
            }
        }
        resubmitted
    }

    async fn cost_per_hour_of(&self, cloud: &CloudResources) -> f64 {
        let providers = self.providers.lock().await;
        let Ok(provider) = providers.provider(&cloud.provider) else {
            return 0.0;
        };
        cloud
            .composition
            .iter()
            .map(|(type_name, component)| {
                provider
                    .instance_cost_per_hour(type_name, &cloud.image)
                    .map_or(0.0, |price| price * f64::from(component.count))
            })
            .sum()
    }

    // ── Task engine interface ──────────────────────────────────────

    /// Place a new action on the best scoring worker and implementation.
    pub async fn submit(&self, action: SchedulableAction) -> RuntimeResult<PlacementResult> {
        if self.actions.read().await.contains_key(&action.id) {
            return Err(RuntimeError::DuplicateAction(action.id));
        }
        {
            let mut successors = self.data_successors.write().await;
            for pred in &action.data_predecessors {
                successors.entry(*pred).or_default().insert(action.id);
            }
        }
        self.board.register(action.id);
        self.place(action).await
    }

    /// Score every compatible (worker, implementation) pair and schedule
    /// on the best one.
    async fn place(&self, action: SchedulableAction) -> RuntimeResult<PlacementResult> {
        let implementations: Vec<Implementation> =
            self.catalog.read().await.implementations(action.core_id).to_vec();
        let compatible = self.pool.read().await.compatible_workers(action.core_id);
        let handles: Vec<WorkerHandle> = {
            let workers = self.workers.read().await;
            compatible
                .iter()
                .filter_map(|name| workers.get(name).map(|s| s.handle.clone()))
                .collect()
        };
        let data_available = self.board.data_ready_time(&action.data_predecessors);
        let goal = self.config.optimization.goal;

        let mut best: Option<(MoScore, &WorkerHandle, &Implementation)> = None;
        for handle in &handles {
            for implementation in &implementations {
                let score = match handle
                    .score(action.clone(), implementation.clone(), data_available, 0)
                    .await
                {
                    Ok(Some(score)) => score,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(worker = %handle.name(), error = %e, "worker skipped while scoring");
                        continue;
                    }
                };
                if MoScore::is_better_opt(Some(&score), best.as_ref().map(|(s, _, _)| s), goal) {
                    best = Some((score, handle, implementation));
                }
            }
        }

        let Some((_, handle, implementation)) = best else {
            warn!(action = action.id, core_id = action.core_id, "no worker can run action");
            return Err(RuntimeError::NoCompatibleWorker(action.core_id));
        };
        self.schedule_on(handle, action, implementation.clone()).await
    }

    /// Schedule `action` on a specific worker and emit its launch event if
    /// it can start right away.
    pub(crate) async fn schedule_on(
        &self,
        handle: &WorkerHandle,
        action: SchedulableAction,
        implementation: Implementation,
    ) -> RuntimeResult<PlacementResult> {
        let id = action.id;
        let result = handle.schedule(action.clone(), implementation.clone()).await?;
        if let PlacementResult::Failed(reason) = &result {
            warn!(worker = %handle.name(), action = id, %reason, "placement failed");
            return Ok(result);
        }

        self.actions.write().await.insert(
            id,
            ActionRecord {
                action,
                worker: Some(handle.name().to_string()),
                impl_id: Some(implementation.impl_id),
                placement: result.clone(),
                dispatched: false,
            },
        );
        debug!(worker = %handle.name(), action = id, ?result, "action scheduled");

        if result.is_placed() {
            self.launch_ready(handle, vec![id]).await?;
        }
        Ok(result)
    }

    /// Emit launch events for the actions in `ids` that `handle` reports
    /// as executable and that were not dispatched yet.
    pub(crate) async fn launch_ready(&self, handle: &WorkerHandle, ids: Vec<ActionId>) -> RuntimeResult<Vec<ActionId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ready = handle.executable(ids).await?;
        let mut launched = Vec::new();
        let mut actions = self.actions.write().await;
        for id in ready {
            let Some(record) = actions.get_mut(&id) else {
                continue;
            };
            if record.dispatched || record.worker.as_deref() != Some(handle.name()) {
                continue;
            }
            let Some(impl_id) = record.impl_id else {
                continue;
            };
            record.dispatched = true;
            let event = LaunchEvent {
                action: id,
                worker: handle.name().to_string(),
                impl_id,
            };
            if self.launches.send(event).is_err() {
                debug!(action = id, "launch receiver dropped");
            }
            info!(worker = %handle.name(), action = id, impl_id, "action ready to launch");
            launched.push(id);
        }
        Ok(launched)
    }

    /// The task engine started action `id`.
    pub async fn notify_launched(&self, id: ActionId) -> RuntimeResult<()> {
        let handle = self.handle_of(id).await?;
        handle.launched(id, self.now_ms()).await?;
        Ok(())
    }

    /// An action finished. Returns the actions launched as a result.
    pub async fn notify_completion(&self, id: ActionId) -> RuntimeResult<Vec<ActionId>> {
        let handle = self.handle_of(id).await?;
        let freed = handle.completed(id, self.now_ms()).await?;
        self.actions.write().await.remove(&id);

        let mut launched = self.launch_ready(&handle, freed).await?;

        let successors = self.data_successors.write().await.remove(&id).unwrap_or_default();
        let mut by_worker: BTreeMap<String, Vec<ActionId>> = BTreeMap::new();
        {
            let actions = self.actions.read().await;
            for succ in successors {
                if let Some(worker) = actions.get(&succ).and_then(|r| r.worker.clone()) {
                    by_worker.entry(worker).or_default().push(succ);
                }
            }
        }
        for (worker, ids) in by_worker {
            if let Some(succ_handle) = self.worker(&worker).await {
                launched.extend(self.launch_ready(&succ_handle, ids).await?);
            }
        }
        debug!(worker = %handle.name(), action = id, launched = launched.len(), "completion processed");
        Ok(launched)
    }

    /// Actions no worker can place right now, in selection order.
    pub async fn blocked_actions(&self) -> RuntimeResult<Vec<SchedulableAction>> {
        let mut blocked = Vec::new();
        for handle in self.worker_handles().await {
            match handle.blocked_actions().await {
                Ok(mut actions) => blocked.append(&mut actions),
                Err(SchedulerError::WorkerGone(worker)) => debug!(%worker, "worker gone while listing"),
                Err(e) => return Err(e.into()),
            }
        }
        blocked.sort_by(selection_order);
        blocked.dedup_by_key(|a| a.id);
        Ok(blocked)
    }

    /// Worker currently holding `id`.
    pub async fn worker_of(&self, id: ActionId) -> Option<String> {
        self.actions.read().await.get(&id).and_then(|r| r.worker.clone())
    }

    /// Whether a launch event was emitted for the current placement of
    /// `id`.
    pub async fn is_dispatched(&self, id: ActionId) -> bool {
        self.actions.read().await.get(&id).is_some_and(|r| r.dispatched)
    }

    async fn handle_of(&self, id: ActionId) -> RuntimeResult<WorkerHandle> {
        let worker = self.worker_of(id).await.ok_or(RuntimeError::UnknownAction(id))?;
        self.worker(&worker).await.ok_or(RuntimeError::UnknownWorker(worker))
    }

    /// Give parked actions another chance after capacity appeared.
    async fn retry_blocked(&self) -> RuntimeResult<()> {
        let parked: Vec<(SchedulableAction, String)> = self
            .actions
            .read()
            .await
            .values()
            .filter(|r| !r.dispatched && r.placement == PlacementResult::Blocked(BlockReason::Resources))
            .filter_map(|r| r.worker.clone().map(|w| (r.action.clone(), w)))
            .collect();
        for (action, worker) in parked {
            let Some(handle) = self.worker(&worker).await else {
                continue;
            };
            match handle.unschedule(action.id).await {
                Ok(_) | Err(SchedulerError::ActionNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            let id = action.id;
            debug!(action = id, from = %worker, "retrying parked action");
            if let Err(e) = self.place(action).await {
                warn!(action = id, error = %e, "parked action could not be placed");
            }
        }
        Ok(())
    }

    // ── Optimizer support ──────────────────────────────────────────

    /// Run a local optimization on one worker and launch what it frees.
    pub(crate) async fn optimize_worker(
        &self,
        handle: &WorkerHandle,
        update_id: Timestamp,
    ) -> RuntimeResult<OptimizationReport> {
        let report = handle.optimize(update_id).await?;
        {
            let mut actions = self.actions.write().await;
            for (id, result) in &report.replayed {
                if let Some(record) = actions.get_mut(id) {
                    record.placement = result.clone();
                }
            }
        }
        self.launch_ready(handle, report.launchable.clone()).await?;
        Ok(report)
    }

    /// Move a pending action from `from` to `to`. Returns false when the
    /// action already left `from` or was dispatched.
    pub(crate) async fn migrate(
        &self,
        id: ActionId,
        from: &WorkerHandle,
        to: &WorkerHandle,
        implementation: Implementation,
    ) -> RuntimeResult<bool> {
        let action = {
            let actions = self.actions.read().await;
            match actions.get(&id) {
                Some(r) if !r.dispatched && r.worker.as_deref() == Some(from.name()) => r.action.clone(),
                _ => return Ok(false),
            }
        };
        let freed = match from.unschedule(id).await {
            Ok(freed) => freed,
            Err(SchedulerError::ActionNotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.launch_ready(from, freed).await?;

        let result = self.schedule_on(to, action.clone(), implementation).await?;
        if matches!(result, PlacementResult::Failed(_)) {
            self.place(action).await?;
        }
        info!(action = id, from = %from.name(), to = %to.name(), "action migrated");
        Ok(true)
    }

    // ── Elasticity callbacks ───────────────────────────────────────

    /// A pending creation materialized as `worker`. A worker that already
    /// exists is extended.
    pub async fn creation_confirmed(
        &self,
        request_id: u64,
        worker: &str,
        granted: CloudResources,
    ) -> RuntimeResult<()> {
        let request = self
            .providers
            .lock()
            .await
            .confirmed_request(request_id, worker, &granted)?;

        let Some(handle) = self.worker(worker).await else {
            let record = self.instance_record(&request).await;
            return self
                .add_worker(worker, ResourceDescription::Cloud(granted), Some(record))
                .await;
        };

        let mut extended = {
            let pool = self.pool.read().await;
            let current = pool
                .find_worker(worker)
                .ok_or_else(|| RuntimeError::UnknownWorker(worker.to_string()))?;
            current
                .description
                .as_cloud()
                .cloned()
                .ok_or_else(|| RuntimeError::NotElastic(worker.to_string()))?
        };
        extended.increase(&granted);
        handle
            .resize(CapacityChange::Increase {
                extra: granted.base.capacity,
                description: ResourceDescription::Cloud(extended.clone()),
            })
            .await?;
        let cost = self.cost_per_hour_of(&extended).await;
        let kept = {
            let catalog = self.catalog.read().await;
            let mut pool = self.pool.write().await;
            let kept =
                pool.update_dynamic_worker(worker, ResourceDescription::Cloud(extended.clone()), cost, &catalog)?;
            pool.define_critical_set();
            kept
        };
        if !kept {
            self.retire_worker(worker, &extended).await?;
            return self.retry_blocked().await;
        }
        info!(%worker, request = request_id, "worker extended");
        self.retry_blocked().await
    }

    /// A pending creation will never materialize.
    pub async fn creation_refused(&self, request_id: u64) -> RuntimeResult<()> {
        self.providers.lock().await.refused_request(request_id)?;
        Ok(())
    }

    /// Profiles and idle rates a new worker inherits from its instance
    /// type.
    async fn instance_record(&self, request: &CreationRequest) -> WorkerRecord {
        let instance_type = {
            let providers = self.providers.lock().await;
            match providers
                .provider(&request.provider)
                .and_then(|p| p.instance_type(&request.type_name))
            {
                Ok(instance_type) => instance_type.clone(),
                Err(_) => return WorkerRecord::default(),
            }
        };
        let catalog = self.catalog.read().await;
        let mut record = WorkerRecord {
            idle_power: Some(instance_type.idle_power),
            idle_price: Some(instance_type.idle_price),
            ..WorkerRecord::default()
        };
        for (core_id, by_impl) in &instance_type.profiles {
            for (impl_id, profile) in by_impl {
                if let Ok(implementation) = catalog.implementation(*core_id, *impl_id) {
                    record
                        .implementations
                        .insert(implementation.signature.clone(), profile.to_record());
                }
            }
        }
        record
    }

    /// Remove `reduction` from an elastic worker.
    ///
    /// The removal is verified first: a critical worker must stay
    /// replaceable, the capacity must be free, and a worker that would
    /// vanish must run nothing. A provider failure leaves the worker as it
    /// was. A worker left too small for every task type is retired.
    pub async fn reduce_worker(&self, worker: &str, reduction: &CloudResources) -> RuntimeResult<Reduction> {
        let (original, reduced) = {
            let catalog = self.catalog.read().await;
            let pool = self.pool.read().await;
            let current = pool
                .find_worker(worker)
                .ok_or_else(|| RuntimeError::UnknownWorker(worker.to_string()))?;
            let original = current
                .description
                .as_cloud()
                .cloned()
                .ok_or_else(|| RuntimeError::NotElastic(worker.to_string()))?;
            let mut reduced = original.clone();
            reduced.reduce(reduction);
            if !pool.is_critical_removal_safe(worker, &ResourceDescription::Cloud(reduced.clone()), &catalog) {
                debug!(%worker, "reduction would leave a task type without a critical host");
                return Ok(Reduction::Refused);
            }
            (original, reduced)
        };
        let handle = self
            .worker(worker)
            .await
            .ok_or_else(|| RuntimeError::UnknownWorker(worker.to_string()))?;

        if reduced.is_empty() {
            let snapshot = handle.snapshot().await?;
            if snapshot.implementations.iter().any(|s| s.running > 0) {
                debug!(%worker, "worker still runs actions, not destroyed");
                return Ok(Reduction::Refused);
            }
            self.providers.lock().await.destroy_resources(worker, reduction)?;
            let resubmitted = self.remove_worker(worker).await?;
            info!(%worker, "worker destroyed");
            return Ok(Reduction::Removed { resubmitted });
        }

        let applied = handle
            .resize(CapacityChange::Reduce {
                removed: reduction.base.capacity,
                description: ResourceDescription::Cloud(reduced.clone()),
            })
            .await?;
        if !applied {
            debug!(%worker, "capacity to remove is in use");
            return Ok(Reduction::Refused);
        }
        let destroyed = self.providers.lock().await.destroy_resources(worker, reduction);
        if let Err(e) = destroyed {
            handle
                .resize(CapacityChange::Increase {
                    extra: reduction.base.capacity,
                    description: ResourceDescription::Cloud(original),
                })
                .await?;
            return Err(e.into());
        }

        let cost = self.cost_per_hour_of(&reduced).await;
        let kept = {
            let catalog = self.catalog.read().await;
            let mut pool = self.pool.write().await;
            let kept =
                pool.update_dynamic_worker(worker, ResourceDescription::Cloud(reduced.clone()), cost, &catalog)?;
            pool.define_critical_set();
            kept
        };
        if !kept {
            let resubmitted = self.retire_worker(worker, &reduced).await?;
            return Ok(Reduction::Removed { resubmitted });
        }
        info!(%worker, vms = reduction.vm_count(), "worker reduced");
        Ok(Reduction::Shrunk)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Snapshot of the pool, the providers and every worker.
    pub async fn state(&self) -> RuntimeResult<SessionState> {
        let mut workers = Vec::new();
        for handle in self.worker_handles().await {
            workers.push(handle.snapshot().await?);
        }
        Ok(SessionState {
            clock_ms: self.now_ms(),
            pool: self.pool.read().await.current_state(),
            providers: self.providers.lock().await.current_state(),
            workers,
            tracked_actions: self.actions.read().await.len(),
        })
    }

    /// Stop every worker actor and release every elastic instance.
    pub async fn shutdown(&self) -> Vec<WorkerSnapshot> {
        let slots: Vec<(String, WorkerSlot)> = std::mem::take(&mut *self.workers.write().await)
            .into_iter()
            .collect();
        let mut snapshots = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            match slot.handle.shutdown().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(worker = %name, error = %e, "worker actor already gone"),
            }
            if let Err(e) = slot.task.await {
                warn!(worker = %name, error = %e, "worker actor ended abnormally");
            }
        }
        if let Err(e) = self.providers.lock().await.terminate_all() {
            warn!(error = %e, "failed to terminate elastic instances");
        }
        info!(workers = snapshots.len(), "session shut down");
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::{Capacity, MethodResources};
    use elastic_provider::{Image, InstanceType, LoopbackConnector};

    async fn make_session() -> (ElasticSession, mpsc::UnboundedReceiver<LaunchEvent>) {
        let (session, rx) = ElasticSession::new(ElasticConfig::default(), CoreCatalog::new());
        session
            .register_core("work", vec![("work".into(), ResourceDescription::cpus(1))])
            .await
            .unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn submit_launches_free_action() {
        let (session, mut rx) = make_session().await;
        session.add_worker("w1", ResourceDescription::cpus(2), None).await.unwrap();

        let result = session.submit(SchedulableAction::new(1, 0)).await.unwrap();

        assert!(result.is_placed());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, 1);
        assert_eq!(event.worker, "w1");
        assert!(session.is_dispatched(1).await);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let (session, _rx) = make_session().await;
        session.add_worker("w1", ResourceDescription::cpus(2), None).await.unwrap();
        session.submit(SchedulableAction::new(1, 0)).await.unwrap();

        assert!(matches!(
            session.submit(SchedulableAction::new(1, 0)).await,
            Err(RuntimeError::DuplicateAction(1))
        ));
    }

    #[tokio::test]
    async fn submit_without_workers_fails() {
        let (session, _rx) = make_session().await;
        assert!(matches!(
            session.submit(SchedulableAction::new(1, 0)).await,
            Err(RuntimeError::NoCompatibleWorker(0))
        ));
    }

    #[tokio::test]
    async fn completion_launches_resource_successor() {
        let (session, mut rx) = make_session().await;
        session.add_worker("w1", ResourceDescription::cpus(1), None).await.unwrap();
        session.submit(SchedulableAction::new(1, 0)).await.unwrap();
        session.submit(SchedulableAction::new(2, 0)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().action, 1);

        session.notify_launched(1).await.unwrap();
        let launched = session.notify_completion(1).await.unwrap();

        assert_eq!(launched, vec![2]);
        assert_eq!(rx.recv().await.unwrap().action, 2);
    }

    #[tokio::test]
    async fn completion_launches_data_successor() {
        let (session, mut rx) = make_session().await;
        session.add_worker("w1", ResourceDescription::cpus(1), None).await.unwrap();
        session.submit(SchedulableAction::new(1, 0)).await.unwrap();
        session.add_worker("w2", ResourceDescription::cpus(1), None).await.unwrap();
        session
            .submit(SchedulableAction::new(2, 0).with_predecessors(vec![1]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().action, 1);
        assert!(!session.is_dispatched(2).await);

        session.notify_launched(1).await.unwrap();
        let launched = session.notify_completion(1).await.unwrap();

        assert_eq!(launched, vec![2]);
    }

    #[tokio::test]
    async fn removed_worker_hands_actions_over() {
        let (session, _rx) = make_session().await;
        session.add_worker("w1", ResourceDescription::cpus(1), None).await.unwrap();
        session.submit(SchedulableAction::new(1, 0)).await.unwrap();
        session.add_worker("w2", ResourceDescription::cpus(1), None).await.unwrap();

        let resubmitted = session.remove_worker("w1").await.unwrap();

        assert_eq!(resubmitted, vec![1]);
        assert_eq!(session.worker_of(1).await.as_deref(), Some("w2"));
        assert!(session.pool().read().await.find_worker("w1").is_none());
    }

    #[tokio::test]
    async fn confirmed_creation_adds_dynamic_worker() {
        let (session, _rx) = make_session().await;
        let provider = CloudProvider::new("cloud", None, Arc::new(LoopbackConnector::new("cloud")))
            .with_instance_type(
                InstanceType::new("small", MethodResources::new(Capacity::cpus(2)), 0.2).with_idle(5.0, 0.01),
            )
            .with_image(Image::new("base"));
        session.register_provider(provider).await.unwrap();

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

        let snapshot = session.worker("vm-1").await.unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.capacity, Capacity::cpus(2));
        assert!((snapshot.idle_power - 5.0).abs() < 1e-9);
        let pool = session.pool();
        let pool = pool.read().await;
        assert_eq!(pool.dynamic_workers().len(), 1);
        assert_eq!(pool.core_max_task_count(0), 2);
    }

    #[tokio::test]
    async fn worker_too_small_for_every_task_type_is_retired() {
        let (session, _rx) = ElasticSession::new(ElasticConfig::default(), CoreCatalog::new());
        session
            .register_core("wide", vec![("wide".into(), ResourceDescription::cpus(2))])
            .await
            .unwrap();
        session.add_worker("local", ResourceDescription::cpus(2), None).await.unwrap();
        let provider = CloudProvider::new("cloud", None, Arc::new(LoopbackConnector::new("cloud")))
            .with_instance_type(InstanceType::new("large", MethodResources::new(Capacity::cpus(2)), 0.4))
            .with_instance_type(InstanceType::new("small", MethodResources::new(Capacity::cpus(1)), 0.1))
            .with_image(Image::new("base"));
        session.register_provider(provider).await.unwrap();

        let mut granted = Vec::new();
        for type_name in ["large", "small"] {
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
                .creation_confirmed(request.id, "vm-1", request.description.clone())
                .await
                .unwrap();
            granted.push(request.description);
        }

        // One cpu is left: nothing runs on it.
        let outcome = session.reduce_worker("vm-1", &granted[0]).await.unwrap();

        assert_eq!(outcome, Reduction::Removed { resubmitted: vec![] });
        assert!(session.worker("vm-1").await.is_none());
        assert!(session.worker_handles().await.iter().all(|h| h.name() != "vm-1"));
        let state = session.state().await.unwrap();
        assert!(state.workers.iter().all(|w| w.worker != "vm-1"));
        assert!(session.pool().read().await.find_worker("vm-1").is_none());
        assert_eq!(session.providers().lock().await.current_vm_count(), 0);

        session.submit(SchedulableAction::new(1, 0)).await.unwrap();
        assert_eq!(session.worker_of(1).await.as_deref(), Some("local"));
    }
}
