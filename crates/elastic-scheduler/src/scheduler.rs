//! Resource scheduler: the gap timeline of one worker plus the actions
//! placed on it.
//!
//! All operations are synchronous and take `&mut self`; cross-thread
//! access goes through the worker actor in `worker.rs`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use elastic_core::{
    Capacity, CoreCatalog, CoreId, ImplId, Implementation, MoScore, Profile, ResourceDescription, Timestamp,
    WorkerRecord, NEVER, ORIGIN,
};

use crate::action::{selection_order, ActionId, ActionState, BlockReason, PlacementResult, SchedulableAction};
use crate::board::{ActionBoard, ActionTiming};
use crate::error::{SchedulerError, SchedulerResult};
use crate::gap::{Gap, GapTimeline};
use crate::simulation::{simulate_local, OptimizationInput, OptimizationOutcome, SimAction};

/// An action tracked by a worker, placed or parked.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub action: SchedulableAction,
    pub implementation: Implementation,
    pub requirements: Capacity,
    pub state: ActionState,
    pub expected_start: Timestamp,
    pub expected_end: Timestamp,
    /// Pieces of capacity this action waits for, keyed by their origin.
    pub predecessors: Vec<Gap>,
    /// Actions waiting for capacity this action will release.
    pub successors: BTreeSet<ActionId>,
    pub started_at: Option<Timestamp>,
    charged_energy: f64,
    charged_cost: f64,
}

impl ScheduledEntry {
    fn new(action: SchedulableAction, implementation: Implementation) -> Self {
        let requirements = implementation.requirements.capacity();
        Self {
            action,
            implementation,
            requirements,
            state: ActionState::ResourceBlocked,
            expected_start: NEVER,
            expected_end: NEVER,
            predecessors: Vec::new(),
            successors: BTreeSet::new(),
            started_at: None,
            charged_energy: 0.0,
            charged_cost: 0.0,
        }
    }

    fn key(&self) -> (CoreId, ImplId) {
        (self.action.core_id, self.implementation.impl_id)
    }

    /// Whether the task engine started this action.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Waiting on capacity held by other actions of this worker.
    pub fn waits_for_resources(&self) -> bool {
        self.predecessors.iter().any(|p| p.origin.is_some())
    }
}

/// Energy, cost and workload counters consumed by the optimizers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accounting {
    pub pending_energy: f64,
    pub pending_cost: f64,
    pub run_energy: f64,
    pub run_cost: f64,
    pub running_energy: f64,
    pub running_cost: f64,
    pub end_running: Timestamp,
    /// Exported per implementation through `ImplementationStats`.
    #[serde(skip)]
    pub scheduled: BTreeMap<(CoreId, ImplId), u32>,
    #[serde(skip)]
    pub running: BTreeMap<(CoreId, ImplId), u32>,
}

fn bump(counts: &mut BTreeMap<(CoreId, ImplId), u32>, key: (CoreId, ImplId)) {
    *counts.entry(key).or_default() += 1;
}

fn drop_one(counts: &mut BTreeMap<(CoreId, ImplId), u32>, key: (CoreId, ImplId)) {
    if let Some(count) = counts.get_mut(&key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&key);
        }
    }
}

/// Shift a simulation-relative time back onto the session clock.
fn shift(t: Timestamp, by: Timestamp) -> Timestamp {
    if t == NEVER || t == ORIGIN { t } else { t.saturating_add(by) }
}

#[derive(Debug, Default)]
struct PendingWork {
    schedulings: Vec<(SchedulableAction, Implementation)>,
    unschedulings: Vec<ActionId>,
    completed: Vec<ActionId>,
}

/// Per-implementation statistics exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationStats {
    pub core_id: CoreId,
    pub impl_id: ImplId,
    pub scheduled: u32,
    pub running: u32,
    pub profile: Profile,
}

/// Serializable view of a worker for the optimizers and monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker: String,
    pub description: ResourceDescription,
    pub capacity: Capacity,
    pub idle_power: f64,
    pub idle_price: f64,
    pub epoch: Timestamp,
    pub donation_indicator: Timestamp,
    pub accounting: Accounting,
    pub implementations: Vec<ImplementationStats>,
    pub gaps: Vec<Gap>,
    pub scheduled_actions: usize,
    pub blocked_actions: usize,
}

impl WorkerSnapshot {
    /// Counters of one implementation on this worker.
    pub fn stats(&self, core_id: CoreId, impl_id: ImplId) -> Option<&ImplementationStats> {
        self.implementations
            .iter()
            .find(|s| s.core_id == core_id && s.impl_id == impl_id)
    }
}

/// A pending action this worker could hand to another worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DonationCandidate {
    pub action: SchedulableAction,
    pub impl_id: ImplId,
    pub expected_start: Timestamp,
    pub expected_end: Timestamp,
}

/// Result of installing a local optimization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationReport {
    /// Actions that can be handed to the worker right away.
    pub launchable: Vec<ActionId>,
    /// Schedulings that arrived during the optimization, replayed.
    pub replayed: Vec<(ActionId, PlacementResult)>,
    pub donation_queue: Vec<DonationCandidate>,
}

/// Timeline, placed actions and accounting of one worker.
pub struct ResourceScheduler {
    worker: String,
    description: ResourceDescription,
    capacity: Capacity,
    board: ActionBoard,
    timeline: GapTimeline,
    actions: BTreeMap<ActionId, ScheduledEntry>,
    profiles: HashMap<(CoreId, ImplId), Profile>,
    idle_power: f64,
    idle_price: f64,
    pending: Option<PendingWork>,
    accounting: Accounting,
    epoch: Timestamp,
}

impl ResourceScheduler {
    /// A scheduler for `worker` whose whole capacity is free from now on.
    pub fn new(
        worker: impl Into<String>,
        description: ResourceDescription,
        board: ActionBoard,
        idle_power: f64,
        idle_price: f64,
    ) -> Self {
        let capacity = description.capacity();
        Self {
            worker: worker.into(),
            description,
            capacity,
            board,
            timeline: GapTimeline::new(capacity),
            actions: BTreeMap::new(),
            profiles: HashMap::new(),
            idle_power,
            idle_price,
            pending: None,
            accounting: Accounting::default(),
            epoch: 0,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn description(&self) -> &ResourceDescription {
        &self.description
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// The current gap timeline.
    pub fn timeline(&self) -> &GapTimeline {
        &self.timeline
    }

    pub fn accounting(&self) -> &Accounting {
        &self.accounting
    }

    /// Placement record of `id` on this worker.
    pub fn entry(&self, id: ActionId) -> Option<&ScheduledEntry> {
        self.actions.get(&id)
    }

    /// Whether a local optimization is in progress.
    pub fn is_optimizing(&self) -> bool {
        self.pending.is_some()
    }

    /// Recorded profile of an implementation, or the default estimate.
    pub fn profile(&self, core_id: CoreId, impl_id: ImplId) -> Profile {
        self.profiles.get(&(core_id, impl_id)).copied().unwrap_or_default()
    }

    /// Replace the profile of an implementation.
    pub fn set_profile(&mut self, core_id: CoreId, impl_id: ImplId, profile: Profile) {
        self.profiles.insert((core_id, impl_id), profile);
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Reserve the earliest slot for `action` that covers the
    /// requirements of `implementation`, or park it.
    pub fn schedule_action(&mut self, action: SchedulableAction, implementation: &Implementation) -> PlacementResult {
        let id = action.id;
        let queued = self
            .pending
            .as_ref()
            .is_some_and(|p| p.schedulings.iter().any(|(a, _)| a.id == id));
        if self.actions.contains_key(&id) || queued {
            return PlacementResult::Failed(SchedulerError::AlreadyScheduled(id).to_string());
        }
        if implementation.core_id != action.core_id || !self.description.can_host_static(&implementation.requirements) {
            let err = SchedulerError::NotHostable {
                worker: self.worker.clone(),
                core_id: implementation.core_id,
                impl_id: implementation.impl_id,
            };
            return PlacementResult::Failed(err.to_string());
        }

        if let Some(pending) = self.pending.as_mut() {
            debug!(worker = %self.worker, action = id, "optimization in progress, deferring placement");
            pending.schedulings.push((action, implementation.clone()));
            return PlacementResult::Deferred;
        }

        self.schedule_using_gaps(action, implementation.clone())
    }

    fn schedule_using_gaps(&mut self, action: SchedulableAction, implementation: Implementation) -> PlacementResult {
        let id = action.id;
        let data_ready = self.board.data_ready_time(&action.data_predecessors);
        let mut entry = ScheduledEntry::new(action, implementation);

        if data_ready == NEVER {
            entry.state = ActionState::DataBlocked;
            return self.park(entry, BlockReason::Data);
        }

        let (pieces, covered) = self.timeline.take_for(&entry.requirements, data_ready);
        if !covered {
            for piece in pieces {
                self.timeline.add_gap(piece);
            }
            entry.state = ActionState::ResourceBlocked;
            return self.park(entry, BlockReason::Resources);
        }

        let mut start = data_ready;
        for piece in pieces {
            let Some(origin) = piece.origin else {
                continue;
            };
            start = start.max(piece.start);
            if let Some(pred) = self.actions.get_mut(&origin) {
                pred.successors.insert(id);
            }
            entry.predecessors.push(piece);
        }

        let profile = self.profile(entry.action.core_id, entry.implementation.impl_id);
        let end = start.saturating_add(profile.avg_time);
        let release = if entry.action.releases_resources { end } else { NEVER };
        self.timeline.add_gap(Gap::new(release, NEVER, Some(id), entry.requirements));

        entry.state = ActionState::Timeline;
        entry.expected_start = start;
        entry.expected_end = end;
        entry.charged_energy = profile.energy_per_run();
        entry.charged_cost = profile.cost_per_run();
        self.accounting.pending_energy += entry.charged_energy;
        self.accounting.pending_cost += entry.charged_cost;
        bump(&mut self.accounting.scheduled, entry.key());

        debug!(
            worker = %self.worker,
            action = id,
            impl_id = entry.implementation.impl_id,
            start,
            end,
            waits = entry.predecessors.len(),
            "action placed"
        );
        self.publish(&entry);
        self.actions.insert(id, entry);
        PlacementResult::Placed { start, end }
    }

    fn park(&mut self, entry: ScheduledEntry, reason: BlockReason) -> PlacementResult {
        info!(worker = %self.worker, action = entry.action.id, ?reason, "action blocked");
        self.publish(&entry);
        self.actions.insert(entry.action.id, entry);
        PlacementResult::Blocked(reason)
    }

    fn publish(&self, entry: &ScheduledEntry) {
        self.board.publish(
            entry.action.id,
            ActionTiming {
                worker: Some(self.worker.clone()),
                expected_start: entry.expected_start,
                expected_end: entry.expected_end,
                scheduled: true,
            },
        );
    }

    /// Remove an action, handing the capacity it held to the actions that
    /// waited for it. Returns the actions left with nothing to wait for.
    pub fn unschedule_action(&mut self, id: ActionId) -> SchedulerResult<Vec<ActionId>> {
        if let Some(pending) = self.pending.as_mut() {
            if let Some(pos) = pending.schedulings.iter().position(|(a, _)| a.id == id) {
                pending.schedulings.remove(pos);
                return Ok(Vec::new());
            }
            if !self.actions.contains_key(&id) {
                return Err(SchedulerError::ActionNotFound(id));
            }
            if !pending.unschedulings.contains(&id) {
                pending.unschedulings.push(id);
            }
            return Ok(Vec::new());
        }
        self.remove_action(id)
    }

    fn remove_action(&mut self, id: ActionId) -> SchedulerResult<Vec<ActionId>> {
        let entry = self.actions.remove(&id).ok_or(SchedulerError::ActionNotFound(id))?;
        self.release_accounting(&entry);
        self.board.mark_unscheduled(id);

        if entry.state != ActionState::Timeline {
            debug!(worker = %self.worker, action = id, "blocked action unscheduled");
            return Ok(Vec::new());
        }

        // Capacity the action holds: the pieces it waits for plus what it
        // took from free gaps.
        let mut resources: Vec<Gap> = Vec::new();
        let mut linked = Capacity::EMPTY;
        for piece in &entry.predecessors {
            if let Some(pred) = piece.origin.and_then(|origin| self.actions.get_mut(&origin)) {
                pred.successors.remove(&id);
            }
            linked.increase(&piece.resources);
            resources.push(Gap::new(piece.start, NEVER, piece.origin, piece.resources));
        }
        let mut unassigned = entry.requirements;
        unassigned.reduce(&linked);
        if unassigned.is_consuming() {
            resources.push(Gap::free(unassigned));
        }

        let mut links: Vec<(ActionId, ActionId)> = Vec::new();
        let mut freed = Vec::new();
        for succ_id in &entry.successors {
            let Some(succ) = self.actions.get_mut(succ_id) else {
                continue;
            };
            let mut to_cover = Capacity::EMPTY;
            succ.predecessors.retain(|p| {
                if p.origin == Some(id) {
                    to_cover.increase(&p.resources);
                    false
                } else {
                    true
                }
            });
            for res in resources.iter_mut() {
                if to_cover.is_useless() {
                    break;
                }
                let used = Capacity::reduce_common(&mut res.resources, &mut to_cover);
                if let (true, Some(origin)) = (used.is_consuming(), res.origin) {
                    succ.predecessors.push(Gap::new(res.start, NEVER, Some(origin), used));
                    links.push((origin, *succ_id));
                }
            }
            resources.retain(|r| r.resources.is_consuming());
            if !succ.waits_for_resources() && !succ.is_running() {
                freed.push(*succ_id);
            }
        }
        for (origin, succ_id) in links {
            if let Some(pred) = self.actions.get_mut(&origin) {
                pred.successors.insert(succ_id);
            }
        }

        self.timeline.remove_origin(id);
        for residual in resources {
            self.timeline.add_gap(residual);
        }

        debug!(worker = %self.worker, action = id, freed = freed.len(), "action unscheduled");
        Ok(freed)
    }

    fn release_accounting(&mut self, entry: &ScheduledEntry) {
        if entry.state != ActionState::Timeline {
            return;
        }
        self.accounting.pending_energy -= entry.charged_energy;
        self.accounting.pending_cost -= entry.charged_cost;
        drop_one(&mut self.accounting.scheduled, entry.key());
        if entry.is_running() {
            drop_one(&mut self.accounting.running, entry.key());
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// The task engine started `id` at `started_at`.
    pub fn action_launched(&mut self, id: ActionId, started_at: Timestamp) -> SchedulerResult<()> {
        let entry = self.actions.get_mut(&id).ok_or(SchedulerError::ActionNotFound(id))?;
        if entry.started_at.is_none() {
            entry.started_at = Some(started_at);
            let key = entry.key();
            bump(&mut self.accounting.running, key);
            debug!(worker = %self.worker, action = id, started_at, "action launched");
        }
        Ok(())
    }

    /// Fold the measured run into the profiles and drop the action.
    pub fn action_completed(&mut self, id: ActionId, finished_at: Timestamp) -> SchedulerResult<Vec<ActionId>> {
        let entry = self.actions.get(&id).ok_or(SchedulerError::ActionNotFound(id))?;
        let key = entry.key();
        if let Some(started) = entry.started_at {
            let duration = finished_at.saturating_sub(started).max(0);
            let profile = self.profiles.entry(key).or_default();
            profile.record_execution(duration);
            self.accounting.run_energy += profile.power * duration as f64;
            self.accounting.run_cost += profile.price * duration as f64;
            info!(worker = %self.worker, action = id, duration, "action completed");
        }

        let freed = self.unschedule_action(id)?;
        if let Some(pending) = self.pending.as_mut() {
            pending.completed.push(id);
        }
        self.board.remove(id);
        Ok(freed)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Parked actions plus placed actions still waiting for capacity, in
    /// selection order.
    pub fn blocked_actions(&self) -> Vec<SchedulableAction> {
        let mut blocked: Vec<SchedulableAction> = self
            .actions
            .values()
            .filter(|e| e.state != ActionState::Timeline || (!e.is_running() && e.waits_for_resources()))
            .map(|e| e.action.clone())
            .collect();
        blocked.sort_by(selection_order);
        blocked
    }

    /// Whether `id` holds all its capacity and all its data is produced.
    pub fn is_executable(&self, id: ActionId) -> bool {
        self.actions.get(&id).is_some_and(|e| {
            e.state == ActionState::Timeline
                && !e.is_running()
                && !e.waits_for_resources()
                && self.board.all_finished(&e.action.data_predecessors)
        })
    }

    /// Those of `ids` that could start right now.
    pub fn executable(&self, ids: &[ActionId]) -> Vec<ActionId> {
        ids.iter().copied().filter(|id| self.is_executable(*id)).collect()
    }

    /// Earliest time the timeline covers `requirements`, never before 0.
    pub fn resource_free_time(&self, requirements: &Capacity) -> Timestamp {
        match self.timeline.cover_time(requirements) {
            NEVER => NEVER,
            t => t.max(0),
        }
    }

    /// Score of running `implementation` here; `penalty` delays the
    /// resource availability, e.g. for data transfers.
    pub fn implementation_score(
        &self,
        action: &SchedulableAction,
        implementation: &Implementation,
        data_available: Timestamp,
        penalty: Timestamp,
    ) -> Option<MoScore> {
        if !self.description.can_host_static(&implementation.requirements) {
            return None;
        }
        let free = match self.resource_free_time(&implementation.requirements.capacity()) {
            NEVER => NEVER,
            t => t.saturating_add(penalty),
        };
        let profile = self.profile(action.core_id, implementation.impl_id);
        Some(MoScore::compute(
            action.priority,
            action.group_priority,
            data_available,
            free,
            &profile,
            self.idle_power,
            self.idle_price,
        ))
    }

    /// Score of the placement an action already has.
    pub fn current_score(&self, id: ActionId) -> Option<MoScore> {
        let entry = self.actions.get(&id)?;
        let data_available = self.board.data_ready_time(&entry.action.data_predecessors);
        let profile = self.profile(entry.action.core_id, entry.implementation.impl_id);
        Some(MoScore::compute(
            entry.action.priority,
            entry.action.group_priority,
            data_available,
            entry.expected_start,
            &profile,
            self.idle_power,
            self.idle_price,
        ))
    }

    /// Pending actions this worker would give away: lowest priority
    /// first, latest end first among equals.
    pub fn donation_queue(&self) -> Vec<DonationCandidate> {
        let mut queue: Vec<&ScheduledEntry> = self
            .actions
            .values()
            .filter(|e| e.state == ActionState::Timeline && !e.is_running())
            .collect();
        queue.sort_by(|a, b| {
            a.action
                .priority
                .cmp(&b.action.priority)
                .then_with(|| b.expected_end.cmp(&a.expected_end))
                .then_with(|| a.action.id.cmp(&b.action.id))
        });
        queue
            .into_iter()
            .map(|e| DonationCandidate {
                action: e.action.clone(),
                impl_id: e.implementation.impl_id,
                expected_start: e.expected_start,
                expected_end: e.expected_end,
            })
            .collect()
    }

    /// How far into the future this worker is committed.
    pub fn donation_indicator(&self) -> Timestamp {
        self.timeline.last_start().map(|t| t.max(0)).unwrap_or(0)
    }

    /// Capacity reserved by placed actions whose slot covers `t`.
    pub fn reserved_at(&self, t: Timestamp) -> Capacity {
        let mut total = Capacity::EMPTY;
        for entry in self.actions.values() {
            if entry.state == ActionState::Timeline && entry.expected_start <= t && t < entry.expected_end {
                total.increase(&entry.requirements);
            }
        }
        total
    }

    /// Serializable view of this worker for the optimizers.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let mut keys: BTreeSet<(CoreId, ImplId)> = self.profiles.keys().copied().collect();
        keys.extend(self.accounting.scheduled.keys().copied());
        let implementations = keys
            .into_iter()
            .map(|(core_id, impl_id)| ImplementationStats {
                core_id,
                impl_id,
                scheduled: self.accounting.scheduled.get(&(core_id, impl_id)).copied().unwrap_or(0),
                running: self.accounting.running.get(&(core_id, impl_id)).copied().unwrap_or(0),
                profile: self.profile(core_id, impl_id),
            })
            .collect();
        let blocked = self.actions.values().filter(|e| e.state != ActionState::Timeline).count();
        WorkerSnapshot {
            worker: self.worker.clone(),
            description: self.description.clone(),
            capacity: self.capacity,
            idle_power: self.idle_power,
            idle_price: self.idle_price,
            epoch: self.epoch,
            donation_indicator: self.donation_indicator(),
            accounting: self.accounting.clone(),
            implementations,
            gaps: self.timeline.iter().cloned().collect(),
            scheduled_actions: self.actions.len() - blocked,
            blocked_actions: blocked,
        }
    }

    // ── Profiles ───────────────────────────────────────────────────

    /// Export the profiles keyed by implementation signature.
    pub fn worker_record(&self, catalog: &CoreCatalog) -> WorkerRecord {
        let mut record = WorkerRecord {
            idle_power: Some(self.idle_power),
            idle_price: Some(self.idle_price),
            ..WorkerRecord::default()
        };
        for ((core_id, impl_id), profile) in &self.profiles {
            if let Ok(implementation) = catalog.implementation(*core_id, *impl_id) {
                record
                    .implementations
                    .insert(implementation.signature.clone(), profile.to_record());
            }
        }
        record
    }

    /// Seed the profiles from a stored record. Unknown signatures are
    /// skipped.
    pub fn load_worker_record(&mut self, catalog: &CoreCatalog, record: &WorkerRecord) {
        if let Some(power) = record.idle_power {
            self.idle_power = power;
        }
        if let Some(price) = record.idle_price {
            self.idle_price = price;
        }
        for core_id in catalog.core_ids() {
            for implementation in catalog.implementations(core_id) {
                if let Some(stored) = record.implementations.get(&implementation.signature) {
                    self.profiles
                        .insert((core_id, implementation.impl_id), Profile::from_record(stored));
                }
            }
        }
    }

    // ── Elastic capacity ───────────────────────────────────────────

    /// Grow the worker: the new capacity is free right away.
    pub fn increase_capacity(&mut self, extra: &Capacity, description: ResourceDescription) {
        self.capacity.increase(extra);
        self.description = description;
        self.timeline.add_gap(Gap::free(*extra));
        info!(worker = %self.worker, cpu = self.capacity.cpu, "worker capacity increased");
    }

    /// Shrink the worker if `removed` is currently free. Returns false and
    /// changes nothing otherwise.
    pub fn reduce_capacity(&mut self, removed: &Capacity, description: ResourceDescription) -> bool {
        if self.pending.is_some() || !self.timeline.available_at(ORIGIN).contains(removed) {
            return false;
        }
        self.timeline.reserve(removed, ORIGIN);
        self.capacity.reduce(removed);
        self.description = description;
        info!(worker = %self.worker, cpu = self.capacity.cpu, "worker capacity reduced");
        true
    }

    // ── Local optimization ─────────────────────────────────────────

    /// Mark the worker as optimizing and snapshot its actions relative to
    /// `update_id`.
    pub fn begin_optimization(&mut self, update_id: Timestamp) -> SchedulerResult<OptimizationInput> {
        if self.pending.is_some() {
            return Err(SchedulerError::OptimizationInProgress(self.worker.clone()));
        }
        self.pending = Some(PendingWork::default());

        let actions = self
            .actions
            .values()
            .map(|e| {
                let (internal, external): (Vec<ActionId>, Vec<ActionId>) = e
                    .action
                    .data_predecessors
                    .iter()
                    .copied()
                    .partition(|p| self.actions.contains_key(p));
                let external_ready = if external.is_empty() {
                    None
                } else {
                    match self.board.data_ready_time(&external) {
                        NEVER => Some(NEVER),
                        t => Some(t.saturating_sub(update_id)),
                    }
                };
                SimAction {
                    action: e.action.clone(),
                    impl_id: e.implementation.impl_id,
                    requirements: e.requirements,
                    profile: self.profile(e.action.core_id, e.implementation.impl_id),
                    started_at: e.started_at.map(|s| s.saturating_sub(update_id)),
                    internal_predecessors: internal,
                    external_ready,
                }
            })
            .collect();

        debug!(worker = %self.worker, update_id, actions = self.actions.len(), "local optimization started");
        Ok(OptimizationInput {
            worker: self.worker.clone(),
            update_id,
            capacity: self.capacity,
            actions,
        })
    }

    /// Install a simulation outcome and replay the work that arrived
    /// meanwhile.
    pub fn finish_optimization(&mut self, outcome: OptimizationOutcome) -> SchedulerResult<OptimizationReport> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| SchedulerError::NoOptimization(self.worker.clone()))?;
        let by = outcome.update_id;

        self.timeline = GapTimeline::from_gaps(
            outcome
                .gaps
                .into_iter()
                .map(|g| Gap::new(shift(g.start, by), g.end, g.origin, g.resources))
                .collect(),
        );
        for entry in self.actions.values_mut() {
            entry.successors.clear();
        }

        let mut launchable = Vec::new();
        let mut links = Vec::new();
        for placement in outcome.placements {
            let profile = match self.actions.get(&placement.id) {
                Some(e) => self.profile(e.action.core_id, e.implementation.impl_id),
                None => continue,
            };
            let Some(entry) = self.actions.get_mut(&placement.id) else {
                continue;
            };
            entry.state = placement.state;
            entry.expected_start = shift(placement.start, by);
            entry.expected_end = shift(placement.end, by);
            entry.predecessors = placement
                .predecessors
                .into_iter()
                .map(|g| Gap::new(shift(g.start, by), g.end, g.origin, g.resources))
                .collect();
            for pred in &entry.predecessors {
                if let Some(origin) = pred.origin {
                    links.push((origin, placement.id));
                }
            }
            let pending_run = entry.state == ActionState::Timeline && !entry.is_running();
            entry.charged_energy = if pending_run { profile.energy_per_run() } else { 0.0 };
            entry.charged_cost = if pending_run { profile.cost_per_run() } else { 0.0 };
            if placement.launch && !entry.is_running() {
                launchable.push(placement.id);
            }
        }
        for (origin, succ) in links {
            if let Some(pred) = self.actions.get_mut(&origin) {
                pred.successors.insert(succ);
            }
        }

        self.accounting.pending_energy = outcome.pending_energy;
        self.accounting.pending_cost = outcome.pending_cost;
        self.accounting.running_energy = outcome.running_energy;
        self.accounting.running_cost = outcome.running_cost;
        self.accounting.end_running = shift(outcome.end_running, by);
        self.accounting.scheduled = outcome.scheduled_counts;
        self.accounting.running = outcome.running_counts;
        self.epoch = by;

        for entry in self.actions.values() {
            self.publish(entry);
        }

        let mut report = self.apply_pending(pending);
        launchable.append(&mut report.launchable);
        launchable.retain(|id| self.is_executable(*id));
        launchable.sort_unstable();
        launchable.dedup();
        report.launchable = launchable;

        info!(
            worker = %self.worker,
            update_id = by,
            launchable = report.launchable.len(),
            replayed = report.replayed.len(),
            indicator = self.donation_indicator(),
            "local optimization finished"
        );
        Ok(report)
    }

    /// Drop an optimization whose simulation never came back, keeping the
    /// current timeline.
    pub fn abort_optimization(&mut self) -> OptimizationReport {
        match self.pending.take() {
            Some(pending) => {
                warn!(worker = %self.worker, "local optimization aborted");
                self.apply_pending(pending)
            }
            None => OptimizationReport::default(),
        }
    }

    fn apply_pending(&mut self, pending: PendingWork) -> OptimizationReport {
        let mut report = OptimizationReport::default();
        for id in pending.unschedulings {
            match self.remove_action(id) {
                Ok(mut freed) => report.launchable.append(&mut freed),
                Err(err) => warn!(worker = %self.worker, action = id, error = %err, "deferred unschedule failed"),
            }
        }
        for id in pending.completed {
            self.board.remove(id);
        }
        for (action, implementation) in pending.schedulings {
            let id = action.id;
            let result = self.schedule_using_gaps(action, implementation);
            if result.is_placed() {
                report.launchable.push(id);
            }
            report.replayed.push((id, result));
        }
        report.launchable.retain(|id| self.is_executable(*id));
        report.donation_queue = self.donation_queue();
        report
    }

    /// Run a whole local optimization in place.
    pub fn local_optimization(&mut self, update_id: Timestamp) -> SchedulerResult<OptimizationReport> {
        let input = self.begin_optimization(update_id)?;
        let outcome = simulate_local(&input);
        self.finish_optimization(outcome)
    }
}
