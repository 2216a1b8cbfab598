//! Local re-optimization: a discrete-event replay of one worker's actions.
//!
//! The replay is a pure function of an `OptimizationInput` snapshot so it
//! can run off the worker actor while the actor keeps serving messages.
//!
//! ```text
//! seed running actions at their real start
//! classify the rest:   internal data deps  -> wait for producer end
//!                      external data deps  -> ready at producer end
//!                      no deps             -> selectable now
//! loop:
//!   admit selectable actions by priority while the timeline covers them
//!   when the top one must wait, back-fill shorter ones that end in time
//!   advance to the next end / ready time
//! leftovers: unrunnable -> resource-blocked, their consumers -> data-blocked
//! ```

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use elastic_core::{Capacity, CoreId, ImplId, Profile, Timestamp, NEVER};

use crate::action::{ActionId, ActionState, SchedulableAction};
use crate::gap::{Gap, GapTimeline};

/// One action as seen by the replay.
#[derive(Debug, Clone)]
pub struct SimAction {
    pub action: SchedulableAction,
    pub impl_id: ImplId,
    pub requirements: Capacity,
    pub profile: Profile,
    /// Real start relative to the optimization epoch, for running actions.
    pub started_at: Option<Timestamp>,
    /// Data producers scheduled on the same worker.
    pub internal_predecessors: Vec<ActionId>,
    /// Latest expected end of producers on other workers.
    pub external_ready: Option<Timestamp>,
}

/// Everything a local optimization needs, detached from the worker.
#[derive(Debug, Clone)]
pub struct OptimizationInput {
    pub worker: String,
    pub update_id: Timestamp,
    pub capacity: Capacity,
    pub actions: Vec<SimAction>,
}

/// Where the simulation put one action.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPlacement {
    pub id: ActionId,
    pub state: ActionState,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Pieces taken from actions that must finish first.
    pub predecessors: Vec<Gap>,
    /// Admitted at the epoch using only free capacity.
    pub launch: bool,
}

/// Result of `simulate_local`, applied by `finish_optimization`.
#[derive(Debug, Clone, Default)]
pub struct OptimizationOutcome {
    pub update_id: Timestamp,
    pub gaps: Vec<Gap>,
    pub placements: Vec<SimPlacement>,
    pub pending_energy: f64,
    pub pending_cost: f64,
    pub running_energy: f64,
    pub running_cost: f64,
    pub end_running: Timestamp,
    pub scheduled_counts: BTreeMap<(CoreId, ImplId), u32>,
    pub running_counts: BTreeMap<(CoreId, ImplId), u32>,
}

/// Replay every action of `input` and produce a fresh, collision-free
/// timeline.
pub fn simulate_local(input: &OptimizationInput) -> OptimizationOutcome {
    let mut sim = Simulation::new(input);
    sim.seed_running();
    sim.classify();
    sim.run();
    sim.finish()
}

/// When the resources held by `a` return to the timeline.
fn release_time(a: &SimAction, end: Timestamp) -> Timestamp {
    if a.action.releases_resources { end } else { NEVER }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SelectKey {
    priority: Reverse<i64>,
    group: i64,
    id: ActionId,
}

struct Simulation<'a> {
    actions: HashMap<ActionId, &'a SimAction>,
    timeline: GapTimeline,
    placements: BTreeMap<ActionId, SimPlacement>,
    successors: HashMap<ActionId, Vec<ActionId>>,
    waiting_on: HashMap<ActionId, usize>,
    data_ready: HashMap<ActionId, Timestamp>,
    selectable: BTreeSet<SelectKey>,
    ready: BTreeSet<(Timestamp, ActionId)>,
    ends: BinaryHeap<Reverse<(Timestamp, ActionId)>>,
    now: Timestamp,
    outcome: OptimizationOutcome,
}

impl<'a> Simulation<'a> {
    fn new(input: &'a OptimizationInput) -> Self {
        let actions: HashMap<ActionId, &SimAction> = input.actions.iter().map(|a| (a.action.id, a)).collect();

        let mut successors: HashMap<ActionId, Vec<ActionId>> = HashMap::new();
        for a in &input.actions {
            for pred in &a.internal_predecessors {
                if actions.contains_key(pred) {
                    successors.entry(*pred).or_default().push(a.action.id);
                }
            }
        }
        for list in successors.values_mut() {
            list.sort_unstable();
            list.dedup();
        }

        Self {
            actions,
            timeline: GapTimeline::new(input.capacity),
            placements: BTreeMap::new(),
            successors,
            waiting_on: HashMap::new(),
            data_ready: HashMap::new(),
            selectable: BTreeSet::new(),
            ready: BTreeSet::new(),
            ends: BinaryHeap::new(),
            now: 0,
            outcome: OptimizationOutcome {
                update_id: input.update_id,
                ..OptimizationOutcome::default()
            },
        }
    }

    fn key(&self, id: ActionId) -> Option<SelectKey> {
        self.actions.get(&id).map(|a| SelectKey {
            priority: Reverse(a.action.priority),
            group: a.action.group_priority,
            id,
        })
    }

    fn sorted_ids(&self) -> Vec<ActionId> {
        let mut ids: Vec<_> = self.actions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn seed_running(&mut self) {
        let mut running: Vec<(Timestamp, ActionId)> = self
            .actions
            .values()
            .filter_map(|a| a.started_at.map(|s| (s, a.action.id)))
            .collect();
        running.sort_unstable();

        for (start, id) in running {
            let Some(a) = self.actions.get(&id).copied() else {
                continue;
            };
            let end = start.saturating_add(a.profile.avg_time).max(0);
            let predecessors = self.take_resources(a, start);
            self.timeline.add_gap(Gap::new(release_time(a, end), NEVER, Some(id), a.requirements));
            self.ends.push(Reverse((end, id)));

            let key = (a.action.core_id, a.impl_id);
            *self.outcome.running_counts.entry(key).or_default() += 1;
            *self.outcome.scheduled_counts.entry(key).or_default() += 1;
            self.outcome.running_energy += a.profile.power * end as f64;
            self.outcome.running_cost += a.profile.price * end as f64;
            self.outcome.end_running = self.outcome.end_running.max(end);

            self.placements.insert(
                id,
                SimPlacement {
                    id,
                    state: ActionState::Timeline,
                    start,
                    end,
                    predecessors,
                    launch: false,
                },
            );
        }
    }

    fn classify(&mut self) {
        let mut blocked = Vec::new();
        for id in self.sorted_ids() {
            if self.placements.contains_key(&id) {
                continue;
            }
            let Some(a) = self.actions.get(&id).copied() else {
                continue;
            };
            let internal = a
                .internal_predecessors
                .iter()
                .filter(|p| self.actions.contains_key(p))
                .count();
            let ready_at = a.external_ready.unwrap_or(0).max(0);
            self.data_ready.insert(id, ready_at);

            if ready_at == NEVER {
                blocked.push(id);
            } else if internal > 0 {
                self.waiting_on.insert(id, internal);
            } else if ready_at <= self.now {
                if let Some(key) = self.key(id) {
                    self.selectable.insert(key);
                }
            } else {
                self.ready.insert((ready_at, id));
            }
        }
        for id in blocked {
            if !self.placements.contains_key(&id) {
                self.park(id, ActionState::DataBlocked);
            }
        }
    }

    fn run(&mut self) {
        loop {
            self.promote_ready();
            self.admit();

            let next_end = self.ends.peek().map(|Reverse((t, _))| *t);
            let next_ready = self.ready.first().map(|(t, _)| *t);
            let Some(next) = next_end.into_iter().chain(next_ready).min() else {
                break;
            };
            self.now = self.now.max(next);

            while let Some(Reverse((t, id))) = self.ends.peek().copied() {
                if t > self.now {
                    break;
                }
                self.ends.pop();
                self.release_successors(id, t);
            }
        }

        let leftovers: Vec<ActionId> = self.selectable.iter().map(|k| k.id).collect();
        self.selectable.clear();
        for id in leftovers {
            if !self.placements.contains_key(&id) {
                self.park(id, ActionState::ResourceBlocked);
            }
        }
        let mut waiting: Vec<ActionId> = self.waiting_on.keys().copied().collect();
        waiting.sort_unstable();
        for id in waiting {
            if !self.placements.contains_key(&id) {
                self.park(id, ActionState::DataBlocked);
            }
        }
    }

    fn promote_ready(&mut self) {
        while let Some((t, id)) = self.ready.first().copied() {
            if t > self.now {
                break;
            }
            self.ready.remove(&(t, id));
            if let Some(key) = self.key(id) {
                self.selectable.insert(key);
            }
        }
    }

    /// Start selectable actions in priority order until the top one has
    /// to wait for capacity.
    fn admit(&mut self) {
        while let Some(top) = self.selectable.first().copied() {
            let Some(a) = self.actions.get(&top.id).copied() else {
                self.selectable.remove(&top);
                continue;
            };
            let cover = self.timeline.cover_time(&a.requirements);
            if cover == NEVER {
                self.selectable.remove(&top);
                self.park(top.id, ActionState::ResourceBlocked);
            } else if cover <= self.now {
                self.selectable.remove(&top);
                self.start(top.id, self.now);
            } else {
                self.backfill(top, cover);
                break;
            }
        }
    }

    /// Fill the idle interval before `limit` with lower-priority actions
    /// that fit now and release their resources by then.
    fn backfill(&mut self, top: SelectKey, limit: Timestamp) {
        let candidates: Vec<SelectKey> = self.selectable.iter().filter(|k| **k != top).copied().collect();
        for key in candidates {
            let Some(a) = self.actions.get(&key.id).copied() else {
                continue;
            };
            if !a.action.releases_resources {
                continue;
            }
            if self.now.saturating_add(a.profile.avg_time.max(0)) > limit {
                continue;
            }
            if !self.timeline.available_at(self.now).contains(&a.requirements) {
                continue;
            }
            self.selectable.remove(&key);
            self.start(key.id, self.now);
        }
    }

    fn start(&mut self, id: ActionId, at: Timestamp) {
        let Some(a) = self.actions.get(&id).copied() else {
            return;
        };
        let end = at.saturating_add(a.profile.avg_time).max(0);
        let predecessors = self.take_resources(a, at);
        let launch = at <= 0 && predecessors.is_empty();

        self.timeline.add_gap(Gap::new(release_time(a, end), NEVER, Some(id), a.requirements));
        self.ends.push(Reverse((end, id)));

        *self
            .outcome
            .scheduled_counts
            .entry((a.action.core_id, a.impl_id))
            .or_default() += 1;
        self.outcome.pending_energy += a.profile.energy_per_run();
        self.outcome.pending_cost += a.profile.cost_per_run();

        self.placements.insert(
            id,
            SimPlacement {
                id,
                state: ActionState::Timeline,
                start: at,
                end,
                predecessors,
                launch,
            },
        );
    }

    fn take_resources(&mut self, a: &SimAction, at: Timestamp) -> Vec<Gap> {
        self.timeline
            .reserve(&a.requirements, at)
            .into_iter()
            .filter(|piece| piece.origin.is_some())
            .map(|piece| Gap::new(piece.start, NEVER, piece.origin, piece.resources))
            .collect()
    }

    fn release_successors(&mut self, id: ActionId, at: Timestamp) {
        let Some(successors) = self.successors.get(&id).cloned() else {
            return;
        };
        for succ in successors {
            if self.placements.contains_key(&succ) {
                continue;
            }
            let Some(count) = self.waiting_on.get_mut(&succ) else {
                continue;
            };
            *count = count.saturating_sub(1);
            let remaining = *count;
            let ready_at = {
                let entry = self.data_ready.entry(succ).or_insert(0);
                *entry = (*entry).max(at);
                *entry
            };
            if remaining == 0 {
                self.waiting_on.remove(&succ);
                if ready_at <= self.now {
                    if let Some(key) = self.key(succ) {
                        self.selectable.insert(key);
                    }
                } else {
                    self.ready.insert((ready_at, succ));
                }
            }
        }
    }

    /// Park an action on a blocking list and cascade to its consumers.
    fn park(&mut self, id: ActionId, state: ActionState) {
        self.placements.insert(
            id,
            SimPlacement {
                id,
                state,
                start: NEVER,
                end: NEVER,
                predecessors: Vec::new(),
                launch: false,
            },
        );
        let successors = self.successors.get(&id).cloned().unwrap_or_default();
        for succ in successors {
            if self.placements.contains_key(&succ) {
                continue;
            }
            self.waiting_on.remove(&succ);
            if let Some(key) = self.key(succ) {
                self.selectable.remove(&key);
            }
            self.ready.retain(|(_, r)| *r != succ);
            self.park(succ, ActionState::DataBlocked);
        }
    }

    fn finish(self) -> OptimizationOutcome {
        let mut outcome = self.outcome;
        outcome.gaps = self.timeline.into_gaps();
        outcome.placements = self.placements.into_values().collect();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_action(id: ActionId, priority: i64, cpu: u32, avg: Timestamp) -> SimAction {
        SimAction {
            action: SchedulableAction::new(id, 0).with_priority(priority),
            impl_id: 0,
            requirements: Capacity::cpus(cpu),
            profile: Profile::with_average(avg),
            started_at: None,
            internal_predecessors: Vec::new(),
            external_ready: None,
        }
    }

    fn input(cpu: u32, actions: Vec<SimAction>) -> OptimizationInput {
        OptimizationInput {
            worker: "w".into(),
            update_id: 1_000,
            capacity: Capacity::cpus(cpu),
            actions,
        }
    }

    fn placement(outcome: &OptimizationOutcome, id: ActionId) -> &SimPlacement {
        outcome.placements.iter().find(|p| p.id == id).unwrap()
    }

    fn gap_units(outcome: &OptimizationOutcome) -> u64 {
        outcome.gaps.iter().map(|g| g.resources.total_units()).sum()
    }

    #[test]
    fn higher_priority_runs_first() {
        let input = input(1, vec![make_action(1, 0, 1, 100), make_action(2, 5, 1, 100)]);
        let outcome = simulate_local(&input);

        let first = placement(&outcome, 2);
        assert_eq!((first.start, first.end), (0, 100));
        assert!(first.launch);

        let second = placement(&outcome, 1);
        assert_eq!(second.start, 100);
        assert_eq!(second.predecessors[0].origin, Some(2));
        assert!(!second.launch);
    }

    #[test]
    fn running_actions_keep_their_real_start() {
        let mut running = make_action(1, 0, 1, 100);
        running.started_at = Some(-40);
        let input = input(1, vec![running, make_action(2, 9, 1, 10)]);

        let outcome = simulate_local(&input);

        assert_eq!(placement(&outcome, 1).end, 60);
        assert_eq!(placement(&outcome, 2).start, 60);
        assert_eq!(outcome.end_running, 60);
        assert_eq!(outcome.running_counts.get(&(0, 0)), Some(&1));
        assert_eq!(outcome.scheduled_counts.get(&(0, 0)), Some(&2));
    }

    #[test]
    fn short_actions_backfill_idle_capacity() {
        let mut running = make_action(1, 0, 1, 100);
        running.started_at = Some(0);
        let input = input(
            2,
            vec![
                running,
                make_action(2, 10, 2, 100),
                make_action(3, 0, 1, 50),
                make_action(4, 0, 1, 200),
            ],
        );

        let outcome = simulate_local(&input);

        assert_eq!(placement(&outcome, 3).start, 0);
        assert!(placement(&outcome, 3).launch);
        let top = placement(&outcome, 2);
        assert_eq!(top.start, 100);
        let mut origins: Vec<_> = top.predecessors.iter().filter_map(|g| g.origin).collect();
        origins.sort_unstable();
        assert_eq!(origins, vec![1, 3]);
        assert_eq!(placement(&outcome, 4).start, 200);
        assert_eq!(gap_units(&outcome), 2);
    }

    #[test]
    fn internal_consumer_starts_after_producer() {
        let mut consumer = make_action(2, 10, 1, 30);
        consumer.internal_predecessors = vec![1];
        let input = input(4, vec![make_action(1, 0, 1, 80), consumer]);

        let outcome = simulate_local(&input);

        assert_eq!(placement(&outcome, 1).start, 0);
        assert_eq!(placement(&outcome, 2).start, 80);
    }

    #[test]
    fn external_producer_delays_start() {
        let mut consumer = make_action(1, 0, 1, 30);
        consumer.external_ready = Some(250);
        let outcome = simulate_local(&input(1, vec![consumer]));
        let p = placement(&outcome, 1);
        assert_eq!(p.start, 250);
        assert!(!p.launch);
    }

    #[test]
    fn unfit_actions_block_their_consumers() {
        let mut consumer = make_action(2, 0, 1, 10);
        consumer.internal_predecessors = vec![1];
        let mut grandchild = make_action(3, 0, 1, 10);
        grandchild.internal_predecessors = vec![2];
        let input = input(2, vec![make_action(1, 0, 8, 10), consumer, grandchild]);

        let outcome = simulate_local(&input);

        assert_eq!(placement(&outcome, 1).state, ActionState::ResourceBlocked);
        assert_eq!(placement(&outcome, 2).state, ActionState::DataBlocked);
        assert_eq!(placement(&outcome, 3).state, ActionState::DataBlocked);
        assert_eq!(gap_units(&outcome), 2);
    }

    #[test]
    fn blocked_external_producer_blocks_consumer() {
        let mut consumer = make_action(1, 0, 1, 10);
        consumer.external_ready = Some(NEVER);
        let outcome = simulate_local(&input(1, vec![consumer]));
        assert_eq!(placement(&outcome, 1).state, ActionState::DataBlocked);
    }

    #[test]
    fn holding_actions_exhaust_capacity() {
        let mut holder = make_action(1, 5, 1, 10);
        holder.action = holder.action.holding_resources();
        let input = input(1, vec![holder, make_action(2, 0, 1, 10)]);

        let outcome = simulate_local(&input);

        assert_eq!(placement(&outcome, 1).end, 10);
        assert!(outcome.gaps.iter().any(|g| g.origin == Some(1) && g.start == NEVER));
        assert_eq!(placement(&outcome, 2).state, ActionState::ResourceBlocked);
    }

    #[test]
    fn pending_energy_counts_only_admitted_actions() {
        let mut a = make_action(1, 0, 1, 100);
        a.profile = a.profile.with_power(2.0).with_price(0.5);
        let outcome = simulate_local(&input(1, vec![a]));
        assert!((outcome.pending_energy - 200.0).abs() < 1e-9);
        assert!((outcome.pending_cost - 50.0).abs() < 1e-9);
    }
}
