//! Configuration costs: what a fleet would spend finishing the pending
//! workload, and the goal-specific comparison between two fleets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use elastic_core::{CoreId, OptimizationConfig, OptimizationGoal, Profile, Timestamp};

/// Milliseconds (or watt-milliseconds, or price-milliseconds) per hour.
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Time, energy and cost of a configuration, plus its average power and
/// price rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationCost {
    /// Seconds.
    pub time: f64,
    /// Watt-hours.
    pub energy: f64,
    pub cost: f64,
    /// Watts.
    pub power: f64,
    /// Currency per hour.
    pub price: f64,
}

impl ConfigurationCost {
    /// `fixed_energy` is in millijoules and `fixed_cost` in price-ms, the
    /// units the workers account in.
    pub fn new(time_ms: Timestamp, idle_power: f64, fixed_energy: f64, idle_price: f64, fixed_cost: f64) -> Self {
        let t = time_ms.max(0) as f64;
        let (power, price) = if t > 0.0 {
            (idle_power + fixed_energy / t, idle_price + fixed_cost / t)
        } else {
            (idle_power, idle_price)
        };
        Self {
            time: t / 1000.0,
            energy: (idle_power * t + fixed_energy) / MS_PER_HOUR,
            cost: (idle_price * t + fixed_cost) / MS_PER_HOUR,
            power,
            price,
        }
    }

    fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Time => self.time,
            Metric::Energy => self.energy,
            Metric::Cost => self.cost,
        }
    }
}

/// A worker (existing or about to exist) as the simulation sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimResource {
    pub name: String,
    pub idle_power: f64,
    pub idle_price: f64,
    /// Profile of the implementation this resource would run, per core.
    pub profiles: BTreeMap<CoreId, Profile>,
    /// Simultaneous instances per core.
    pub capacity: BTreeMap<CoreId, u32>,
    /// When the resource is free of already-running work.
    pub start_time: Timestamp,
    /// Energy (mJ) and cost (price-ms) of the work already running.
    pub start_energy: f64,
    pub start_cost: f64,
    /// Pending creations and reductions leave a resource untouchable.
    pub pending_modification: bool,
}

impl SimResource {
    /// A free, idle-less resource with no profiles.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            idle_power: 0.0,
            idle_price: 0.0,
            profiles: BTreeMap::new(),
            capacity: BTreeMap::new(),
            start_time: 0,
            start_energy: 0.0,
            start_cost: 0.0,
            pending_modification: false,
        }
    }

    fn capacity_for(&self, core_id: CoreId) -> u32 {
        self.capacity.get(&core_id).copied().unwrap_or(0)
    }

    fn profile(&self, core_id: CoreId) -> Profile {
        self.profiles.get(&core_id).copied().unwrap_or_default()
    }
}

/// Spread `load` (pending instances per core) over `resources` and cost
/// the result.
///
/// Each round hands the earliest-free resource able to run the core as
/// many instances as it runs at once; that resource is then busy for one
/// average execution. Cores no resource can run are left out. `min_*`
/// carry what a removed resource already committed to.
pub fn simulate(
    load: &BTreeMap<CoreId, u32>,
    resources: &[SimResource],
    min_time: Timestamp,
    min_energy: f64,
    min_cost: f64,
) -> ConfigurationCost {
    let mut clocks: Vec<Timestamp> = resources.iter().map(|r| r.start_time.max(0)).collect();
    let mut counts: Vec<BTreeMap<CoreId, u32>> = vec![BTreeMap::new(); resources.len()];

    for (&core_id, &pending) in load {
        let mut remaining = pending;
        while remaining > 0 {
            let Some(index) = (0..resources.len())
                .filter(|&i| resources[i].capacity_for(core_id) > 0)
                .min_by_key(|&i| (clocks[i], i))
            else {
                break;
            };
            let resource = &resources[index];
            let slots = resource.capacity_for(core_id);
            clocks[index] = clocks[index].saturating_add(resource.profile(core_id).avg_time);
            *counts[index].entry(core_id).or_default() += slots.min(remaining);
            remaining = remaining.saturating_sub(slots);
        }
    }

    let mut time = min_time.max(0);
    let mut idle_power = 0.0;
    let mut idle_price = 0.0;
    let mut actions_energy = 0.0;
    let mut actions_cost = 0.0;
    for ((resource, clock), executed) in resources.iter().zip(&clocks).zip(&counts) {
        time = time.max(*clock);
        idle_power += resource.idle_power;
        idle_price += resource.idle_price;
        actions_energy += resource.start_energy;
        actions_cost += resource.start_cost;
        for (core_id, count) in executed {
            let profile = resource.profile(*core_id);
            let run = f64::from(*count) * profile.avg_time as f64;
            actions_energy += run * profile.power;
            actions_cost += run * profile.price;
        }
    }
    ConfigurationCost::new(
        time,
        idle_power,
        actions_energy + min_energy,
        idle_price,
        actions_cost + min_cost,
    )
}

/// What is left of each ceiling once the elapsed part is subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    pub time: f64,
    pub energy: f64,
    pub cost: f64,
    pub power: f64,
    pub price: f64,
}

impl Budgets {
    /// No ceiling on any metric.
    pub fn unbounded() -> Self {
        Self {
            time: f64::INFINITY,
            energy: f64::INFINITY,
            cost: f64::INFINITY,
            power: f64::INFINITY,
            price: f64::INFINITY,
        }
    }

    /// Ceilings from the configuration minus what was already spent.
    pub fn remaining(config: &OptimizationConfig, elapsed: &ConfigurationCost) -> Self {
        Self {
            time: config.time_budget_s - elapsed.time,
            energy: config.energy_budget_wh - elapsed.energy,
            cost: config.cost_budget - elapsed.cost,
            power: config.power_budget_w - elapsed.power,
            price: config.price_budget_per_h - elapsed.price,
        }
    }

    fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Time => self.time,
            Metric::Energy => self.energy,
            Metric::Cost => self.cost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Time,
    Energy,
    Cost,
}

/// A value is acceptable if it stays within budget, or, when the
/// reference already breaks the budget, if it does not make things worse.
pub fn is_acceptable(candidate: f64, reference: f64, budget: f64) -> bool {
    if reference > budget {
        candidate <= reference
    } else {
        candidate <= budget
    }
}

/// Lexicographic improvement on `primary`, guarded by the budgets of the
/// other two metrics.
fn improves(
    candidate: &ConfigurationCost,
    reference: &ConfigurationCost,
    budgets: &Budgets,
    [primary, secondary, tertiary]: [Metric; 3],
) -> bool {
    let acceptable = |m: Metric| is_acceptable(candidate.get(m), reference.get(m), budgets.get(m));
    let (c, r) = (candidate.get(primary), reference.get(primary));

    if c < r {
        return acceptable(secondary) && acceptable(tertiary);
    }
    if c == r {
        let (cs, rs) = (candidate.get(secondary), reference.get(secondary));
        if cs < rs {
            return acceptable(tertiary);
        }
        return cs == rs && candidate.get(tertiary) < reference.get(tertiary);
    }

    // Worse on the goal: only worth it when it pulls a broken budget back.
    for (pulled, guarded) in [(secondary, tertiary), (tertiary, secondary)] {
        if reference.get(pulled) > budgets.get(pulled) && candidate.get(pulled) < reference.get(pulled) {
            return acceptable(guarded);
        }
    }
    false
}

/// Time first, then energy, then cost.
pub fn improves_time(candidate: &ConfigurationCost, reference: &ConfigurationCost, budgets: &Budgets) -> bool {
    improves(candidate, reference, budgets, [Metric::Time, Metric::Energy, Metric::Cost])
}

/// Cost first, then time, then energy.
pub fn improves_cost(candidate: &ConfigurationCost, reference: &ConfigurationCost, budgets: &Budgets) -> bool {
    improves(candidate, reference, budgets, [Metric::Cost, Metric::Time, Metric::Energy])
}

/// Energy first, then time, then cost.
pub fn improves_energy(candidate: &ConfigurationCost, reference: &ConfigurationCost, budgets: &Budgets) -> bool {
    improves(candidate, reference, budgets, [Metric::Energy, Metric::Time, Metric::Cost])
}

/// Index of the candidate that best improves on `current` under `goal`,
/// or `None` when doing nothing is best. Candidates over the power or
/// price budget are never chosen.
pub fn select_best_action(
    current: &ConfigurationCost,
    candidates: &[ConfigurationCost],
    budgets: &Budgets,
    goal: OptimizationGoal,
) -> Option<usize> {
    let improves = match goal {
        OptimizationGoal::Time => improves_time,
        OptimizationGoal::Cost => improves_cost,
        OptimizationGoal::Energy => improves_energy,
    };
    let mut best: Option<usize> = None;
    let mut reference = current;
    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.power > budgets.power || candidate.price > budgets.price {
            continue;
        }
        if improves(candidate, reference, budgets) {
            best = Some(index);
            reference = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost(time: f64, energy: f64, cost: f64) -> ConfigurationCost {
        ConfigurationCost {
            time,
            energy,
            cost,
            power: 0.0,
            price: 0.0,
        }
    }

    fn resource(name: &str, slots: u32, avg: Timestamp) -> SimResource {
        let mut r = SimResource::new(name);
        r.capacity.insert(0, slots);
        r.profiles.insert(0, Profile::with_average(avg).with_power(10.0));
        r.idle_power = 2.0;
        r
    }

    #[test]
    fn configuration_cost_converts_units() {
        let c = ConfigurationCost::new(3_600_000, 10.0, 3_600_000.0, 0.5, 0.0);

        assert!((c.time - 3600.0).abs() < 1e-9);
        assert!((c.energy - 11.0).abs() < 1e-9);
        assert!((c.cost - 0.5).abs() < 1e-9);
        assert!((c.power - 11.0).abs() < 1e-9);
        assert!((c.price - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_time_keeps_idle_rates() {
        let c = ConfigurationCost::new(0, 4.0, 100.0, 1.0, 50.0);
        assert_eq!(c.time, 0.0);
        assert_eq!(c.power, 4.0);
        assert_eq!(c.price, 1.0);
    }

    #[test]
    fn simulate_spreads_rounds_over_earliest_resource() {
        let load = BTreeMap::from([(0, 4)]);
        let resources = vec![resource("a", 2, 100), resource("b", 1, 100)];

        let c = simulate(&load, &resources, 0, 0.0, 0.0);

        // Rounds: a@0 runs 2, b@0 runs 1, a@100 runs the last one.
        assert!((c.time - 0.2).abs() < 1e-9);
        let run_energy = 4.0 * 100.0 * 10.0;
        let idle = 4.0 * 200.0;
        assert!((c.energy - (idle + run_energy) / MS_PER_HOUR).abs() < 1e-12);
    }

    #[test]
    fn simulate_skips_cores_nobody_runs() {
        let load = BTreeMap::from([(0, 2), (5, 10)]);
        let resources = vec![resource("a", 2, 100)];

        let c = simulate(&load, &resources, 0, 0.0, 0.0);

        assert!((c.time - 0.1).abs() < 1e-9);
    }

    #[test]
    fn simulate_respects_min_time() {
        let c = simulate(&BTreeMap::new(), &[], 5_000, 0.0, 0.0);
        assert!((c.time - 5.0).abs() < 1e-9);
    }

    #[test]
    fn acceptable_relaxes_when_reference_is_over_budget() {
        assert!(is_acceptable(5.0, 10.0, 6.0));
        assert!(!is_acceptable(7.0, 5.0, 6.0));
        assert!(is_acceptable(9.0, 10.0, 8.0));
        assert!(!is_acceptable(11.0, 10.0, 8.0));
    }

    #[test]
    fn faster_within_budget_wins_for_time() {
        let budgets = Budgets {
            cost: 1.0,
            ..Budgets::unbounded()
        };
        let current = cost(100.0, 1.0, 0.2);
        let faster = cost(80.0, 1.0, 0.7);

        assert!(improves_time(&faster, &current, &budgets));
        assert!(!improves_time(&current, &faster, &budgets));
    }

    #[test]
    fn slower_candidate_accepted_only_to_recover_budget() {
        let budgets = Budgets {
            cost: 1.0,
            ..Budgets::unbounded()
        };
        let current = cost(100.0, 1.0, 2.0);
        let cheaper = cost(120.0, 1.0, 1.5);
        let pricier = cost(120.0, 1.0, 2.5);

        assert!(improves_time(&cheaper, &current, &budgets));
        assert!(!improves_time(&pricier, &current, &budgets));
    }

    #[test]
    fn cost_goal_breaks_ties_on_time() {
        let budgets = Budgets::unbounded();
        let current = cost(100.0, 1.0, 1.0);
        let quicker = cost(90.0, 5.0, 1.0);

        assert!(improves_cost(&quicker, &current, &budgets));
    }

    #[test]
    fn energy_goal_prefers_lower_energy() {
        let budgets = Budgets {
            time: 100.0,
            ..Budgets::unbounded()
        };
        let current = cost(50.0, 10.0, 1.0);
        let greener_slow = cost(150.0, 5.0, 1.0);
        let greener = cost(90.0, 5.0, 1.0);

        assert!(!improves_energy(&greener_slow, &current, &budgets));
        assert!(improves_energy(&greener, &current, &budgets));
    }

    #[test]
    fn power_ceiling_is_hard() {
        let budgets = Budgets {
            power: 50.0,
            ..Budgets::unbounded()
        };
        let current = cost(100.0, 1.0, 1.0);
        let mut hungry = cost(10.0, 1.0, 1.0);
        hungry.power = 80.0;

        assert_eq!(select_best_action(&current, &[hungry], &budgets, OptimizationGoal::Time), None);
    }

    #[test]
    fn later_candidate_must_beat_the_current_best() {
        let budgets = Budgets::unbounded();
        let current = cost(100.0, 1.0, 1.0);
        let candidates = [cost(80.0, 1.0, 1.0), cost(90.0, 1.0, 1.0), cost(70.0, 1.0, 1.0)];

        assert_eq!(
            select_best_action(&current, &candidates, &budgets, OptimizationGoal::Time),
            Some(2)
        );
    }
}
