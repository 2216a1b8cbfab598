//! Comparable placement scores.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::OptimizationGoal;
use crate::profile::Profile;
use crate::{Timestamp, NEVER};

/// Lexicographic score used to rank (worker, implementation) choices.
///
/// Higher priority wins; then lower group priority; then higher resource,
/// waiting and implementation values in that order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub priority: i64,
    pub group_priority: i64,
    pub resource: i64,
    pub waiting: i64,
    pub implementation: i64,
}

impl Score {
    /// Whether `self` ranks strictly above `other`.
    pub fn is_better(&self, other: &Score) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// `None` is never better; anything beats `None`.
    pub fn is_better_opt(a: Option<&Score>, b: Option<&Score>) -> bool {
        match (a, b) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(a), Some(b)) => a.is_better(b),
        }
    }

    fn compare(&self, other: &Score) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.group_priority.cmp(&self.group_priority))
            .then_with(|| self.resource.cmp(&other.resource))
            .then_with(|| self.waiting.cmp(&other.waiting))
            .then_with(|| self.implementation.cmp(&other.implementation))
    }
}

/// Multi-objective score: expected completion, energy and cost of running
/// one implementation on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoScore {
    pub priority: i64,
    pub group_priority: i64,
    pub expected_data_available: Timestamp,
    pub resource_free_time: Timestamp,
    pub implementation_time: Timestamp,
    /// Watt-milliseconds.
    pub energy: f64,
    pub cost: f64,
}

impl MoScore {
    /// Score an implementation whose data is ready at `data_available` on a
    /// worker whose resources free up at `resource_free_time`.
    pub fn compute(
        priority: i64,
        group_priority: i64,
        data_available: Timestamp,
        resource_free_time: Timestamp,
        profile: &Profile,
        idle_power: f64,
        idle_price: f64,
    ) -> Self {
        let implementation_time = profile.avg_time;
        let waiting = data_available.max(resource_free_time);
        let (energy, cost) = if waiting == NEVER {
            (f64::INFINITY, f64::INFINITY)
        } else {
            let span = waiting.saturating_add(implementation_time) as f64;
            let run = implementation_time as f64;
            (
                span * idle_power + profile.power * run,
                span * idle_price + profile.price * run,
            )
        };
        Self {
            priority,
            group_priority,
            expected_data_available: data_available,
            resource_free_time,
            implementation_time,
            energy,
            cost,
        }
    }

    /// When both the data and the resources are ready.
    pub fn waiting_time(&self) -> Timestamp {
        self.expected_data_available.max(self.resource_free_time)
    }

    /// Expected end of the action.
    pub fn completion_time(&self) -> Timestamp {
        self.waiting_time().saturating_add(self.implementation_time)
    }

    /// Whether `self` is strictly better than `other` under `goal`.
    pub fn is_better(&self, other: &MoScore, goal: OptimizationGoal) -> bool {
        let fixed = self
            .priority
            .cmp(&other.priority)
            .then_with(|| other.group_priority.cmp(&self.group_priority));
        match fixed {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.rank(other, goal) == Ordering::Less,
        }
    }

    /// Like `is_better`, with a missing score losing to any score.
    pub fn is_better_opt(a: Option<&MoScore>, b: Option<&MoScore>, goal: OptimizationGoal) -> bool {
        match (a, b) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(a), Some(b)) => a.is_better(b, goal),
        }
    }

    /// `Less` means `self` ranks ahead of `other`.
    fn rank(&self, other: &MoScore, goal: OptimizationGoal) -> Ordering {
        let time = self.completion_time().cmp(&other.completion_time());
        let energy = cmp_f64(self.energy, other.energy);
        let cost = cmp_f64(self.cost, other.cost);
        match goal {
            OptimizationGoal::Time => time.then(energy).then(cost),
            OptimizationGoal::Energy => energy.then(time).then(cost),
            OptimizationGoal::Cost => cost.then(time).then(energy),
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(priority: i64, group: i64, resource: i64) -> Score {
        Score {
            priority,
            group_priority: group,
            resource,
            waiting: 0,
            implementation: 0,
        }
    }

    #[test]
    fn priority_dominates() {
        assert!(score(2, 9, -100).is_better(&score(1, 0, 0)));
        assert!(!score(1, 0, 100).is_better(&score(2, 0, 0)));
    }

    #[test]
    fn lower_group_priority_wins_ties() {
        assert!(score(1, 0, 0).is_better(&score(1, 3, 50)));
    }

    #[test]
    fn custom_values_break_remaining_ties() {
        assert!(score(1, 0, 5).is_better(&score(1, 0, 4)));
        assert!(!score(1, 0, 4).is_better(&score(1, 0, 4)));
    }

    #[test]
    fn none_handling() {
        let s = score(0, 0, 0);
        assert!(!Score::is_better_opt(None, Some(&s)));
        assert!(Score::is_better_opt(Some(&s), None));
    }

    #[test]
    fn mo_score_energy_and_cost_include_idle_rates() {
        let profile = Profile::with_average(100).with_power(10.0).with_price(0.5);
        let s = MoScore::compute(0, 0, 20, 50, &profile, 2.0, 0.1);
        assert_eq!(s.waiting_time(), 50);
        assert_eq!(s.completion_time(), 150);
        assert!((s.energy - (150.0 * 2.0 + 10.0 * 100.0)).abs() < 1e-9);
        assert!((s.cost - (150.0 * 0.1 + 0.5 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn mo_score_never_is_infinitely_expensive() {
        let s = MoScore::compute(0, 0, NEVER, 0, &Profile::new(), 1.0, 0.0);
        assert!(s.energy.is_infinite());
        assert_eq!(s.completion_time(), NEVER);
    }

    #[test]
    fn mo_score_goal_changes_ranking() {
        let fast = MoScore::compute(0, 0, 0, 0, &Profile::with_average(10).with_power(100.0), 0.0, 0.0);
        let frugal = MoScore::compute(0, 0, 0, 0, &Profile::with_average(50).with_power(1.0), 0.0, 0.0);
        assert!(fast.is_better(&frugal, OptimizationGoal::Time));
        assert!(frugal.is_better(&fast, OptimizationGoal::Energy));
        assert!(!fast.is_better(&fast, OptimizationGoal::Time));
    }
}
