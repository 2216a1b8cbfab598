//! Schedulable actions and placement outcomes.

use serde::{Deserialize, Serialize};

use elastic_core::{CoreId, Timestamp};

/// Session-wide action identifier.
pub type ActionId = u64;

/// One task instance handed over by the task engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulableAction {
    pub id: ActionId,
    pub core_id: CoreId,
    pub priority: i64,
    /// Lower values are served first among equal priorities.
    pub group_priority: i64,
    pub data_predecessors: Vec<ActionId>,
    /// Actions that keep their resources until the worker goes away.
    pub releases_resources: bool,
}

impl SchedulableAction {
    /// An action with default priorities, no data dependencies and
    /// resources released at completion.
    pub fn new(id: ActionId, core_id: CoreId) -> Self {
        Self {
            id,
            core_id,
            priority: 0,
            group_priority: 0,
            data_predecessors: Vec::new(),
            releases_resources: true,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_group_priority(mut self, group_priority: i64) -> Self {
        self.group_priority = group_priority;
        self
    }

    /// Actions whose output this one reads.
    pub fn with_predecessors(mut self, predecessors: Vec<ActionId>) -> Self {
        self.data_predecessors = predecessors;
        self
    }

    /// Keep the resources reserved after completion.
    pub fn holding_resources(mut self) -> Self {
        self.releases_resources = false;
        self
    }
}

/// Where an action sits on its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Holds a slot on the gap timeline.
    Timeline,
    /// Parked: the worker cannot currently cover its requirements.
    ResourceBlocked,
    /// Parked: a data producer is itself blocked.
    DataBlocked,
}

/// Why an action is parked instead of placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Resources,
    Data,
}

/// Outcome of asking a worker to place an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlacementResult {
    /// Slot reserved on the timeline.
    Placed { start: Timestamp, end: Timestamp },
    /// Parked on a blocking list; retried by the next optimization.
    Blocked(BlockReason),
    /// A local optimization is running; the action is replayed when it ends.
    Deferred,
    Failed(String),
}

impl PlacementResult {
    pub fn is_placed(&self) -> bool {
        matches!(self, PlacementResult::Placed { .. })
    }
}

/// Order used to hand out work: higher priority first, then lower group
/// priority, then lower id.
pub fn selection_order(a: &SchedulableAction, b: &SchedulableAction) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.group_priority.cmp(&b.group_priority))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_prefers_priority_then_id() {
        let mut actions = vec![
            SchedulableAction::new(3, 0),
            SchedulableAction::new(1, 0),
            SchedulableAction::new(2, 0).with_priority(5),
            SchedulableAction::new(4, 0).with_priority(5).with_group_priority(-1),
        ];
        actions.sort_by(selection_order);
        let ids: Vec<_> = actions.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![4, 2, 1, 3]);
    }

    #[test]
    fn builder_defaults() {
        let a = SchedulableAction::new(7, 2).with_predecessors(vec![1, 2]);
        assert!(a.releases_resources);
        assert_eq!(a.data_predecessors, vec![1, 2]);
        assert!(!a.holding_resources().releases_resources);
    }
}
