//! Shared view of where every live action is expected to run.
//!
//! Workers publish their placements here; other workers read it to find
//! when the data their actions consume will be produced. Every access is
//! a single short critical section and never nests with another lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use elastic_core::Timestamp;

use crate::action::ActionId;

/// Where and when an action is expected to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTiming {
    /// Worker the action is assigned to, if any.
    pub worker: Option<String>,
    pub expected_start: Timestamp,
    pub expected_end: Timestamp,
    /// False while the action waits to be (re)placed.
    pub scheduled: bool,
}

impl ActionTiming {
    /// Timing of an action no worker holds yet.
    pub fn unassigned() -> Self {
        Self {
            worker: None,
            expected_start: 0,
            expected_end: 0,
            scheduled: false,
        }
    }
}

/// Cloneable handle to the session-wide timing table.
///
/// Finished actions are removed; an id missing from the board is treated
/// as already produced.
#[derive(Debug, Clone, Default)]
pub struct ActionBoard {
    inner: Arc<RwLock<HashMap<ActionId, ActionTiming>>>,
}

impl ActionBoard {
    /// An empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action that exists but is not placed yet.
    pub fn register(&self, id: ActionId) {
        let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        board.entry(id).or_insert_with(ActionTiming::unassigned);
    }

    /// Record the current timing of `id`.
    pub fn publish(&self, id: ActionId, timing: ActionTiming) {
        let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        board.insert(id, timing);
    }

    /// Keep the entry but mark it as waiting for placement.
    pub fn mark_unscheduled(&self, id: ActionId) {
        let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(timing) = board.get_mut(&id) {
            timing.scheduled = false;
            timing.worker = None;
        }
    }

    /// Drop a finished action.
    pub fn remove(&self, id: ActionId) {
        let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        board.remove(&id);
    }

    /// Timing of `id`, if it is still on the board.
    pub fn get(&self, id: ActionId) -> Option<ActionTiming> {
        let board = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        board.get(&id).cloned()
    }

    pub fn contains(&self, id: ActionId) -> bool {
        let board = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        board.contains_key(&id)
    }

    /// Latest expected end among the scheduled actions in `ids`.
    ///
    /// Unscheduled and finished producers do not delay the consumer.
    pub fn data_ready_time(&self, ids: &[ActionId]) -> Timestamp {
        let board = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .filter_map(|id| board.get(id))
            .filter(|t| t.scheduled)
            .map(|t| t.expected_end)
            .fold(0, Timestamp::max)
    }

    /// Whether every id in `ids` has finished.
    pub fn all_finished(&self, ids: &[ActionId]) -> bool {
        let board = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter().all(|id| !board.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(worker: &str, end: Timestamp) -> ActionTiming {
        ActionTiming {
            worker: Some(worker.into()),
            expected_start: 0,
            expected_end: end,
            scheduled: true,
        }
    }

    #[test]
    fn data_ready_ignores_unscheduled_and_finished() {
        let board = ActionBoard::new();
        board.publish(1, timing("w1", 300));
        board.publish(2, timing("w2", 900));
        board.register(3);
        board.mark_unscheduled(2);

        assert_eq!(board.data_ready_time(&[1, 2, 3, 4]), 300);
        assert_eq!(board.data_ready_time(&[]), 0);
    }

    #[test]
    fn finished_actions_leave_the_board() {
        let board = ActionBoard::new();
        board.publish(1, timing("w1", 10));
        assert!(!board.all_finished(&[1]));
        board.remove(1);
        assert!(board.all_finished(&[1]));
        assert!(board.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let board = ActionBoard::new();
        let other = board.clone();
        other.publish(5, timing("w", 42));
        assert_eq!(board.get(5).map(|t| t.expected_end), Some(42));
    }
}
