//! Gap timeline: time-ordered capacity intervals of one worker.
//!
//! A gap says "from `start` on, `resources` are available once `origin`
//! finishes". Free capacity has no origin. Gaps are kept sorted by start
//! and at most one gap exists per origin.

use serde::{Deserialize, Serialize};

use elastic_core::{Capacity, Timestamp, NEVER, ORIGIN};

use crate::action::ActionId;

/// Capacity that is free from `start` until `end`. `origin` is the
/// action releasing it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub start: Timestamp,
    pub end: Timestamp,
    pub origin: Option<ActionId>,
    pub resources: Capacity,
}

impl Gap {
    pub fn new(start: Timestamp, end: Timestamp, origin: Option<ActionId>, resources: Capacity) -> Self {
        Self {
            start,
            end,
            origin,
            resources,
        }
    }

    /// Free capacity available from the beginning of time.
    pub fn free(resources: Capacity) -> Self {
        Self::new(ORIGIN, NEVER, None, resources)
    }
}

/// Free capacity of one worker over time, sorted by start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapTimeline {
    gaps: Vec<Gap>,
}

impl GapTimeline {
    /// A timeline with all of `capacity` free.
    pub fn new(capacity: Capacity) -> Self {
        let mut timeline = Self::default();
        if capacity.is_consuming() {
            timeline.add_gap(Gap::free(capacity));
        }
        timeline
    }

    /// Rebuild a timeline from gaps produced by a simulation.
    pub fn from_gaps(gaps: Vec<Gap>) -> Self {
        let mut timeline = Self::default();
        for gap in gaps {
            timeline.add_gap(gap);
        }
        timeline
    }

    /// Insert a gap, merging it into the existing gap of the same origin.
    pub fn add_gap(&mut self, gap: Gap) {
        if let Some(existing) = self.gaps.iter_mut().find(|g| g.origin == gap.origin) {
            existing.resources.increase(&gap.resources);
            return;
        }
        let index = self.gaps.iter().take_while(|g| g.start <= gap.start).count();
        self.gaps.insert(index, gap);
    }

    /// Forget every gap released by `origin`.
    pub fn remove_origin(&mut self, origin: ActionId) {
        self.gaps.retain(|g| g.origin != Some(origin));
    }

    /// Consume gaps to cover `required` for an action whose data is ready at
    /// `data_ready`.
    ///
    /// Gaps starting at or before `data_ready` are used latest first, then
    /// later finite gaps earliest first. Returns the consumed pieces and
    /// whether `required` was fully covered. Exhausted gaps are removed.
    pub fn take_for(&mut self, required: &Capacity, data_ready: Timestamp) -> (Vec<Gap>, bool) {
        let mut remaining = *required;
        let mut pieces = Vec::new();

        let before: Vec<usize> = (0..self.gaps.len())
            .rev()
            .filter(|&i| self.gaps[i].start <= data_ready)
            .collect();
        let after: Vec<usize> = (0..self.gaps.len())
            .filter(|&i| self.gaps[i].start > data_ready && self.gaps[i].start < NEVER)
            .collect();

        for index in before.into_iter().chain(after) {
            if remaining.is_useless() {
                break;
            }
            let gap = &mut self.gaps[index];
            let used = Capacity::reduce_common(&mut gap.resources, &mut remaining);
            if used.is_consuming() {
                pieces.push(Gap::new(gap.start, NEVER, gap.origin, used));
            }
        }
        self.gaps.retain(|g| g.resources.is_consuming());
        (pieces, remaining.is_useless())
    }

    /// Consume `required` from gaps already open at `at`, earliest first.
    pub fn reserve(&mut self, required: &Capacity, at: Timestamp) -> Vec<Gap> {
        let mut remaining = *required;
        let mut pieces = Vec::new();
        for gap in self.gaps.iter_mut().filter(|g| g.start <= at) {
            if remaining.is_useless() {
                break;
            }
            let used = Capacity::reduce_common(&mut gap.resources, &mut remaining);
            if used.is_consuming() {
                pieces.push(Gap::new(gap.start, at, gap.origin, used));
            }
        }
        self.gaps.retain(|g| g.resources.is_consuming());
        pieces
    }

    /// Capacity already open at `at`.
    pub fn available_at(&self, at: Timestamp) -> Capacity {
        let mut total = Capacity::EMPTY;
        for gap in self.gaps.iter().filter(|g| g.start <= at) {
            total.increase(&gap.resources);
        }
        total
    }

    /// Earliest gap start at which the accumulated capacity covers
    /// `required`, or `NEVER`.
    pub fn cover_time(&self, required: &Capacity) -> Timestamp {
        let mut remaining = *required;
        if remaining.is_useless() {
            return self.gaps.first().map(|g| g.start).unwrap_or(ORIGIN);
        }
        for gap in self.gaps.iter().filter(|g| g.start < NEVER) {
            remaining.reduce(&gap.resources);
            if remaining.is_useless() {
                return gap.start;
            }
        }
        NEVER
    }

    /// Start of the earliest gap.
    pub fn first_start(&self) -> Option<Timestamp> {
        self.gaps.first().map(|g| g.start)
    }

    /// Start of the last finite gap: how far the worker is committed.
    pub fn last_start(&self) -> Option<Timestamp> {
        self.gaps.iter().rev().map(|g| g.start).find(|s| *s < NEVER)
    }

    /// Sum of every gap. Equals the worker capacity when nothing leaked.
    pub fn total(&self) -> Capacity {
        let mut total = Capacity::EMPTY;
        for gap in &self.gaps {
            total.increase(&gap.resources);
        }
        total
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gap> {
        self.gaps.iter()
    }

    pub fn len(&self) -> usize {
        self.gaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn into_gaps(self) -> Vec<Gap> {
        self.gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(start: Timestamp, origin: Option<ActionId>, cpu: u32) -> Gap {
        Gap::new(start, NEVER, origin, Capacity::cpus(cpu))
    }

    #[test]
    fn add_gap_keeps_start_order_and_merges_origins() {
        let mut timeline = GapTimeline::default();
        timeline.add_gap(gap(50, Some(2), 1));
        timeline.add_gap(gap(10, Some(1), 1));
        timeline.add_gap(gap(30, None, 2));
        timeline.add_gap(gap(99, Some(1), 3));

        let starts: Vec<_> = timeline.iter().map(|g| g.start).collect();
        assert_eq!(starts, vec![10, 30, 50]);
        assert_eq!(timeline.iter().next().map(|g| g.resources.cpu), Some(4));
    }

    #[test]
    fn take_for_prefers_latest_gap_before_data_ready() {
        let mut timeline = GapTimeline::new(Capacity::cpus(1));
        timeline.add_gap(gap(100, Some(1), 2));
        timeline.add_gap(gap(400, Some(2), 2));

        let (pieces, covered) = timeline.take_for(&Capacity::cpus(2), 200);

        assert!(covered);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].origin, Some(1));
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn take_for_falls_back_to_later_gaps_and_splits() {
        let mut timeline = GapTimeline::new(Capacity::cpus(1));
        timeline.add_gap(gap(100, Some(1), 2));

        let (pieces, covered) = timeline.take_for(&Capacity::cpus(2), 0);

        assert!(covered);
        let origins: Vec<_> = pieces.iter().map(|p| p.origin).collect();
        assert_eq!(origins, vec![None, Some(1)]);
        assert_eq!(timeline.total(), Capacity::cpus(1));
    }

    #[test]
    fn take_for_reports_partial_cover() {
        let mut timeline = GapTimeline::new(Capacity::cpus(1));
        timeline.add_gap(Gap::new(NEVER, NEVER, Some(9), Capacity::cpus(4)));
        let (pieces, covered) = timeline.take_for(&Capacity::cpus(2), 0);
        assert!(!covered);
        assert_eq!(pieces.len(), 1);
    }

    #[test]
    fn cover_time_accumulates_in_order() {
        let mut timeline = GapTimeline::new(Capacity::cpus(1));
        timeline.add_gap(gap(100, Some(1), 1));
        timeline.add_gap(gap(300, Some(2), 2));

        assert_eq!(timeline.cover_time(&Capacity::cpus(1)), ORIGIN);
        assert_eq!(timeline.cover_time(&Capacity::cpus(2)), 100);
        assert_eq!(timeline.cover_time(&Capacity::cpus(4)), 300);
        assert_eq!(timeline.cover_time(&Capacity::cpus(5)), NEVER);
    }

    #[test]
    fn reserve_only_uses_open_gaps() {
        let mut timeline = GapTimeline::new(Capacity::cpus(1));
        timeline.add_gap(gap(100, Some(1), 2));

        let pieces = timeline.reserve(&Capacity::cpus(3), 50);

        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].origin, None);
        assert_eq!(timeline.available_at(50), Capacity::EMPTY);
        assert_eq!(timeline.available_at(100), Capacity::cpus(2));
    }

    #[test]
    fn last_start_skips_never() {
        let mut timeline = GapTimeline::new(Capacity::cpus(1));
        timeline.add_gap(gap(70, Some(1), 1));
        timeline.add_gap(Gap::new(NEVER, NEVER, Some(2), Capacity::cpus(1)));
        assert_eq!(timeline.last_start(), Some(70));
        assert_eq!(timeline.first_start(), Some(ORIGIN));
    }
}
