//! Timer heap for deadline management.
//!
//! A min-heap of `(deadline, task)` pairs ordered by absolute deadline,
//! with FIFO tie-break among equal deadlines and lazy deletion so that
//! cancelling a sleeping task is O(1).

use crate::task::TaskId;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    task: TaskId,
    seq: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first, then
        // insertion order).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timers ordered by deadline.
///
/// At most one live timer per task. Removal tombstones the entry by
/// dropping it from the `active` map; stale heap entries are skipped when
/// they surface.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    active: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl TimerHeap {
    /// Creates a new empty timer heap.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live timers.
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns true if no live timers remain.
    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Adds a timer for a task with the given deadline.
    pub(crate) fn insert(&mut self, task: TaskId, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug_assert!(
            !self.active.contains_key(&task),
            "a task holds at most one timer"
        );
        self.active.insert(task, seq);
        self.heap.push(TimerEntry {
            deadline,
            task,
            seq,
        });
    }

    /// Removes the timer for `task`, if one is live.
    pub(crate) fn remove(&mut self, task: TaskId) {
        self.active.remove(&task);
    }

    /// Returns the earliest live deadline, discarding stale entries.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.active.get(&entry.task) == Some(&entry.seq) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops all tasks whose deadline is `<= now`, earliest first with FIFO
    /// tie-break.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> SmallVec<[TaskId; 4]> {
        let mut expired = SmallVec::new();
        while let Some(entry) = self.heap.peek() {
            if self.active.get(&entry.task) != Some(&entry.seq) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                self.active.remove(&entry.task);
                expired.push(entry.task);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::time::Duration;

    fn task(n: u64) -> TaskId {
        TaskId(n)
    }

    #[test]
    fn empty_heap_has_no_deadline() {
        init_test_logging();
        let mut heap = TimerHeap::new();
        assert!(heap.is_empty());
        assert_eq!(heap.next_deadline(), None);
    }

    #[test]
    fn insert_orders_by_deadline() {
        init_test_logging();
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.insert(task(1), base + Duration::from_millis(200));
        heap.insert(task(2), base + Duration::from_millis(100));
        heap.insert(task(3), base + Duration::from_millis(150));

        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(100)));
    }

    #[test]
    fn pop_expired_returns_due_tasks_in_order() {
        init_test_logging();
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.insert(task(1), base + Duration::from_millis(100));
        heap.insert(task(2), base + Duration::from_millis(200));
        heap.insert(task(3), base + Duration::from_millis(50));

        let expired = heap.pop_expired(base + Duration::from_millis(125));
        assert_eq!(expired.as_slice(), &[task(3), task(1)]);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(200)));
    }

    #[test]
    fn same_deadline_pops_in_insertion_order() {
        init_test_logging();
        let deadline = Instant::now() + Duration::from_millis(100);
        let mut heap = TimerHeap::new();
        heap.insert(task(1), deadline);
        heap.insert(task(2), deadline);
        heap.insert(task(3), deadline);

        let expired = heap.pop_expired(deadline);
        assert_eq!(expired.as_slice(), &[task(1), task(2), task(3)]);
    }

    #[test]
    fn pop_expired_includes_exact_deadline() {
        init_test_logging();
        let deadline = Instant::now() + Duration::from_millis(250);
        let mut heap = TimerHeap::new();
        heap.insert(task(7), deadline);

        let expired = heap.pop_expired(deadline);
        assert_eq!(expired.as_slice(), &[task(7)]);
        assert!(heap.is_empty());
    }

    #[test]
    fn removed_timer_never_fires() {
        init_test_logging();
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.insert(task(1), base + Duration::from_millis(10));
        heap.insert(task(2), base + Duration::from_millis(20));
        heap.remove(task(1));

        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(20)));
        let expired = heap.pop_expired(base + Duration::from_millis(50));
        assert_eq!(expired.as_slice(), &[task(2)]);
    }

    #[test]
    fn reinsert_after_remove_uses_new_deadline() {
        init_test_logging();
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.insert(task(1), base + Duration::from_millis(10));
        heap.remove(task(1));
        heap.insert(task(1), base + Duration::from_millis(30));

        // The stale entry for the first insert is skipped; only the live
        // one fires.
        let expired = heap.pop_expired(base + Duration::from_millis(15));
        assert!(expired.is_empty());
        let expired = heap.pop_expired(base + Duration::from_millis(30));
        assert_eq!(expired.as_slice(), &[task(1)]);
        assert!(heap.is_empty());
    }
}
