// Pending task queue ordered by fire time

use crate::task::{TaskDescriptor, TaskId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// A task waiting for its next fire time
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub fire_time: DateTime<Utc>,
    /// Insertion sequence, breaks ties between equal fire times
    pub seq: u64,
    pub descriptor: Arc<TaskDescriptor>,
}

// Ordered by (fire_time, seq) ascending; comparison reversed for the max-heap
impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.fire_time.cmp(&self.fire_time) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Min-heap of scheduled entries, owned by the dispatch loop
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    heap: BinaryHeap<ScheduledEntry>,
    next_seq: u64,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: Arc<TaskDescriptor>, fire_time: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEntry {
            fire_time,
            seq,
            descriptor,
        });
    }

    /// Earliest pending fire time
    pub fn peek_fire_time(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|entry| entry.fire_time)
    }

    /// Pop the earliest entry if it is due at or before `now`
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<ScheduledEntry> {
        if self.peek_fire_time()? <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Drop every pending entry of a task; returns whether one was present
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.descriptor.id() != task_id);
        self.heap.len() != before
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.heap.iter().any(|entry| entry.descriptor.id() == task_id)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
