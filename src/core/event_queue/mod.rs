//! Time-ordered priority list of pending receive events.
//!
//! §4.4 calls for single-pass O(n) insertion that ties-break by insertion
//! order, which is exactly what the reference's `ProcQueue` does with a
//! hand-rolled linked list (`_AddQueueItem` walks until it finds the first
//! entry whose `inTime` is greater, then splices before it). A
//! `BinaryHeap` does not give a free insertion-order tie-break, so this is
//! implemented as an ordered `VecDeque` walked linearly on insert — a
//! deliberate departure from the teacher's own `Clock`, which uses a heap
//! for a scheduler that has no such tie-break requirement.

use std::collections::VecDeque;

use crate::core::byte::{Byte, Command, Direction};
use crate::core::asic::NodeId;

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub target: NodeId,
    pub source_direction: Direction,
    pub byte: Byte,
    pub completion_time: f64,
    pub command: Option<Command>,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    entries: VecDeque<QueuedEvent>,
    processed: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            entries: VecDeque::new(),
            processed: 0,
        }
    }

    /// Insert preserving ascending `completion_time` order; equal times
    /// keep insertion order by being placed after every existing entry
    /// with an equal or smaller time (matches `curItem > newItem` walk).
    pub fn push(&mut self, event: QueuedEvent) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.completion_time > event.completion_time)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, event);
    }

    pub fn pop(&mut self) -> Option<QueuedEvent> {
        let event = self.entries.pop_front();
        if event.is_some() {
            self.processed += 1;
        }
        event
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::byte::Byte;

    fn dummy_event(target: NodeId, completion_time: f64) -> QueuedEvent {
        QueuedEvent {
            target,
            source_direction: Direction::North,
            byte: Byte::data(0, 0, 0, 0),
            completion_time,
            command: None,
        }
    }

    #[test]
    fn pops_in_ascending_completion_time_order() {
        let mut queue = EventQueue::new();
        queue.push(dummy_event(NodeId::Asic(0), 3.0));
        queue.push(dummy_event(NodeId::Asic(1), 1.0));
        queue.push(dummy_event(NodeId::Asic(2), 2.0));

        assert_eq!(queue.pop().unwrap().target, NodeId::Asic(1));
        assert_eq!(queue.pop().unwrap().target, NodeId::Asic(2));
        assert_eq!(queue.pop().unwrap().target, NodeId::Asic(0));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn equal_times_tie_break_by_insertion_order() {
        let mut queue = EventQueue::new();
        queue.push(dummy_event(NodeId::Asic(0), 5.0));
        queue.push(dummy_event(NodeId::Asic(1), 5.0));

        assert_eq!(queue.pop().unwrap().target, NodeId::Asic(0));
        assert_eq!(queue.pop().unwrap().target, NodeId::Asic(1));
    }
}
