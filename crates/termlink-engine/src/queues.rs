//! Bounded priority queues of pending event ids
//!
//! Three tiers: alarm (critical), overflow (RAS window), and default
//! (keepalive). An event id lives in at most one tier at a time; enqueueing
//! an id that is already queued anywhere is a no-op, and inserts beyond a
//! tier's capacity are rejected without disturbing existing entries.

use std::collections::VecDeque;

use termlink_proto::EventId;

/// Priority class of a queued event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Alarm,
    Overflow,
    Default,
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
    /// Tier at capacity; the id was not inserted
    Rejected,
}

/// The three bounded tiers
#[derive(Debug)]
pub struct EventQueues {
    capacity: usize,
    alarm: VecDeque<EventId>,
    overflow: VecDeque<EventId>,
    default: VecDeque<EventId>,
}

impl EventQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            alarm: VecDeque::new(),
            overflow: VecDeque::new(),
            default: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, priority: Priority, id: EventId) -> EnqueueOutcome {
        if self.contains(id) {
            return EnqueueOutcome::AlreadyQueued;
        }
        let capacity = self.capacity;
        let queue = self.tier_mut(priority);
        if queue.len() >= capacity {
            return EnqueueOutcome::Rejected;
        }
        queue.push_back(id);
        EnqueueOutcome::Queued
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.alarm.contains(&id) || self.overflow.contains(&id) || self.default.contains(&id)
    }

    /// Highest-priority pending id, alarm before overflow before default
    pub fn front(&self) -> Option<(Priority, EventId)> {
        self.alarm
            .front()
            .map(|&id| (Priority::Alarm, id))
            .or_else(|| self.overflow.front().map(|&id| (Priority::Overflow, id)))
            .or_else(|| self.default.front().map(|&id| (Priority::Default, id)))
    }

    /// Drop `id` from whichever tier holds it
    pub fn remove(&mut self, id: EventId) -> bool {
        for queue in [&mut self.alarm, &mut self.overflow, &mut self.default] {
            if let Some(pos) = queue.iter().position(|&x| x == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Discard the overflow tier's front entry (terminus reported nothing
    /// pending, so the overflow id it covered is stale).
    pub fn pop_overflow_front(&mut self) -> Option<EventId> {
        self.overflow.pop_front()
    }

    /// "No alarm or overflow events pending" — gates disruptive operations
    pub fn alarm_tiers_empty(&self) -> bool {
        self.alarm.is_empty() && self.overflow.is_empty()
    }

    pub fn len(&self) -> usize {
        self.alarm.len() + self.overflow.len() + self.default.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<EventId> {
        match priority {
            Priority::Alarm => &mut self.alarm,
            Priority::Overflow => &mut self.overflow,
            Priority::Default => &mut self.default,
        }
    }
}
