//! Timer entries for the event loop's delayed and periodic tasks.

use core::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::error::Completion;
use crate::functor::Functor;

use super::EventLoop;

/// One scheduled task: a callable, an absolute deadline, and an interval
/// (zero for one-shot entries). Deadlines are absolute so periodic
/// rescheduling does not drift.
pub(crate) struct TimerEntry {
    pub functor: Functor<EventLoop, Completion>,
    pub deadline: Instant,
    pub interval: Duration,
}

impl TimerEntry {
    pub fn is_periodic(&self) -> bool {
        !self.interval.is_zero()
    }
}

// The heap is a max-heap; invert the deadline comparison so the earliest
// entry surfaces first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}
