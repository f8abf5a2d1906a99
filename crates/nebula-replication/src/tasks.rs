//! Cooperative work queue drained a little each tick.
//!
//! Work that would stall a frame if done at once (applying a large snapshot)
//! is queued here and consumed under an item budget and a wall-time budget,
//! yielding back to the frame loop when either runs out.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Budget for one tick's worth of draining.
#[derive(Debug, Clone, Copy)]
pub struct TickBudget {
    started: Instant,
    taken: usize,
    max_items: usize,
    max_time: Duration,
}

impl TickBudget {
    /// `true` once no more items may be taken this tick.
    pub fn exhausted(&self) -> bool {
        if self.taken >= self.max_items {
            return true;
        }
        // At least one item is taken per tick.
        self.taken > 0 && !self.max_time.is_zero() && self.started.elapsed() >= self.max_time
    }

    /// Items taken so far.
    pub fn taken(&self) -> usize {
        self.taken
    }
}

/// Bounded FIFO with per-tick budgets. When full, the oldest item is
/// dropped to make room.
#[derive(Debug, Clone)]
pub struct CooperativeQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    per_tick: usize,
    time_budget: Duration,
    dropped: u64,
}

impl<T> CooperativeQueue<T> {
    /// Queue holding at most `capacity` items, draining at most `per_tick`
    /// items and `time_budget` of wall time per tick. A zero time budget
    /// means only the item budget applies.
    pub fn new(capacity: usize, per_tick: usize, time_budget: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            per_tick: per_tick.max(1),
            time_budget,
            dropped: 0,
        }
    }

    /// Enqueue an item. Returns the item evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Start a tick's budget.
    pub fn begin_tick(&self) -> TickBudget {
        TickBudget {
            started: Instant::now(),
            taken: 0,
            max_items: self.per_tick,
            max_time: self.time_budget,
        }
    }

    /// Take the next item if the budget allows.
    pub fn pop(&mut self, budget: &mut TickBudget) -> Option<T> {
        if budget.exhausted() {
            return None;
        }
        let item = self.items.pop_front()?;
        budget.taken += 1;
        Some(item)
    }

    /// Run `f` on as many items as this tick's budget allows. Returns how
    /// many were processed.
    pub fn drain(&mut self, mut f: impl FnMut(T)) -> usize {
        let mut budget = self.begin_tick();
        while let Some(item) = self.pop(&mut budget) {
            f(item);
        }
        budget.taken()
    }

    /// Keep only items matching `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Items waiting.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items evicted by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
