//! Per-actor rate limiting for health broadcasts.
//!
//! A broadcast requested inside the minimum interval is parked, last value
//! wins, and released exactly once when the interval expires. Forced
//! requests (death, explicit damage) skip the limiter and discard whatever
//! was parked.

use nebula_net::{ActorId, Health};
use rustc_hash::FxHashMap;

use crate::interest::TIME_EPSILON;

/// Health broadcast limiter.
#[derive(Debug, Clone)]
pub struct HealthThrottle {
    min_interval: f64,
    last_sent: FxHashMap<ActorId, f64>,
    pending: FxHashMap<ActorId, Health>,
}

impl HealthThrottle {
    /// Limiter allowing one broadcast per actor every `min_interval` seconds.
    pub fn new(min_interval: f64) -> Self {
        Self {
            min_interval: min_interval.max(0.0),
            last_sent: FxHashMap::default(),
            pending: FxHashMap::default(),
        }
    }

    /// Ask to broadcast `health` for `actor` at `now`. Returns the value to
    /// send immediately, or `None` if it was parked.
    pub fn request(&mut self, actor: ActorId, health: Health, now: f64, force: bool) -> Option<Health> {
        let open = self
            .last_sent
            .get(&actor)
            .is_none_or(|&last| now - last + TIME_EPSILON >= self.min_interval);
        if force || open {
            self.pending.remove(&actor);
            self.last_sent.insert(actor, now);
            Some(health)
        } else {
            self.pending.insert(actor, health);
            None
        }
    }

    /// Release every parked broadcast whose interval has expired, sorted by
    /// actor.
    pub fn flush_due(&mut self, now: f64) -> Vec<(ActorId, Health)> {
        let mut due: Vec<ActorId> = self
            .pending
            .keys()
            .filter(|id| {
                self.last_sent
                    .get(id)
                    .is_none_or(|&last| now - last + TIME_EPSILON >= self.min_interval)
            })
            .copied()
            .collect();
        due.sort_unstable();

        due.into_iter()
            .filter_map(|id| {
                let health = self.pending.remove(&id)?;
                self.last_sent.insert(id, now);
                Some((id, health))
            })
            .collect()
    }

    /// Forget an actor entirely.
    pub fn cancel(&mut self, actor: ActorId) {
        self.pending.remove(&actor);
        self.last_sent.remove(&actor);
    }

    /// Number of parked broadcasts.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
