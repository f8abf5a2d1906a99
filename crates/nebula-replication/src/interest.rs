//! Server-side interest management: which peers watch which actor, and the
//! distance-tiered policy deciding when a watcher is owed a pose update.
//!
//! Per (actor, peer) pair the state machine is `Unwatched -> Watching` on an
//! accepted activation request and `Watching -> Unwatched` on peer
//! disconnect or actor deactivation. The registry has no timers; the
//! server drives it.

use glam::Vec3;
use nebula_net::{ActorId, PeerId, Pose};
use rustc_hash::FxHashMap;

use crate::actor::ActorEntry;
use crate::collab::PeerDirectory;

/// Slack applied to interval comparisons so that fixed-step clocks built
/// from repeated float additions do not skip a due update.
pub const TIME_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// WatcherRegistry
// ---------------------------------------------------------------------------

/// Bookkeeping for one (actor, watcher) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchRecord {
    /// Server time the watch started.
    pub since: f64,
    /// Server time of the last pose update sent to this watcher.
    pub last_sent: Option<f64>,
    /// Pose carried by that update.
    pub last_pose: Option<Pose>,
}

/// Result of an activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The peer now watches the actor.
    Added,
    /// The peer was already watching.
    AlreadyWatching,
    /// The actor is deactivated or gone; request refused.
    ActorInactive,
}

/// Actor id → watching peers.
#[derive(Debug, Clone, Default)]
pub struct WatcherRegistry {
    watchers: FxHashMap<ActorId, FxHashMap<PeerId, WatchRecord>>,
}

impl WatcherRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle an activation request from `peer` for `entry`.
    pub fn watch(&mut self, entry: &ActorEntry, peer: PeerId, now: f64) -> WatchOutcome {
        if !entry.activated || entry.is_gone() {
            return WatchOutcome::ActorInactive;
        }
        let set = self.watchers.entry(entry.id()).or_default();
        if set.contains_key(&peer) {
            return WatchOutcome::AlreadyWatching;
        }
        set.insert(
            peer,
            WatchRecord {
                since: now,
                last_sent: None,
                last_pose: None,
            },
        );
        WatchOutcome::Added
    }

    /// Stop `peer` watching `actor`. Returns `true` if it was watching.
    pub fn unwatch(&mut self, actor: ActorId, peer: PeerId) -> bool {
        let Some(set) = self.watchers.get_mut(&actor) else {
            return false;
        };
        let removed = set.remove(&peer).is_some();
        if set.is_empty() {
            self.watchers.remove(&actor);
        }
        removed
    }

    /// Drop `peer` from every watcher set. Returns how many it left.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) -> usize {
        let mut removed = 0;
        self.watchers.retain(|_, set| {
            if set.remove(&peer).is_some() {
                removed += 1;
            }
            !set.is_empty()
        });
        removed
    }

    /// Clear every watcher of `actor`. Returns how many there were.
    pub fn on_actor_deactivated(&mut self, actor: ActorId) -> usize {
        self.watchers.remove(&actor).map_or(0, |set| set.len())
    }

    /// Drop watchers that are no longer connected.
    pub fn retain_connected(&mut self, connected: &[PeerId]) {
        self.watchers.retain(|_, set| {
            set.retain(|peer, _| connected.contains(peer));
            !set.is_empty()
        });
    }

    /// Watching peers of `actor`, sorted, or `None` if nobody watches it.
    pub fn watchers(&self, actor: ActorId) -> Option<Vec<PeerId>> {
        let set = self.watchers.get(&actor)?;
        let mut peers: Vec<PeerId> = set.keys().copied().collect();
        peers.sort_unstable();
        Some(peers)
    }

    /// `true` if `peer` watches `actor`.
    pub fn is_watching(&self, actor: ActorId, peer: PeerId) -> bool {
        self.watchers
            .get(&actor)
            .is_some_and(|set| set.contains_key(&peer))
    }

    /// Number of watchers of `actor`.
    pub fn watcher_count(&self, actor: ActorId) -> usize {
        self.watchers.get(&actor).map_or(0, |set| set.len())
    }

    /// Bookkeeping for one pair.
    pub fn record(&self, actor: ActorId, peer: PeerId) -> Option<&WatchRecord> {
        self.watchers.get(&actor)?.get(&peer)
    }

    /// Note that a pose update went out to `peer`.
    pub fn mark_sent(&mut self, actor: ActorId, peer: PeerId, pose: Pose, now: f64) {
        if let Some(record) = self
            .watchers
            .get_mut(&actor)
            .and_then(|set| set.get_mut(&peer))
        {
            record.last_sent = Some(now);
            record.last_pose = Some(pose);
        }
    }

    /// Distance from `position` to each watcher of `actor` whose position
    /// is known, sorted by peer.
    pub fn watcher_distances(
        &self,
        actor: ActorId,
        position: Vec3,
        peers: &(impl PeerDirectory + ?Sized),
    ) -> Vec<(PeerId, f32)> {
        let Some(watching) = self.watchers(actor) else {
            return Vec::new();
        };
        watching
            .into_iter()
            .filter_map(|peer| {
                peers
                    .peer_position(peer)
                    .map(|p| (peer, p.distance(position)))
            })
            .collect()
    }

    /// Distance from the actor's last known position to its nearest
    /// watcher, or `None` when no watcher position is known.
    pub fn nearest_watcher_distance(
        &self,
        entry: &ActorEntry,
        peers: &(impl PeerDirectory + ?Sized),
    ) -> Option<f32> {
        self.watcher_distances(entry.id(), entry.pose().position, peers)
            .into_iter()
            .map(|(_, d)| d)
            .reduce(f32::min)
    }
}

// ---------------------------------------------------------------------------
// PosePolicy
// ---------------------------------------------------------------------------

/// Distance band a watcher falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceTier {
    /// Within the near band: base interval.
    Near,
    /// Within the mid band: slower interval.
    Mid,
    /// Beyond both: no pose updates.
    Far,
}

/// Distance-tiered pose update policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PosePolicy {
    /// Interval for near watchers (seconds).
    pub base_interval: f64,
    /// Interval for mid watchers (seconds).
    pub mid_interval: f64,
    /// Near band radius (meters).
    pub near_band: f32,
    /// Mid band radius (meters).
    pub mid_band: f32,
    /// Local pose record interval when nobody is in range (seconds).
    pub idle_interval: f64,
    /// Movement worth an update (meters).
    pub min_position_delta: f32,
    /// Rotation worth an update (degrees).
    pub min_rotation_delta_deg: f32,
    /// Refresh interval for a watched actor that is not moving (seconds).
    pub keepalive: f64,
}

impl Default for PosePolicy {
    fn default() -> Self {
        Self::from(&nebula_config::ServerConfig::default())
    }
}

impl From<&nebula_config::ServerConfig> for PosePolicy {
    fn from(config: &nebula_config::ServerConfig) -> Self {
        Self {
            base_interval: config.base_pose_interval,
            mid_interval: config.mid_pose_interval.max(config.base_pose_interval),
            near_band: config.near_band,
            mid_band: config.mid_band.max(config.near_band),
            idle_interval: config.idle_record_interval,
            min_position_delta: config.min_position_delta,
            min_rotation_delta_deg: config.min_rotation_delta_deg,
            keepalive: config.pose_keepalive,
        }
    }
}

impl PosePolicy {
    /// Band for a watcher at `distance` meters.
    pub fn tier(&self, distance: f32) -> DistanceTier {
        if distance <= self.near_band {
            DistanceTier::Near
        } else if distance <= self.mid_band {
            DistanceTier::Mid
        } else {
            DistanceTier::Far
        }
    }

    /// Update interval for a band, `None` for `Far`.
    pub fn interval(&self, tier: DistanceTier) -> Option<f64> {
        match tier {
            DistanceTier::Near => Some(self.base_interval),
            DistanceTier::Mid => Some(self.mid_interval),
            DistanceTier::Far => None,
        }
    }

    /// Whether a watcher at `distance` with bookkeeping `record` is owed an
    /// update carrying `pose` at `now`.
    pub fn update_due(&self, record: &WatchRecord, pose: &Pose, distance: f32, now: f64) -> bool {
        let Some(interval) = self.interval(self.tier(distance)) else {
            return false;
        };
        let (Some(last_sent), Some(last_pose)) = (record.last_sent, record.last_pose) else {
            return true;
        };
        let elapsed = now - last_sent + TIME_EPSILON;
        if elapsed < interval {
            return false;
        }
        let moved = last_pose.position.distance(pose.position) >= self.min_position_delta;
        let turned = last_pose.rotation.angle_between(pose.rotation).to_degrees()
            >= self.min_rotation_delta_deg;
        moved || turned || elapsed >= self.keepalive
    }

    /// Whether an actor without in-range watchers should record its pose.
    pub fn idle_record_due(&self, last_record: f64, now: f64) -> bool {
        now - last_record + TIME_EPSILON >= self.idle_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerTable;
    use glam::Quat;
    use nebula_net::SceneRef;

    fn active(id: u64) -> ActorEntry {
        let mut entry = ActorEntry::new(ActorId(id), SceneRef::default(), 16.0);
        entry.set_activated(true);
        entry
    }

    #[test]
    fn test_watch_requires_activated_actor() {
        let mut registry = WatcherRegistry::new();
        let mut peers = PeerTable::new();
        let peer = peers.connect();

        let mut dormant = active(1);
        dormant.set_activated(false);
        assert_eq!(registry.watch(&dormant, peer, 0.0), WatchOutcome::ActorInactive);
        assert_eq!(registry.watchers(ActorId(1)), None);

        let entry = active(1);
        assert_eq!(registry.watch(&entry, peer, 0.0), WatchOutcome::Added);
        assert_eq!(registry.watch(&entry, peer, 1.0), WatchOutcome::AlreadyWatching);
        assert_eq!(registry.watchers(ActorId(1)), Some(vec![peer]));
    }

    #[test]
    fn test_dead_actor_cannot_be_watched() {
        let mut registry = WatcherRegistry::new();
        let mut entry = active(1);
        entry.mark_dead();
        let peer = PeerTable::new().connect();
        assert_eq!(registry.watch(&entry, peer, 0.0), WatchOutcome::ActorInactive);
    }

    #[test]
    fn test_disconnect_and_deactivate_clear_watchers() {
        let mut registry = WatcherRegistry::new();
        let mut peers = PeerTable::new();
        let a = peers.connect();
        let b = peers.connect();
        registry.watch(&active(1), a, 0.0);
        registry.watch(&active(1), b, 0.0);
        registry.watch(&active(2), a, 0.0);

        assert_eq!(registry.on_peer_disconnected(a), 2);
        assert_eq!(registry.watchers(ActorId(1)), Some(vec![b]));
        assert_eq!(registry.watchers(ActorId(2)), None);

        assert_eq!(registry.on_actor_deactivated(ActorId(1)), 1);
        assert_eq!(registry.watcher_count(ActorId(1)), 0);
    }

    #[test]
    fn test_retain_connected_drops_stale_generation() {
        let mut registry = WatcherRegistry::new();
        let mut peers = PeerTable::new();
        let old = peers.connect();
        registry.watch(&active(1), old, 0.0);
        peers.disconnect(old);
        let new = peers.connect();

        registry.retain_connected(&peers.connected_peers());
        assert!(!registry.is_watching(ActorId(1), old));
        assert!(!registry.is_watching(ActorId(1), new));
    }

    #[test]
    fn test_nearest_watcher_distance() {
        let mut registry = WatcherRegistry::new();
        let mut peers = PeerTable::new();
        let near = peers.connect();
        let far = peers.connect();
        let unknown = peers.connect();
        peers.set_position(near, Vec3::new(10.0, 0.0, 0.0));
        peers.set_position(far, Vec3::new(0.0, 0.0, 90.0));

        let entry = active(1);
        assert_eq!(registry.nearest_watcher_distance(&entry, &peers), None);
        for peer in [near, far, unknown] {
            registry.watch(&entry, peer, 0.0);
        }
        assert_eq!(registry.nearest_watcher_distance(&entry, &peers), Some(10.0));
        assert_eq!(
            registry.watcher_distances(ActorId(1), Vec3::ZERO, &peers).len(),
            2
        );
    }

    #[test]
    fn test_tiers_follow_bands() {
        let policy = PosePolicy::default();
        assert_eq!(policy.tier(10.0), DistanceTier::Near);
        assert_eq!(policy.tier(60.0), DistanceTier::Mid);
        assert_eq!(policy.tier(70.0), DistanceTier::Far);
        assert_eq!(policy.interval(DistanceTier::Far), None);
    }

    #[test]
    fn test_first_update_is_unconditional() {
        let policy = PosePolicy::default();
        let record = WatchRecord {
            since: 0.0,
            last_sent: None,
            last_pose: None,
        };
        assert!(policy.update_due(&record, &Pose::default(), 5.0, 0.0));
        assert!(!policy.update_due(&record, &Pose::default(), 500.0, 0.0));
    }

    #[test]
    fn test_update_needs_interval_and_change() {
        let policy = PosePolicy::default();
        let record = WatchRecord {
            since: 0.0,
            last_sent: Some(1.0),
            last_pose: Some(Pose::default()),
        };
        let moved = Pose::at(Vec3::new(1.0, 0.0, 0.0));
        let turned = Pose {
            rotation: Quat::from_rotation_y(5f32.to_radians()),
            ..Pose::default()
        };

        assert!(!policy.update_due(&record, &moved, 5.0, 1.05));
        assert!(policy.update_due(&record, &moved, 5.0, 1.1));
        assert!(policy.update_due(&record, &turned, 5.0, 1.1));
        assert!(!policy.update_due(&record, &Pose::default(), 5.0, 1.1));
        // Mid band waits longer.
        assert!(!policy.update_due(&record, &moved, 60.0, 1.1));
        assert!(policy.update_due(&record, &moved, 60.0, 1.25));
        // Keepalive refreshes a stationary actor.
        assert!(policy.update_due(&record, &Pose::default(), 5.0, 3.0));
    }
}
