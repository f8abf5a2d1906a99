//! Server-role replication manager.
//!
//! Owns the authoritative actor table. Every tick it samples each live
//! controller, broadcasts activation changes, sends distance-tiered pose
//! updates to watchers, records idle poses for unwatched actors, flushes
//! throttled health broadcasts, and runs the periodic snapshot broadcast.
//! Inbound client messages (health/buff reports, activation and snapshot
//! requests) arrive through [`ReplicationServer::handle_packet`].

use std::collections::BTreeMap;

use nebula_config::{Config, ServerConfig};
use nebula_net::{
    ActivationState, ActorId, ActorState, BuffBroadcast, BuffRecord, CodecConfig, DeliveryPolicy,
    Despawn, DespawnReason, Endpoint, Health, HealthBroadcast, HealthReport, Message, MessageKind,
    PeerId, SceneRef, SnapshotRequest, Spawn, StateUpdate, TrafficCounters,
};

use crate::actor::ActorEntry;
use crate::collab::{ControllerHandle, ControllerSample, DamageOutcome, ServerHost};
use crate::error::ReplicationError;
use crate::interest::{PosePolicy, WatchOutcome, WatcherRegistry};
use crate::snapshot::{BroadcastSchedule, SnapshotWriter};
use crate::throttle::HealthThrottle;

/// Running totals for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Ticks processed.
    pub ticks: u64,
    /// Actors registered.
    pub registered: u64,
    /// Registrations refused (blocked scene, capture failed).
    pub refused: u64,
    /// Idle pose records for actors without in-range watchers.
    pub idle_records: u64,
    /// StateUpdate messages sent.
    pub pose_updates: u64,
    /// Deaths processed.
    pub deaths: u64,
    /// Forced deaths after a report could not be applied.
    pub forced_deaths: u64,
    /// Per-actor tick failures (logged and skipped).
    pub actor_errors: u64,
    /// Full snapshot streams sent.
    pub snapshots_served: u64,
}

#[derive(Debug)]
struct ServerActor {
    entry: ActorEntry,
    handle: ControllerHandle,
    last_idle_record: f64,
}

/// Authoritative replication manager.
#[derive(Debug)]
pub struct ReplicationServer<H: ServerHost> {
    host: H,
    config: ServerConfig,
    policy: PosePolicy,
    cell_size: f32,
    endpoint: Endpoint,
    actors: BTreeMap<ActorId, ServerActor>,
    watchers: WatcherRegistry,
    throttle: HealthThrottle,
    writer: SnapshotWriter,
    broadcast: BroadcastSchedule,
    next_id: u64,
    clock: f64,
    stats: ServerStats,
}

impl<H: ServerHost> ReplicationServer<H> {
    /// Manager using the default delivery policy.
    pub fn new(config: &Config, host: H) -> Self {
        Self::with_policy(config, DeliveryPolicy::default(), host)
    }

    /// Manager with an explicit delivery policy.
    pub fn with_policy(config: &Config, delivery: DeliveryPolicy, host: H) -> Self {
        Self {
            host,
            config: config.server.clone(),
            policy: PosePolicy::from(&config.server),
            cell_size: config.client.position_cell_size,
            endpoint: Endpoint::new(CodecConfig::from(&config.network), delivery),
            actors: BTreeMap::new(),
            watchers: WatcherRegistry::new(),
            throttle: HealthThrottle::new(config.server.health_min_interval),
            writer: SnapshotWriter::new(config.snapshot.chunk_capacity),
            broadcast: BroadcastSchedule::new(
                config.snapshot.server_broadcast_interval,
                config.snapshot.server_retry_interval,
                0.0,
            ),
            next_id: 1,
            clock: 0.0,
            stats: ServerStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The host, mutably (tests and simulations drive it directly).
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Session time in seconds.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Look up an actor.
    pub fn try_get_actor(&self, id: ActorId) -> Option<&ActorEntry> {
        self.actors.get(&id).map(|a| &a.entry)
    }

    /// Every actor, including dead and despawned ones.
    pub fn actors(&self) -> impl Iterator<Item = &ActorEntry> {
        self.actors.values().map(|a| &a.entry)
    }

    /// Watcher bookkeeping.
    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    /// Messages of `kind` sent plus received.
    pub fn message_count(&self, kind: MessageKind) -> u64 {
        let stats = self.endpoint.counters().stats(kind);
        stats.sent + stats.received
    }

    /// Per-kind traffic counters.
    pub fn counters(&self) -> &TrafficCounters {
        self.endpoint.counters()
    }

    /// Running totals.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn scene_blocked(&self) -> bool {
        self.host
            .current_scene()
            .is_some_and(|scene| self.config.blocked_scenes.iter().any(|b| *b == scene.path))
    }

    /// Start replicating a controller. Returns `None` when replication is
    /// suppressed for the current scene or the controller cannot be
    /// captured.
    pub fn register_actor(&mut self, handle: ControllerHandle) -> Option<ActorId> {
        if self.scene_blocked() {
            tracing::debug!(?handle, "replication suppressed in this scene");
            self.stats.refused += 1;
            return None;
        }
        let Some(capture) = self.host.capture(handle) else {
            tracing::warn!(?handle, "controller could not be captured, not registering");
            self.stats.refused += 1;
            return None;
        };

        let id = ActorId(self.next_id);
        self.next_id += 1;

        let mut entry = ActorEntry::new(id, capture.scene.clone(), self.cell_size);
        entry.set_activated(capture.enabled);
        entry.persistent = capture.persistent;
        entry.spawn_pose = capture.pose;
        entry.record_pose(capture.pose, self.clock);
        entry.set_health(capture.health);
        entry.equipment = capture.equipment;
        entry.weapons = capture.weapons;
        for buff in capture.buffs {
            entry.push_buff(buff);
        }
        entry.model_name = match capture.model_name {
            Some(name) if !name.is_empty() => name,
            _ => {
                tracing::warn!(%id, fallback = %self.config.default_model, "model unresolved, using default");
                self.config.default_model.clone()
            }
        };
        entry.preset_name = capture.preset_name.unwrap_or_default();

        let spawn = Message::Spawn(Spawn {
            state: entry.to_state(),
        });
        self.actors.insert(
            id,
            ServerActor {
                entry,
                handle,
                last_idle_record: self.clock,
            },
        );
        self.stats.registered += 1;
        tracing::debug!(%id, ?handle, "actor registered");
        self.broadcast_all(&spawn);
        Some(id)
    }

    /// Stop replicating an actor and tell every peer it is gone. Returns
    /// `false` if it was unknown or already gone.
    pub fn deregister_actor(&mut self, id: ActorId) -> bool {
        let Some(actor) = self.actors.get_mut(&id) else {
            return false;
        };
        if !actor.entry.mark_despawned() {
            return false;
        }
        self.throttle.cancel(id);
        self.watchers.on_actor_deactivated(id);
        tracing::debug!(%id, "actor deregistered");
        self.broadcast_all(&Message::Despawn(Despawn {
            actor_id: id,
            reason: DespawnReason::Removed,
        }));
        true
    }

    // -----------------------------------------------------------------------
    // Health, death, buffs
    // -----------------------------------------------------------------------

    /// Authoritative health changed. Broadcasts, throttled unless `force`.
    pub fn on_health_changed(&mut self, id: ActorId, health: Health, force: bool) {
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        if !actor.entry.set_health(health) {
            return;
        }
        let clamped = actor.entry.health();
        if let Some(health) = self.throttle.request(id, clamped, self.clock, force) {
            self.broadcast_health(id, health, false);
        }
    }

    /// The actor died. Idempotent: a second call does nothing.
    pub fn on_death(&mut self, id: ActorId) -> bool {
        let Some(actor) = self.actors.get_mut(&id) else {
            return false;
        };
        if !actor.entry.mark_dead() {
            return false;
        }
        let health = actor.entry.health();
        self.stats.deaths += 1;
        self.throttle.cancel(id);
        self.watchers.on_actor_deactivated(id);
        tracing::debug!(%id, "actor died");

        self.broadcast_health(id, health, true);
        self.broadcast_all(&Message::Despawn(Despawn {
            actor_id: id,
            reason: DespawnReason::Death,
        }));
        true
    }

    /// A client reports a local hit on an actor.
    ///
    /// The damage goes through the host's damage pipeline so side effects
    /// fire once, on the server. If it cannot be applied, the reported
    /// health is taken as-is and a depleted or dead report forces the
    /// death, so no client keeps an actor alive that the server lost.
    pub fn on_client_health_report(&mut self, peer: PeerId, report: &HealthReport) -> Result<(), ReplicationError> {
        let id = report.actor_id;
        if !report.is_well_formed() {
            return Err(ReplicationError::Malformed {
                actor: id,
                field: "health report",
            });
        }
        let actor = self.actors.get(&id).ok_or(ReplicationError::UnknownActor(id))?;
        if actor.entry.is_dead() {
            tracing::trace!(%id, %peer, "health report for dead actor ignored");
            return Ok(());
        }
        let handle = actor.handle;

        let (health, kill) = match self.host.apply_damage(handle, &report.damage) {
            DamageOutcome::Applied { health } => {
                let health = health.clamped();
                (health, health.is_depleted())
            }
            DamageOutcome::NotApplicable => {
                let reported = report.health.clamped();
                let kill = reported.is_depleted() || report.is_dead;
                if kill {
                    tracing::warn!(%id, %peer, "damage not applicable, forcing death");
                    self.host.force_kill(handle);
                    self.stats.forced_deaths += 1;
                }
                (reported, kill)
            }
        };

        if let Some(actor) = self.actors.get_mut(&id) {
            actor.entry.set_health(health);
        }
        if kill {
            self.on_death(id);
        } else {
            self.on_health_changed(id, health, true);
        }
        Ok(())
    }

    /// The host applied a buff to an actor.
    pub fn on_buff_applied(&mut self, id: ActorId, buff: BuffRecord) {
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        if actor.entry.push_buff(buff) {
            self.broadcast_all(&Message::BuffBroadcast(BuffBroadcast { actor_id: id, buff }));
        }
    }

    /// A client applied a buff locally.
    pub fn on_buff_report(&mut self, peer: PeerId, id: ActorId, buff: BuffRecord) -> Result<(), ReplicationError> {
        let actor = self.actors.get(&id).ok_or(ReplicationError::UnknownActor(id))?;
        if actor.entry.is_dead() {
            return Ok(());
        }
        if let Err(err) = self.host.apply_buff(actor.handle, buff) {
            tracing::warn!(%id, %peer, buff_id = buff.buff_id, %err, "buff could not be applied");
            return Ok(());
        }
        self.on_buff_applied(id, buff);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Interest and snapshots
    // -----------------------------------------------------------------------

    /// A peer asks to watch an actor.
    pub fn on_activation_request(&mut self, peer: PeerId, id: ActorId) -> Result<WatchOutcome, ReplicationError> {
        let actor = self.actors.get(&id).ok_or(ReplicationError::UnknownActor(id))?;
        let outcome = self.watchers.watch(&actor.entry, peer, self.clock);
        match outcome {
            WatchOutcome::Added => tracing::debug!(%id, %peer, "watcher added"),
            WatchOutcome::ActorInactive => tracing::debug!(%id, %peer, "activation refused, actor inactive"),
            WatchOutcome::AlreadyWatching => {}
        }
        Ok(outcome)
    }

    /// A peer asks for a full-state transfer. The stream starts with a
    /// reset. An empty scene path means every scene.
    pub fn on_snapshot_request(&mut self, peer: PeerId, request: &SnapshotRequest) {
        let entries = self.live_states(Some(&request.scene));
        let chunks = self.writer.write(entries, true);
        tracing::debug!(%peer, chunks = chunks.len(), "serving snapshot");
        for chunk in chunks {
            self.endpoint
                .send_to(&mut self.host, peer, &Message::SnapshotChunk(chunk));
        }
        self.stats.snapshots_served += 1;
    }

    /// A peer disconnected.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        let removed = self.watchers.on_peer_disconnected(peer);
        tracing::debug!(%peer, removed, "peer disconnected");
    }

    fn live_states(&self, scene: Option<&SceneRef>) -> Vec<ActorState> {
        self.actors
            .values()
            .filter(|a| !a.entry.is_gone())
            .filter(|a| scene.is_none_or(|s| s.path.is_empty() || a.entry.scene.path == s.path))
            .map(|a| a.entry.to_state())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Decode and dispatch one payload from `peer`. Malformed payloads and
    /// server-bound-only kinds are dropped and counted as rejected.
    pub fn handle_packet(&mut self, peer: PeerId, payload: &[u8]) {
        let msg = match self.endpoint.receive(payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(%peer, %err, "dropping undecodable payload");
                return;
            }
        };
        let kind = msg.kind();
        let result = match msg {
            Message::HealthReport(report) => self.on_client_health_report(peer, &report),
            Message::BuffReport(report) => self.on_buff_report(peer, report.actor_id, report.buff),
            Message::ActivationRequest(req) => self.on_activation_request(peer, req.actor_id).map(|_| ()),
            Message::SnapshotRequest(req) => {
                self.on_snapshot_request(peer, &req);
                Ok(())
            }
            other => {
                tracing::warn!(%peer, kind = ?other.kind(), "client sent a server-only message");
                self.endpoint.reject(kind);
                return;
            }
        };
        if let Err(err) = result {
            tracing::warn!(%peer, ?kind, %err, "dropping client message");
            self.endpoint.reject(kind);
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the session clock by `dt` seconds and run one replication
    /// pass.
    pub fn tick(&mut self, dt: f64) {
        self.clock += dt.max(0.0);
        self.stats.ticks += 1;

        let connected = self.host.connected_peers();
        self.watchers.retain_connected(&connected);

        let ids: Vec<ActorId> = self.actors.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.step_actor(id) {
                self.stats.actor_errors += 1;
                tracing::warn!(%id, %err, "actor update failed, skipping");
            }
        }

        for (id, health) in self.throttle.flush_due(self.clock) {
            self.broadcast_health(id, health, false);
        }

        if self.broadcast.due(self.clock) {
            let states = self.live_states(None);
            let chunks = self.writer.write(states, false);
            for chunk in chunks {
                self.endpoint
                    .broadcast(&mut self.host, &connected, &Message::SnapshotChunk(chunk));
            }
            tracing::debug!(peers = connected.len(), "periodic snapshot broadcast");
            self.broadcast.record(self.clock, connected.len());
        }
    }

    fn step_actor(&mut self, id: ActorId) -> Result<(), ReplicationError> {
        let Some(actor) = self.actors.get(&id) else {
            return Ok(());
        };
        if actor.entry.is_gone() {
            return Ok(());
        }
        let Some(sample) = self.host.sample(actor.handle) else {
            tracing::debug!(%id, "controller disappeared");
            self.deregister_actor(id);
            return Ok(());
        };
        if !sample.pose.is_finite() {
            return Err(ReplicationError::Malformed {
                actor: id,
                field: "pose",
            });
        }

        self.update_activation(id, sample.enabled);
        self.update_pose(id, &sample);
        Ok(())
    }

    fn update_activation(&mut self, id: ActorId, enabled: bool) {
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        if !actor.entry.set_activated(enabled) {
            return;
        }
        if !enabled {
            self.watchers.on_actor_deactivated(id);
        }
        tracing::debug!(%id, enabled, "activation changed");
        self.broadcast_all(&Message::ActivationState(ActivationState {
            actor_id: id,
            activated: enabled,
        }));
    }

    fn update_pose(&mut self, id: ActorId, sample: &ControllerSample) {
        let now = self.clock;
        let distances = self
            .watchers
            .watcher_distances(id, sample.pose.position, &self.host);

        let in_range = distances
            .iter()
            .any(|&(_, d)| d <= self.policy.mid_band);
        let due: Vec<PeerId> = distances
            .iter()
            .filter(|&&(peer, d)| {
                self.watchers
                    .record(id, peer)
                    .is_some_and(|record| self.policy.update_due(record, &sample.pose, d, now))
            })
            .map(|&(peer, _)| peer)
            .collect();

        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };

        if !in_range {
            if self.policy.idle_record_due(actor.last_idle_record, now) {
                actor.entry.record_pose(sample.pose, now);
                actor.last_idle_record = now;
                self.stats.idle_records += 1;
                tracing::trace!(%id, "idle pose record");
            }
            return;
        }
        if due.is_empty() {
            return;
        }

        actor.entry.record_pose(sample.pose, now);
        let msg = Message::StateUpdate(StateUpdate {
            actor_id: id,
            remote_time: now,
            pose: sample.pose,
            health: actor.entry.health(),
            anim: sample.anim,
        });
        for peer in due {
            if self.endpoint.send_to(&mut self.host, peer, &msg) {
                self.stats.pose_updates += 1;
            }
            self.watchers.mark_sent(id, peer, sample.pose, now);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    fn broadcast_all(&mut self, msg: &Message) {
        let peers = self.host.connected_peers();
        self.endpoint.broadcast(&mut self.host, &peers, msg);
    }

    fn broadcast_health(&mut self, id: ActorId, health: Health, is_dead: bool) {
        self.broadcast_all(&Message::HealthBroadcast(HealthBroadcast {
            actor_id: id,
            health: health.clamped(),
            is_dead,
        }));
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
