//! Client-role replication manager.
//!
//! Mirrors the server's actor table, owns one interpolated proxy per nearby
//! actor, and keeps the mirror honest with periodic snapshot refreshes.
//!
//! Proxy creation is asynchronous: the host is handed a [`ProxyRequest`]
//! carrying a [`SpawnTicket`] and answers later through
//! [`ClientReplication::on_proxy_ready`] or
//! [`ClientReplication::on_proxy_failed`]. Updates that arrive while a spawn
//! is in flight are parked per actor and replayed once the proxy exists.
//! Any teardown retires the outstanding ticket, so a late result is
//! recognized and its proxy destroyed.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use glam::Vec3;
use nebula_config::{ClientConfig, Config};
use nebula_net::{
    ActivationRequest, ActorId, ActorState, BuffRecord, BuffReport, CodecConfig,
    DamageInfo, DeliveryPolicy, DespawnReason, Endpoint, Health, HealthReport, Message,
    MessageKind, RetryPolicy, RetryState, SceneRef, SnapshotChunk, SnapshotRequest, StateUpdate,
    TrafficCounters,
};

use crate::actor::ActorEntry;
use crate::collab::{ClientHost, ProxyHandle, ProxyRequest, SpawnTicket};
use crate::error::ReplicationError;
use crate::interpolation::{InterpolationSettings, NetworkInterpolator, PoseFeed};
use crate::snapshot::{RefreshSchedule, SnapshotReceiver};

/// Running totals for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Ticks processed.
    pub ticks: u64,
    /// Proxy spawns requested (fallback retries included).
    pub proxy_requests: u64,
    /// Proxies that became live.
    pub proxies_spawned: u64,
    /// Live proxies destroyed.
    pub proxies_destroyed: u64,
    /// Spawn results that arrived for a retired ticket.
    pub stale_tickets: u64,
    /// Spawns abandoned after the fallback model failed too.
    pub spawn_failures: u64,
    /// Snapshot resets applied.
    pub resets: u64,
    /// Snapshot entries applied.
    pub snapshot_entries: u64,
    /// Snapshot requests sent.
    pub refresh_requests: u64,
    /// Activation requests sent.
    pub activation_requests: u64,
    /// Updates dropped because the owning scene is not loaded.
    pub dropped_unloaded: u64,
    /// Health reports swallowed as echoes of a server value.
    pub echoes_suppressed: u64,
}

/// An update parked while a proxy spawn is in flight.
#[derive(Debug, Clone)]
enum PendingUpdate {
    State(StateUpdate),
    Health(Health),
    Buff(BuffRecord),
}

#[derive(Debug)]
struct ReplicaProxy {
    handle: ProxyHandle,
    interpolator: NetworkInterpolator,
    /// Last authority-confirmed health applied to the proxy.
    suppress_health_echo: Option<Health>,
}

#[derive(Debug)]
enum ProxySlot {
    None,
    Pending { ticket: SpawnTicket, fallback_used: bool },
    Live(ReplicaProxy),
}

#[derive(Debug)]
struct ClientActor {
    entry: ActorEntry,
    proxy: ProxySlot,
    pending: VecDeque<PendingUpdate>,
    activation: RetryState,
    /// After the retries run out, requests pause until this time.
    activation_resume_at: f64,
    watched: bool,
    /// Both the actor's model and the fallback failed; no new request until
    /// the next teardown.
    spawn_failed: bool,
    last_state_time: f64,
}

impl ClientActor {
    fn new(entry: ActorEntry, retry: &RetryPolicy) -> Self {
        let last_state_time = entry.pose_time();
        Self {
            entry,
            proxy: ProxySlot::None,
            pending: VecDeque::new(),
            activation: RetryState::new(retry.clone()),
            activation_resume_at: f64::NEG_INFINITY,
            watched: false,
            spawn_failed: false,
            last_state_time,
        }
    }
}

/// Observing-side replication manager.
#[derive(Debug)]
pub struct ClientReplication<H: ClientHost> {
    host: H,
    config: ClientConfig,
    interpolation: InterpolationSettings,
    retry: RetryPolicy,
    endpoint: Endpoint,
    actors: BTreeMap<ActorId, ClientActor>,
    receiver: SnapshotReceiver,
    refresh: RefreshSchedule,
    scene: Option<SceneRef>,
    needs_refresh: bool,
    next_epoch: u32,
    clock: f64,
    stats: ClientStats,
}

impl<H: ClientHost> ClientReplication<H> {
    /// Manager using the default delivery policy.
    pub fn new(config: &Config, host: H) -> Self {
        Self::with_policy(config, DeliveryPolicy::default(), host)
    }

    /// Manager with an explicit delivery policy.
    pub fn with_policy(config: &Config, delivery: DeliveryPolicy, host: H) -> Self {
        let retry = RetryPolicy::from(&config.client.activation_retry);
        Self {
            host,
            config: config.client.clone(),
            interpolation: InterpolationSettings::from(&config.interpolation),
            endpoint: Endpoint::new(CodecConfig::from(&config.network), delivery),
            actors: BTreeMap::new(),
            receiver: SnapshotReceiver::new(
                config.snapshot.pending_capacity,
                config.snapshot.drain_per_frame,
                Duration::from_millis(config.snapshot.drain_time_budget_ms),
            ),
            refresh: RefreshSchedule::new(config.snapshot.client_refresh_interval, retry.clone()),
            retry,
            scene: None,
            needs_refresh: false,
            next_epoch: 0,
            clock: 0.0,
            stats: ClientStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The host, mutably.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Local session time in seconds.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Mirror entry for an actor.
    pub fn try_get_actor(&self, id: ActorId) -> Option<&ActorEntry> {
        self.actors.get(&id).map(|a| &a.entry)
    }

    /// Every mirrored actor.
    pub fn actors(&self) -> impl Iterator<Item = &ActorEntry> {
        self.actors.values().map(|a| &a.entry)
    }

    /// The live proxy for an actor.
    pub fn proxy_for(&self, id: ActorId) -> Option<ProxyHandle> {
        match &self.actors.get(&id)?.proxy {
            ProxySlot::Live(proxy) => Some(proxy.handle),
            _ => None,
        }
    }

    /// The outstanding spawn ticket for an actor.
    pub fn pending_ticket(&self, id: ActorId) -> Option<SpawnTicket> {
        match &self.actors.get(&id)?.proxy {
            ProxySlot::Pending { ticket, .. } => Some(*ticket),
            _ => None,
        }
    }

    /// Updates parked for an actor whose proxy is still spawning.
    pub fn pending_updates(&self, id: ActorId) -> usize {
        self.actors.get(&id).map_or(0, |a| a.pending.len())
    }

    /// The interpolator driving an actor's proxy.
    pub fn interpolator(&self, id: ActorId) -> Option<&NetworkInterpolator> {
        match &self.actors.get(&id)?.proxy {
            ProxySlot::Live(proxy) => Some(&proxy.interpolator),
            _ => None,
        }
    }

    /// A thread-safe feed into an actor's interpolator, for hosts that
    /// receive poses on a network thread.
    pub fn pose_feed(&self, id: ActorId) -> Option<PoseFeed> {
        self.interpolator(id).map(NetworkInterpolator::feed)
    }

    /// Snapshot entries waiting to be applied.
    pub fn snapshot_backlog(&self) -> usize {
        self.receiver.pending()
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
    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    /// Decode and dispatch one payload from the server.
    pub fn handle_packet(&mut self, payload: &[u8]) {
        let msg = match self.endpoint.receive(payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(%err, "dropping undecodable payload");
                return;
            }
        };
        let kind = msg.kind();
        let result = match msg {
            Message::Spawn(spawn) => self.on_spawn(&spawn.state),
            Message::Despawn(despawn) => {
                self.on_despawn(despawn.actor_id, despawn.reason);
                Ok(())
            }
            Message::ActivationState(state) => self.on_activation_state(state.actor_id, state.activated),
            Message::StateUpdate(update) => self.on_state(update),
            Message::HealthBroadcast(b) => self.on_health_broadcast(b.actor_id, b.health, b.is_dead),
            Message::BuffBroadcast(b) => self.on_buff_broadcast(b.actor_id, b.buff),
            Message::SnapshotChunk(chunk) => {
                self.on_snapshot_chunk(chunk);
                Ok(())
            }
            other => {
                tracing::warn!(kind = ?other.kind(), "server sent a client-only message");
                self.endpoint.reject(kind);
                return;
            }
        };
        if let Err(err) = result {
            tracing::debug!(?kind, %err, "dropping server message");
            self.endpoint.reject(kind);
        }
    }

    /// A new actor exists on the server.
    pub fn on_spawn(&mut self, state: &ActorState) -> Result<(), ReplicationError> {
        if !state.is_well_formed() {
            return Err(ReplicationError::Malformed {
                actor: state.actor_id,
                field: "spawn state",
            });
        }
        if !self.host.is_scene_loaded(&state.scene) {
            self.stats.dropped_unloaded += 1;
            return Ok(());
        }
        self.apply_state(state);
        Ok(())
    }

    /// An actor is gone. Applying it twice is the same as once.
    pub fn on_despawn(&mut self, id: ActorId, reason: DespawnReason) {
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        let changed = match reason {
            DespawnReason::Death => actor.entry.mark_dead(),
            DespawnReason::Removed => actor.entry.mark_despawned(),
        };
        if changed {
            tracing::debug!(%id, ?reason, "actor despawned");
        }
        self.teardown(id);
    }

    /// The server enabled or disabled an actor's controller.
    pub fn on_activation_state(&mut self, id: ActorId, activated: bool) -> Result<(), ReplicationError> {
        let actor = lookup(&mut self.actors, &mut self.needs_refresh, id)?;
        if !actor.entry.set_activated(activated) {
            return Ok(());
        }
        if activated {
            // The server dropped our watch when it deactivated; ask again.
            actor.watched = false;
            actor.activation.reset();
            actor.activation_resume_at = f64::NEG_INFINITY;
        } else if !actor.entry.persistent {
            self.teardown(id);
        }
        Ok(())
    }

    /// A pose/health/animation sample.
    ///
    /// A sample older than the one already mirrored leaves the mirror alone
    /// but is still handed to the interpolator, which orders samples itself.
    pub fn on_state(&mut self, update: StateUpdate) -> Result<(), ReplicationError> {
        let id = update.actor_id;
        if !update.pose.is_finite() || !update.remote_time.is_finite() {
            return Err(ReplicationError::Malformed {
                actor: id,
                field: "pose",
            });
        }
        if !update.health.is_well_formed() {
            return Err(ReplicationError::Malformed {
                actor: id,
                field: "health",
            });
        }
        let clock = self.clock;
        let loaded = self.scene_loaded(id)?;
        if !loaded {
            self.stats.dropped_unloaded += 1;
            return Ok(());
        }
        let actor = lookup(&mut self.actors, &mut self.needs_refresh, id)?;
        if actor.entry.is_gone() {
            return Ok(());
        }

        let fresh = update.remote_time >= actor.last_state_time;
        if fresh {
            actor.entry.record_pose(update.pose, update.remote_time);
            actor.entry.set_health(update.health);
            actor.last_state_time = update.remote_time;
        }

        match &mut actor.proxy {
            ProxySlot::Live(proxy) => {
                proxy.interpolator.push(
                    update.remote_time,
                    clock,
                    update.pose.position,
                    update.pose.rotation,
                );
                if fresh {
                    self.host.apply_animation(proxy.handle, &update.anim);
                }
            }
            ProxySlot::Pending { .. } => {
                park(&mut actor.pending, PendingUpdate::State(update), self.config.pending_updates_per_actor);
            }
            ProxySlot::None => {}
        }
        Ok(())
    }

    /// Authoritative health.
    pub fn on_health_broadcast(&mut self, id: ActorId, health: Health, is_dead: bool) -> Result<(), ReplicationError> {
        let loaded = self.scene_loaded(id)?;
        if !loaded {
            self.stats.dropped_unloaded += 1;
            return Ok(());
        }
        let actor = lookup(&mut self.actors, &mut self.needs_refresh, id)?;
        if !actor.entry.set_health(health) {
            return Ok(());
        }
        if is_dead {
            actor.entry.mark_dead();
        }
        let health = actor.entry.health();

        match &mut actor.proxy {
            ProxySlot::Live(proxy) => {
                proxy.suppress_health_echo = Some(health);
                self.host.apply_health(proxy.handle, health);
            }
            ProxySlot::Pending { .. } => {
                park(&mut actor.pending, PendingUpdate::Health(health), self.config.pending_updates_per_actor);
            }
            ProxySlot::None => {}
        }
        Ok(())
    }

    /// A buff was applied on the server.
    pub fn on_buff_broadcast(&mut self, id: ActorId, buff: BuffRecord) -> Result<(), ReplicationError> {
        let loaded = self.scene_loaded(id)?;
        if !loaded {
            self.stats.dropped_unloaded += 1;
            return Ok(());
        }
        let actor = lookup(&mut self.actors, &mut self.needs_refresh, id)?;
        if !actor.entry.push_buff(buff) {
            return Ok(());
        }
        match &mut actor.proxy {
            ProxySlot::Live(proxy) => {
                if let Err(err) = self.host.apply_buff(proxy.handle, buff) {
                    tracing::warn!(%id, buff_id = buff.buff_id, %err, "buff could not be applied to proxy");
                }
            }
            ProxySlot::Pending { .. } => {
                park(&mut actor.pending, PendingUpdate::Buff(buff), self.config.pending_updates_per_actor);
            }
            ProxySlot::None => {}
        }
        Ok(())
    }

    /// One chunk of a snapshot stream. Entries are applied a few per tick.
    pub fn on_snapshot_chunk(&mut self, chunk: SnapshotChunk) {
        let queued = self.receiver.receive(chunk);
        tracing::trace!(queued, backlog = self.receiver.pending(), "snapshot chunk queued");
    }

    fn scene_loaded(&mut self, id: ActorId) -> Result<bool, ReplicationError> {
        let actor = lookup(&mut self.actors, &mut self.needs_refresh, id)?;
        Ok(self.host.is_scene_loaded(&actor.entry.scene))
    }

    /// Full-field overwrite (or creation) of a mirror entry.
    fn apply_state(&mut self, state: &ActorState) {
        let id = state.actor_id;
        match self.actors.get_mut(&id) {
            Some(actor) => {
                if !actor.entry.overwrite(state) {
                    return;
                }
                actor.last_state_time = actor.last_state_time.max(state.pose_time);
                if actor.entry.is_gone() || (!actor.entry.activated && !actor.entry.persistent) {
                    self.teardown(id);
                }
            }
            None => {
                let entry = ActorEntry::from_state(state, self.config.position_cell_size);
                tracing::debug!(%id, model = %entry.model_name, "actor mirrored");
                self.actors.insert(id, ClientActor::new(entry, &self.retry));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Proxy lifecycle
    // -----------------------------------------------------------------------

    /// The host finished creating a proxy. A ticket that was retired in
    /// the meantime gets its proxy destroyed and an error back.
    pub fn on_proxy_ready(&mut self, ticket: SpawnTicket, handle: ProxyHandle) -> Result<(), ReplicationError> {
        let clock = self.clock;
        let current = self
            .actors
            .get_mut(&ticket.actor)
            .filter(|a| matches!(a.proxy, ProxySlot::Pending { ticket: t, .. } if t == ticket));
        let Some(actor) = current else {
            tracing::debug!(actor = %ticket.actor, epoch = ticket.epoch, "stale proxy, destroying");
            self.host.destroy_proxy(handle);
            self.stats.stale_tickets += 1;
            return Err(ReplicationError::StaleTicket {
                actor: ticket.actor,
                epoch: ticket.epoch,
            });
        };

        let interpolator = NetworkInterpolator::new(self.interpolation.clone());
        let pose = *actor.entry.pose();
        interpolator.push(actor.entry.pose_time(), clock, pose.position, pose.rotation);
        self.host.apply_health(handle, actor.entry.health());

        let mut proxy = ReplicaProxy {
            handle,
            interpolator,
            suppress_health_echo: Some(actor.entry.health()),
        };
        for update in actor.pending.drain(..) {
            match update {
                PendingUpdate::State(update) => {
                    proxy.interpolator.push(
                        update.remote_time,
                        clock,
                        update.pose.position,
                        update.pose.rotation,
                    );
                    self.host.apply_animation(handle, &update.anim);
                }
                PendingUpdate::Health(health) => {
                    proxy.suppress_health_echo = Some(health);
                    self.host.apply_health(handle, health);
                }
                PendingUpdate::Buff(buff) => {
                    if let Err(err) = self.host.apply_buff(handle, buff) {
                        tracing::warn!(actor = %ticket.actor, buff_id = buff.buff_id, %err, "replayed buff failed");
                    }
                }
            }
        }
        actor.proxy = ProxySlot::Live(proxy);
        self.stats.proxies_spawned += 1;
        tracing::debug!(actor = %ticket.actor, ?handle, "proxy live");
        Ok(())
    }

    /// The host could not create a proxy. The first failure is retried with
    /// the fallback model; a second one abandons the spawn until the actor
    /// next leaves range.
    pub fn on_proxy_failed(&mut self, ticket: SpawnTicket) {
        let Some(actor) = self.actors.get_mut(&ticket.actor) else {
            return;
        };
        let ProxySlot::Pending {
            ticket: current,
            fallback_used,
        } = actor.proxy
        else {
            return;
        };
        if current != ticket {
            return;
        }
        if fallback_used {
            tracing::warn!(actor = %ticket.actor, "fallback proxy failed too, giving up");
            actor.proxy = ProxySlot::None;
            actor.pending.clear();
            actor.spawn_failed = true;
            self.stats.spawn_failures += 1;
            return;
        }
        tracing::warn!(
            actor = %ticket.actor,
            model = %actor.entry.model_name,
            fallback = %self.config.fallback_model,
            "proxy spawn failed, retrying with fallback model"
        );
        self.request_proxy(ticket.actor, true);
    }

    fn request_proxy(&mut self, id: ActorId, fallback: bool) {
        let epoch = self.next_epoch;
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        self.next_epoch = self.next_epoch.wrapping_add(1);
        let ticket = SpawnTicket { actor: id, epoch };
        let use_fallback = fallback || actor.entry.model_name.is_empty();
        let model_name = if use_fallback {
            self.config.fallback_model.clone()
        } else {
            actor.entry.model_name.clone()
        };
        actor.proxy = ProxySlot::Pending {
            ticket,
            fallback_used: use_fallback,
        };
        self.stats.proxy_requests += 1;
        self.host.request_proxy(ProxyRequest {
            ticket,
            model_name,
            fallback: use_fallback,
            state: actor.entry.to_state(),
        });
    }

    /// Destroy an actor's proxy (if any) and retire any spawn in flight.
    fn teardown(&mut self, id: ActorId) {
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        match std::mem::replace(&mut actor.proxy, ProxySlot::None) {
            ProxySlot::Live(proxy) => {
                self.host.destroy_proxy(proxy.handle);
                self.stats.proxies_destroyed += 1;
                tracing::debug!(%id, "proxy destroyed");
            }
            ProxySlot::Pending { ticket, .. } => {
                tracing::debug!(%id, epoch = ticket.epoch, "spawn retired");
            }
            ProxySlot::None => {}
        }
        actor.pending.clear();
        actor.watched = false;
        actor.spawn_failed = false;
        actor.activation.reset();
        actor.activation_resume_at = f64::NEG_INFINITY;
    }

    fn teardown_all(&mut self) {
        let ids: Vec<ActorId> = self.actors.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
    }

    // -----------------------------------------------------------------------
    // Local reports
    // -----------------------------------------------------------------------

    /// The local simulation changed an actor's health (a local hit). The
    /// change is reported to the server unless it is the echo of a value
    /// the server just sent. Returns whether a report went out.
    pub fn on_local_health_changed(&mut self, id: ActorId, health: Health, damage: DamageInfo) -> bool {
        let Some(actor) = self.actors.get_mut(&id) else {
            return false;
        };
        if actor.entry.is_dead() {
            return false;
        }
        let health = health.clamped();
        if let ProxySlot::Live(proxy) = &mut actor.proxy
            && proxy.suppress_health_echo == Some(health)
        {
            proxy.suppress_health_echo = None;
            self.stats.echoes_suppressed += 1;
            tracing::trace!(%id, "health echo suppressed");
            return false;
        }
        let report = Message::HealthReport(HealthReport {
            actor_id: id,
            health,
            damage,
            is_dead: health.is_depleted(),
        });
        self.endpoint.send_to_server(&mut self.host, &report)
    }

    /// The local simulation applied a buff to an actor.
    pub fn on_local_buff(&mut self, id: ActorId, buff: BuffRecord) -> bool {
        if self.actors.get(&id).is_none_or(|a| a.entry.is_dead()) {
            return false;
        }
        self.endpoint
            .send_to_server(&mut self.host, &Message::BuffReport(BuffReport { actor_id: id, buff }))
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the local clock by `dt` seconds and run one pass. `player`
    /// is the local player's position, if it has one.
    pub fn tick(&mut self, dt: f64, player: Option<Vec3>) {
        let dt = dt.max(0.0);
        self.clock += dt;
        self.stats.ticks += 1;

        self.track_scene();
        self.drain_snapshot();
        if let Some(player) = player {
            self.update_activation(player);
        }
        self.render(dt);
        self.update_refresh();
    }

    fn track_scene(&mut self) {
        let scene = self.host.current_scene();
        if scene != self.scene {
            tracing::info!(scene = ?scene.as_ref().map(|s| &s.path), "scene changed");
            if scene.is_some() {
                self.refresh.request_now();
            }
            self.scene = scene;
        }
    }

    fn drain_snapshot(&mut self) {
        if self.receiver.take_reset() {
            tracing::debug!(actors = self.actors.len(), "snapshot reset, tearing down mirror");
            self.teardown_all();
            self.actors.clear();
            self.stats.resets += 1;
        }
        let mut budget = self.receiver.begin_drain();
        while let Some(state) = self.receiver.next_entry(&mut budget) {
            if !self.host.is_scene_loaded(&state.scene) {
                self.stats.dropped_unloaded += 1;
                continue;
            }
            self.apply_state(&state);
            self.stats.snapshot_entries += 1;
        }
    }

    fn update_activation(&mut self, player: Vec3) {
        let inner = self.config.activation_inner_radius;
        let outer = self.config.activation_outer_radius.max(inner);

        let mut spawn = Vec::new();
        let mut release = Vec::new();
        let mut request = Vec::new();
        for (&id, actor) in &self.actors {
            if actor.entry.is_gone() || !actor.entry.activated {
                continue;
            }
            if !self.host.is_scene_loaded(&actor.entry.scene) {
                continue;
            }
            let distance = actor.entry.pose().position.distance(player);
            if distance <= inner {
                if matches!(actor.proxy, ProxySlot::None) && !actor.spawn_failed {
                    spawn.push(id);
                }
                if !actor.watched
                    && self.clock >= actor.activation_resume_at
                    && actor.activation.ready(self.clock)
                {
                    request.push(id);
                }
            } else if distance > outer && !actor.entry.persistent {
                let holds_something = !matches!(actor.proxy, ProxySlot::None) || actor.watched || actor.spawn_failed;
                if holds_something {
                    release.push(id);
                }
            }
        }

        for id in release {
            tracing::debug!(%id, "actor out of range");
            self.teardown(id);
        }
        for id in spawn {
            self.request_proxy(id, false);
        }
        for id in request {
            self.send_activation_request(id);
        }
    }

    fn send_activation_request(&mut self, id: ActorId) {
        let msg = Message::ActivationRequest(ActivationRequest { actor_id: id });
        let sent = self.host.is_connected() && self.endpoint.send_to_server(&mut self.host, &msg);
        let Some(actor) = self.actors.get_mut(&id) else {
            return;
        };
        if sent {
            actor.watched = true;
            actor.activation.reset();
            self.stats.activation_requests += 1;
            tracing::trace!(%id, "activation requested");
        } else if actor.activation.record_attempt(self.clock).is_none() {
            let pause = self.retry.max_delay;
            tracing::warn!(
                %id,
                attempts = actor.activation.attempts(),
                pause,
                "activation request retries exhausted, starting over after a pause"
            );
            actor.activation.reset();
            actor.activation_resume_at = self.clock + pause;
        }
    }

    fn render(&mut self, dt: f64) {
        for actor in self.actors.values() {
            if let ProxySlot::Live(proxy) = &actor.proxy
                && let Some(pose) = proxy.interpolator.advance(dt)
            {
                self.host.apply_pose(proxy.handle, &pose);
            }
        }
    }

    fn update_refresh(&mut self) {
        if std::mem::take(&mut self.needs_refresh) {
            tracing::debug!("unknown actor seen, requesting refresh");
            self.refresh.request_now();
        }
        if !self.refresh.due(self.clock) {
            return;
        }
        let msg = Message::SnapshotRequest(SnapshotRequest {
            scene: self.scene.clone().unwrap_or_default(),
        });
        if self.host.is_connected() && self.endpoint.send_to_server(&mut self.host, &msg) {
            self.refresh.record_sent(self.clock);
            self.stats.refresh_requests += 1;
        } else {
            self.refresh.record_failed(self.clock);
        }
    }
}

/// Mirror entry for `id`. An unknown actor means the mirror missed a
/// spawn, so a refresh is scheduled.
fn lookup<'a>(
    actors: &'a mut BTreeMap<ActorId, ClientActor>,
    needs_refresh: &mut bool,
    id: ActorId,
) -> Result<&'a mut ClientActor, ReplicationError> {
    match actors.get_mut(&id) {
        Some(actor) => Ok(actor),
        None => {
            *needs_refresh = true;
            Err(ReplicationError::UnknownActor(id))
        }
    }
}

fn park(queue: &mut VecDeque<PendingUpdate>, update: PendingUpdate, capacity: usize) {
    if queue.len() >= capacity.max(1) {
        queue.pop_front();
    }
    queue.push_back(update);
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
