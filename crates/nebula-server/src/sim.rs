//! In-process loopback session: one replication server, N observing clients,
//! all talking over simulated lossy links.
//!
//! Nothing here runs in real time. The session advances a fixed step as
//! fast as it can, so a minute of play finishes in well under a second.

use std::collections::BTreeMap;

use crossbeam_channel::Sender;
use glam::{Quat, Vec3};
use nebula_config::Config;
use nebula_net::{
    ActorId, AnimSample, BuffRecord, DamageInfo, Delivery, Health, NetSink, PeerId, Pose,
    SceneRef, SendError, ServerLink,
};
use nebula_replication::{
    ActorCapture, ActorRegistry, ClientReplication, ClientStats, ControllerHandle,
    ControllerSample, DamageOutcome, PeerDirectory, PeerTable, ProxyHandle, ProxyHost,
    ProxyRequest, RenderPose, ReplicationError, ReplicationServer, SceneDirectory, ServerStats,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::link::{self, Datagram, LinkProfile, LinkReceiver, LinkSender, LinkStats};

/// Models the simulated clients know how to build. Anything else fails and
/// exercises the fallback path.
const KNOWN_MODELS: [&str; 3] = ["scav", "raider", "player"];

/// Models handed out to wanderers.
const WANDERER_MODELS: [&str; 3] = ["scav", "raider", "brute"];

/// Seconds a corpse stays in the registry before it is cleared.
const CORPSE_TIME: f64 = 5.0;

/// Damage dealt by one simulated local hit.
const HIT_DAMAGE: f32 = 15.0;

/// Knobs for one session.
#[derive(Debug, Clone)]
pub struct SimSettings {
    /// Wandering actors kept alive on the server.
    pub actors: usize,
    /// Observing clients.
    pub clients: usize,
    /// Simulated seconds to run.
    pub duration: f64,
    /// Fixed steps per simulated second.
    pub tick_rate: f64,
    /// Profile of every link direction.
    pub link: LinkProfile,
    /// Radius of the play area in meters.
    pub arena_radius: f32,
    /// Local hits per client per second.
    pub hit_rate: f64,
    /// Whether one client drops and rejoins mid-session.
    pub reconnect: bool,
    /// RNG seed; equal seeds replay equal sessions.
    pub seed: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            actors: 24,
            clients: 4,
            duration: 60.0,
            tick_rate: 60.0,
            link: LinkProfile::default(),
            arena_radius: 120.0,
            hit_rate: 0.5,
            reconnect: true,
            seed: 7,
        }
    }
}

/// End-of-session summary.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Server manager totals.
    pub server: ServerStats,
    /// Per-client manager totals.
    pub clients: Vec<ClientStats>,
    /// Proxies alive across all clients at the end.
    pub live_proxies: usize,
    /// Mean distance between a proxy and its actor's authoritative pose,
    /// over actors inside their observer's near band.
    pub mean_error: f32,
    /// Largest such distance.
    pub max_error: f32,
    /// Server to client link totals.
    pub downlink: LinkStats,
    /// Client to server link totals.
    pub uplink: LinkStats,
    /// Pose updates dropped at clients for arriving after a newer one.
    pub superseded: u64,
}

// ---------------------------------------------------------------------------
// Server host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Wanderer {
    position: Vec3,
    heading: f32,
    speed: f32,
    health: Health,
    enabled: bool,
    model: &'static str,
    died_at: Option<f64>,
}

impl Wanderer {
    fn pose(&self) -> Pose {
        let rotation = Quat::from_rotation_y(self.heading);
        Pose {
            position: self.position,
            rotation,
            velocity: rotation * Vec3::NEG_Z * self.speed,
        }
    }
}

/// World the server owns: wandering controllers, connected peers, and the
/// downlinks to each peer.
#[derive(Debug)]
pub struct SimServerHost {
    now: f64,
    scene: SceneRef,
    peers: PeerTable,
    links: BTreeMap<PeerId, LinkSender>,
    wanderers: BTreeMap<ControllerHandle, Wanderer>,
    next_handle: u64,
    arena_radius: f32,
    rng: ChaCha8Rng,
    retired: LinkStats,
}

impl SimServerHost {
    fn new(scene: SceneRef, arena_radius: f32, seed: u64) -> Self {
        Self {
            now: 0.0,
            scene,
            peers: PeerTable::new(),
            links: BTreeMap::new(),
            wanderers: BTreeMap::new(),
            next_handle: 0,
            arena_radius,
            rng: ChaCha8Rng::seed_from_u64(seed),
            retired: LinkStats::default(),
        }
    }

    fn spawn_wanderer(&mut self) -> ControllerHandle {
        let handle = ControllerHandle(self.next_handle);
        self.next_handle += 1;
        let angle = self.rng.random_range(0.0..std::f32::consts::TAU);
        let distance = self.rng.random_range(0.0..self.arena_radius);
        let model = WANDERER_MODELS[self.rng.random_range(0..WANDERER_MODELS.len())];
        self.wanderers.insert(
            handle,
            Wanderer {
                position: Vec3::new(angle.cos() * distance, 0.0, angle.sin() * distance),
                heading: self.rng.random_range(0.0..std::f32::consts::TAU),
                speed: self.rng.random_range(0.5..3.5),
                health: Health::full(100.0),
                enabled: true,
                model,
                died_at: None,
            },
        );
        handle
    }

    /// Move every living wanderer and clear old corpses.
    fn step_world(&mut self, dt: f64) {
        let dt = dt as f32;
        let radius = self.arena_radius;
        let mut cleared = Vec::new();
        for (&handle, w) in &mut self.wanderers {
            if let Some(died_at) = w.died_at {
                if self.now - died_at >= CORPSE_TIME {
                    cleared.push(handle);
                }
                continue;
            }
            if self.rng.random_bool(0.0005) {
                w.enabled = !w.enabled;
            }
            if !w.enabled {
                continue;
            }
            w.heading += self.rng.random_range(-1.0..1.0) * dt;
            if w.position.length() > radius {
                // Steer back toward the middle.
                let home = -w.position;
                w.heading = (-home.x).atan2(-home.z);
            }
            w.position += Quat::from_rotation_y(w.heading) * Vec3::NEG_Z * w.speed * dt;
        }
        for handle in cleared {
            debug!(?handle, "corpse cleared");
            self.wanderers.remove(&handle);
        }
    }

    fn living(&self) -> usize {
        self.wanderers.values().filter(|w| w.died_at.is_none()).count()
    }

    fn kill(&mut self, handle: ControllerHandle) {
        if let Some(w) = self.wanderers.get_mut(&handle) {
            w.health.current = 0.0;
            w.enabled = false;
            w.died_at.get_or_insert(self.now);
        }
    }

    fn downlink_stats(&self) -> LinkStats {
        self.links.values().fold(self.retired, |acc, l| add(acc, l.stats()))
    }
}

impl ActorRegistry for SimServerHost {
    fn capture(&self, handle: ControllerHandle) -> Option<ActorCapture> {
        let w = self.wanderers.get(&handle)?;
        Some(ActorCapture {
            pose: w.pose(),
            health: w.health,
            model_name: Some(w.model.to_string()),
            preset_name: Some(format!("{}_default", w.model)),
            scene: self.scene.clone(),
            enabled: w.enabled,
            ..ActorCapture::default()
        })
    }

    fn sample(&self, handle: ControllerHandle) -> Option<ControllerSample> {
        let w = self.wanderers.get(&handle)?;
        Some(ControllerSample {
            enabled: w.enabled,
            pose: w.pose(),
            anim: AnimSample {
                move_speed: w.speed,
                ..AnimSample::default()
            },
        })
    }

    fn apply_damage(&mut self, handle: ControllerHandle, damage: &DamageInfo) -> DamageOutcome {
        match self.wanderers.get_mut(&handle) {
            Some(w) if w.enabled && w.died_at.is_none() => {
                w.health.current -= damage.amount;
                let health = w.health;
                if health.is_depleted() {
                    self.kill(handle);
                }
                DamageOutcome::Applied { health }
            }
            _ => DamageOutcome::NotApplicable,
        }
    }

    fn force_kill(&mut self, handle: ControllerHandle) {
        self.kill(handle);
    }

    fn apply_buff(&mut self, _handle: ControllerHandle, _buff: BuffRecord) -> Result<(), ReplicationError> {
        Ok(())
    }
}

impl PeerDirectory for SimServerHost {
    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_peers()
    }

    fn peer_position(&self, peer: PeerId) -> Option<Vec3> {
        self.peers.peer_position(peer)
    }
}

impl SceneDirectory for SimServerHost {
    fn current_scene(&self) -> Option<SceneRef> {
        Some(self.scene.clone())
    }

    fn is_scene_loaded(&self, scene: &SceneRef) -> bool {
        *scene == self.scene
    }
}

impl NetSink for SimServerHost {
    fn send(&mut self, peer: PeerId, delivery: Delivery, payload: &[u8]) -> Result<(), SendError> {
        if !self.peers.is_connected(peer) {
            return Err(SendError::NotConnected);
        }
        let link = self.links.get_mut(&peer).ok_or(SendError::NotConnected)?;
        link.send(self.now, delivery, payload)
    }
}

// ---------------------------------------------------------------------------
// Client host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SimProxy {
    actor: ActorId,
    position: Vec3,
    health: Health,
}

/// One observer's scene: the proxies it renders and its uplink.
#[derive(Debug)]
pub struct SimClientHost {
    now: f64,
    scene: SceneRef,
    link: Option<LinkSender>,
    requests: Vec<ProxyRequest>,
    proxies: BTreeMap<ProxyHandle, SimProxy>,
    next_proxy: u64,
}

impl SimClientHost {
    fn new(scene: SceneRef) -> Self {
        Self {
            now: 0.0,
            scene,
            link: None,
            requests: Vec::new(),
            proxies: BTreeMap::new(),
            next_proxy: 0,
        }
    }
}

impl ProxyHost for SimClientHost {
    fn request_proxy(&mut self, request: ProxyRequest) {
        self.requests.push(request);
    }

    fn apply_pose(&mut self, proxy: ProxyHandle, pose: &RenderPose) {
        if let Some(p) = self.proxies.get_mut(&proxy) {
            p.position = pose.position;
        }
    }

    fn apply_animation(&mut self, _proxy: ProxyHandle, _anim: &AnimSample) {}

    fn apply_health(&mut self, proxy: ProxyHandle, health: Health) {
        if let Some(p) = self.proxies.get_mut(&proxy) {
            p.health = health;
        }
    }

    fn apply_buff(&mut self, _proxy: ProxyHandle, _buff: BuffRecord) -> Result<(), ReplicationError> {
        Ok(())
    }

    fn destroy_proxy(&mut self, proxy: ProxyHandle) {
        self.proxies.remove(&proxy);
    }
}

impl ServerLink for SimClientHost {
    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn send_to_server(&mut self, delivery: Delivery, payload: &[u8]) -> Result<(), SendError> {
        let now = self.now;
        let link = self.link.as_mut().ok_or(SendError::NotConnected)?;
        link.send(now, delivery, payload)
    }
}

impl SceneDirectory for SimClientHost {
    fn current_scene(&self) -> Option<SceneRef> {
        Some(self.scene.clone())
    }

    fn is_scene_loaded(&self, scene: &SceneRef) -> bool {
        *scene == self.scene
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SimClient {
    replication: ClientReplication<SimClientHost>,
    inbox: LinkReceiver,
    inbox_tx: Sender<Datagram>,
    peer: Option<PeerId>,
    orbit_radius: f32,
    orbit_speed: f32,
    angle: f32,
    retired: LinkStats,
}

impl SimClient {
    fn player(&self) -> Vec3 {
        Vec3::new(self.angle.cos(), 0.0, self.angle.sin()) * self.orbit_radius
    }
}

/// A running loopback session.
#[derive(Debug)]
pub struct Session {
    settings: SimSettings,
    server: ReplicationServer<SimServerHost>,
    server_inbox: LinkReceiver,
    server_inbox_tx: Sender<Datagram>,
    clients: Vec<SimClient>,
    rng: ChaCha8Rng,
    now: f64,
    next_seed: u64,
    near_band: f32,
}

impl Session {
    /// Build the world, register its actors and connect every client.
    pub fn new(config: &Config, settings: SimSettings) -> Self {
        let scene = SceneRef {
            index: 1,
            path: "Forest".to_string(),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        let host = SimServerHost::new(scene.clone(), settings.arena_radius, rng.random());
        let server = ReplicationServer::new(config, host);
        let (server_inbox_tx, server_inbox) = link::channel();

        let clients = (0..settings.clients)
            .map(|_| {
                let (inbox_tx, inbox) = link::channel();
                SimClient {
                    replication: ClientReplication::new(config, SimClientHost::new(scene.clone())),
                    inbox,
                    inbox_tx,
                    peer: None,
                    orbit_radius: rng.random_range(10.0..settings.arena_radius.max(11.0)),
                    orbit_speed: rng.random_range(0.02..0.1),
                    angle: rng.random_range(0.0..std::f32::consts::TAU),
                    retired: LinkStats::default(),
                }
            })
            .collect();

        let mut session = Self {
            next_seed: rng.random(),
            settings,
            server,
            server_inbox,
            server_inbox_tx,
            clients,
            rng,
            now: 0.0,
            near_band: config.server.near_band,
        };
        for _ in 0..session.settings.actors {
            session.spawn_actor();
        }
        for index in 0..session.clients.len() {
            session.connect(index);
        }
        session
    }

    /// The server manager.
    pub fn server(&self) -> &ReplicationServer<SimServerHost> {
        &self.server
    }

    fn seed(&mut self) -> u64 {
        self.next_seed = self.next_seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.next_seed
    }

    fn spawn_actor(&mut self) {
        let handle = self.server.host_mut().spawn_wanderer();
        if self.server.register_actor(handle).is_none() {
            tracing::warn!(?handle, "wanderer refused by replication");
        }
    }

    fn connect(&mut self, index: usize) {
        let profile = self.settings.link;
        let (down_seed, up_seed) = (self.seed(), self.seed());
        let host = self.server.host_mut();
        let peer = host.peers.connect();
        let Some(client) = self.clients.get_mut(index) else {
            return;
        };
        host.links
            .insert(peer, LinkSender::new(peer, client.inbox_tx.clone(), profile, down_seed));
        client.replication.host_mut().link = Some(LinkSender::new(
            peer,
            self.server_inbox_tx.clone(),
            profile,
            up_seed,
        ));
        client.peer = Some(peer);
        info!(client = index, %peer, "client connected");
    }

    fn disconnect(&mut self, index: usize) {
        let Some(client) = self.clients.get_mut(index) else {
            return;
        };
        let Some(peer) = client.peer.take() else {
            return;
        };
        if let Some(link) = client.replication.host_mut().link.take() {
            client.retired = add(client.retired, link.stats());
        }
        let host = self.server.host_mut();
        host.peers.disconnect(peer);
        if let Some(link) = host.links.remove(&peer) {
            host.retired = add(host.retired, link.stats());
        }
        self.server.on_peer_disconnected(peer);
        info!(client = index, %peer, "client disconnected");
    }

    /// Advance the whole session by one fixed step.
    pub fn step(&mut self, dt: f64) {
        self.now += dt;
        let now = self.now;

        // World and players.
        let host = self.server.host_mut();
        host.now = now;
        host.step_world(dt);
        for client in &mut self.clients {
            client.angle += client.orbit_speed * dt as f32;
            if let Some(peer) = client.peer {
                host.peers.set_position(peer, client.player());
            }
        }
        while self.server.host().living() < self.settings.actors {
            self.spawn_actor();
        }

        // Server.
        for datagram in self.server_inbox.poll(now) {
            if self.server.host().peers.is_connected(datagram.peer) {
                self.server.handle_packet(datagram.peer, &datagram.payload);
            }
        }
        self.server.tick(dt);

        // Clients.
        for index in 0..self.clients.len() {
            self.step_client(index, dt);
        }

        if self.settings.reconnect && !self.clients.is_empty() {
            let half = self.settings.duration * 0.5;
            if crossed(now, dt, half * 0.8) {
                self.disconnect(0);
            } else if crossed(now, dt, half) {
                self.connect(0);
            }
        }
    }

    fn step_client(&mut self, index: usize, dt: f64) {
        let now = self.now;
        let hit_chance = (self.settings.hit_rate * dt).clamp(0.0, 1.0);
        let hit = self.rng.random_bool(hit_chance);
        let pick: f64 = self.rng.random();
        let Some(client) = self.clients.get_mut(index) else {
            return;
        };
        let player = client.player();
        let replication = &mut client.replication;
        replication.host_mut().now = now;

        for datagram in client.inbox.poll(now) {
            if Some(datagram.peer) == client.peer {
                replication.handle_packet(&datagram.payload);
            }
        }

        // Proxy spawns from the previous step finish now.
        for request in std::mem::take(&mut replication.host_mut().requests) {
            if KNOWN_MODELS.contains(&request.model_name.as_str()) {
                let host = replication.host_mut();
                let handle = ProxyHandle(host.next_proxy);
                host.next_proxy += 1;
                host.proxies.insert(
                    handle,
                    SimProxy {
                        actor: request.ticket.actor,
                        position: request.state.pose.position,
                        health: request.state.health,
                    },
                );
                if let Err(err) = replication.on_proxy_ready(request.ticket, handle) {
                    debug!(client = index, %err, "late proxy discarded");
                }
            } else {
                replication.on_proxy_failed(request.ticket);
            }
        }

        if hit {
            local_hit(replication, player, pick);
        }
        replication.tick(dt, client.peer.map(|_| player));
    }

    /// Run the configured duration and summarize.
    pub fn run(mut self) -> SimReport {
        let dt = 1.0 / self.settings.tick_rate.max(1.0);
        let steps = (self.settings.duration / dt).ceil() as u64;
        let mut next_report = 10.0;
        for _ in 0..steps {
            self.step(dt);
            if self.now >= next_report {
                next_report += 10.0;
                let stats = self.server.stats();
                info!(
                    elapsed = self.now,
                    actors = self.server.actors().count(),
                    pose_updates = stats.pose_updates,
                    deaths = stats.deaths,
                    in_flight = self.server_inbox.in_flight(),
                    "session progress"
                );
            }
        }
        self.report()
    }

    /// Current totals.
    pub fn report(&self) -> SimReport {
        let mut errors = Vec::new();
        let mut uplink = LinkStats::default();
        for client in &self.clients {
            let host = client.replication.host();
            uplink = add(uplink, client.retired);
            if let Some(link) = &host.link {
                uplink = add(uplink, link.stats());
            }
            let player = client.player();
            for proxy in host.proxies.values() {
                if let Some(entry) = self.server.try_get_actor(proxy.actor)
                    && !entry.is_gone()
                    && entry.pose().position.distance(player) <= self.near_band
                {
                    errors.push(entry.pose().position.distance(proxy.position));
                }
            }
        }
        let mean_error = if errors.is_empty() {
            0.0
        } else {
            errors.iter().sum::<f32>() / errors.len() as f32
        };
        SimReport {
            server: self.server.stats(),
            clients: self
                .clients
                .iter()
                .map(|c| c.replication.stats())
                .collect(),
            live_proxies: self
                .clients
                .iter()
                .map(|c| c.replication.host().proxies.len())
                .sum(),
            mean_error,
            max_error: errors.iter().copied().fold(0.0, f32::max),
            downlink: self.server.host().downlink_stats(),
            uplink,
            superseded: self.clients.iter().map(|c| c.inbox.superseded()).sum(),
        }
    }
}

/// Damage a random proxy within reach of the player.
fn local_hit(replication: &mut ClientReplication<SimClientHost>, player: Vec3, pick: f64) {
    let targets: Vec<SimProxy> = replication
        .host()
        .proxies
        .values()
        .filter(|p| p.position.distance(player) < 60.0 && !p.health.is_depleted())
        .copied()
        .collect();
    if targets.is_empty() {
        return;
    }
    let index = ((pick * targets.len() as f64) as usize).min(targets.len() - 1);
    let target = targets[index];
    let mut health = target.health;
    health.current -= HIT_DAMAGE;
    let damage = DamageInfo {
        amount: HIT_DAMAGE,
        weapon_type: 1,
        point: target.position,
        critical: false,
    };
    replication.on_local_health_changed(target.actor, health, damage);
}

fn crossed(now: f64, dt: f64, mark: f64) -> bool {
    now >= mark && now - dt < mark
}

fn add(a: LinkStats, b: LinkStats) -> LinkStats {
    LinkStats {
        sent: a.sent + b.sent,
        lost: a.lost + b.lost,
        retransmitted: a.retransmitted + b.retransmitted,
    }
}
