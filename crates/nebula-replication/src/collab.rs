//! Capabilities the host game provides to the replication core.
//!
//! The managers never reach into host types. Everything they need from the
//! actor registry, the peer set, the scene system and the proxy spawner
//! comes through these traits, and every lookup is allowed to fail.

use std::collections::BTreeMap;

use glam::Vec3;
use nebula_net::{
    ActorId, ActorState, AnimSample, BuffRecord, DamageInfo, Health, NetSink, PeerId, Pose,
    SceneRef, ServerLink,
};

use crate::error::ReplicationError;
use crate::interp_buffer::RenderPose;

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Opaque handle to an AI controller owned by the host simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerHandle(pub u64);

/// Metadata captured from a controller at registration.
///
/// `model_name`/`preset_name` are `None` when the registry could not
/// resolve them; the server substitutes its configured default.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActorCapture {
    /// Current pose.
    pub pose: Pose,
    /// Current health.
    pub health: Health,
    /// Equipment slot name → item type id.
    pub equipment: BTreeMap<String, i32>,
    /// Weapon slot name → item type id.
    pub weapons: BTreeMap<String, i32>,
    /// Buffs already applied.
    pub buffs: Vec<BuffRecord>,
    /// Model identity, if resolvable.
    pub model_name: Option<String>,
    /// Preset identity, if resolvable.
    pub preset_name: Option<String>,
    /// Owning scene.
    pub scene: SceneRef,
    /// Proxy must survive out of range.
    pub persistent: bool,
    /// Controller currently enabled.
    pub enabled: bool,
}

/// Per-tick reading of a live controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControllerSample {
    /// Controller enabled.
    pub enabled: bool,
    /// Current pose.
    pub pose: Pose,
    /// Current animation parameters.
    pub anim: AnimSample,
}

/// Result of pushing client-reported damage through the host's damage
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DamageOutcome {
    /// Damage applied; this is the resulting health.
    Applied {
        /// Health after the hit.
        health: Health,
    },
    /// The controller is missing or disabled; nothing was applied.
    NotApplicable,
}

/// Authoritative actor registry.
pub trait ActorRegistry {
    /// Capture full metadata for a newly registered controller.
    fn capture(&self, handle: ControllerHandle) -> Option<ActorCapture>;

    /// Read the controller this tick; `None` once it no longer exists.
    fn sample(&self, handle: ControllerHandle) -> Option<ControllerSample>;

    /// Run damage through the normal damage pipeline.
    fn apply_damage(&mut self, handle: ControllerHandle, damage: &DamageInfo) -> DamageOutcome;

    /// Kill the controller outright.
    fn force_kill(&mut self, handle: ControllerHandle);

    /// Apply a buff to the controller.
    fn apply_buff(&mut self, handle: ControllerHandle, buff: BuffRecord) -> Result<(), ReplicationError>;
}

/// Connected peers and where their players are.
pub trait PeerDirectory {
    /// Every connected peer.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// World position of a peer's player, if known.
    fn peer_position(&self, peer: PeerId) -> Option<Vec3>;
}

/// Scene and lifecycle queries.
pub trait SceneDirectory {
    /// The scene this simulation is currently in.
    fn current_scene(&self) -> Option<SceneRef>;

    /// `true` if `scene` is loaded; updates for unloaded scenes are dropped.
    fn is_scene_loaded(&self, scene: &SceneRef) -> bool;
}

/// Everything the server-role manager needs from its host.
pub trait ServerHost: ActorRegistry + PeerDirectory + SceneDirectory + NetSink {}

impl<T: ActorRegistry + PeerDirectory + SceneDirectory + NetSink> ServerHost for T {}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Opaque handle to a renderable proxy owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyHandle(pub u64);

/// Identifies one asynchronous proxy spawn. The epoch changes whenever the
/// actor's proxy is torn down, so a result arriving late can be recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpawnTicket {
    /// Actor the proxy is for.
    pub actor: ActorId,
    /// Actor epoch when the request was issued.
    pub epoch: u32,
}

/// A proxy spawn request handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRequest {
    /// Echo this back through `on_proxy_ready` / `on_proxy_failed`.
    pub ticket: SpawnTicket,
    /// Model to instantiate.
    pub model_name: String,
    /// `true` when `model_name` is the configured fallback.
    pub fallback: bool,
    /// Full actor state at request time.
    pub state: ActorState,
}

/// Client-side scene object management.
pub trait ProxyHost {
    /// Start creating a proxy. The host answers later with
    /// `ClientReplication::on_proxy_ready` or `on_proxy_failed`.
    fn request_proxy(&mut self, request: ProxyRequest);

    /// Move a proxy.
    fn apply_pose(&mut self, proxy: ProxyHandle, pose: &RenderPose);

    /// Drive a proxy's animator.
    fn apply_animation(&mut self, proxy: ProxyHandle, anim: &AnimSample);

    /// Set a proxy's health.
    fn apply_health(&mut self, proxy: ProxyHandle, health: Health);

    /// Apply a buff to a proxy.
    fn apply_buff(&mut self, proxy: ProxyHandle, buff: BuffRecord) -> Result<(), ReplicationError>;

    /// Destroy a proxy.
    fn destroy_proxy(&mut self, proxy: ProxyHandle);
}

/// Everything the client-role manager needs from its host.
pub trait ClientHost: ProxyHost + ServerLink + SceneDirectory {}

impl<T: ProxyHost + ServerLink + SceneDirectory> ClientHost for T {}
