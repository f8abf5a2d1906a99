//! Replication message catalog and the value types carried on the wire.
//!
//! Every message carries the actor id as its primary key. Field order is
//! fixed per message; use [`crate::codec`] for encoding/decoding.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Process-wide stable actor identifier, allocated by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u64);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// Actor lifecycle status. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ActorStatus {
    /// Controller enabled, simulated.
    #[default]
    Active,
    /// Controller present but disabled.
    Dormant,
    /// Removed without dying.
    Despawned,
    /// Killed. No further pose or health mutation applies.
    Dead,
}

impl ActorStatus {
    /// `true` for the statuses after which no watcher bookkeeping happens.
    pub fn is_gone(self) -> bool {
        matches!(self, Self::Despawned | Self::Dead)
    }
}

/// Position, rotation and velocity of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// World position in meters.
    pub position: Vec3,
    /// World rotation.
    pub rotation: Quat,
    /// Linear velocity in m/s.
    pub velocity: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
        }
    }
}

impl Pose {
    /// Pose at `position` facing identity, at rest.
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// `true` if every component is finite.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite() && self.velocity.is_finite()
    }
}

/// Health triple: max/current plus two armor values.
///
/// A `max` of zero or below means "not known yet".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Health {
    /// Maximum health; `<= 0` when unknown.
    pub max: f32,
    /// Current health.
    pub current: f32,
    /// Body armor value.
    pub body_armor: f32,
    /// Head armor value.
    pub head_armor: f32,
}

impl Health {
    /// Full health with no armor.
    pub fn full(max: f32) -> Self {
        Self {
            max,
            current: max,
            body_armor: 0.0,
            head_armor: 0.0,
        }
    }

    /// Returns a copy with `current` clamped to `[0, max]`. An unknown `max`
    /// becomes `max(1, current)`; non-finite values collapse to zero.
    pub fn clamped(self) -> Self {
        let finite = |v: f32| if v.is_finite() { v } else { 0.0 };
        let current = finite(self.current).max(0.0);
        let max = finite(self.max);
        let max = if max > 0.0 { max } else { current.max(1.0) };
        Self {
            max,
            current: current.min(max),
            body_armor: finite(self.body_armor).max(0.0),
            head_armor: finite(self.head_armor).max(0.0),
        }
    }

    /// `true` once current health reaches zero.
    pub fn is_depleted(&self) -> bool {
        self.current <= 0.0
    }

    /// `true` if every field is finite and non-negative.
    pub fn is_well_formed(&self) -> bool {
        [self.max, self.current, self.body_armor, self.head_armor]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// An applied buff: which weapon type produced it and which buff it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuffRecord {
    /// Item type id of the weapon that applied the buff.
    pub weapon_type: i32,
    /// Buff identifier.
    pub buff_id: i32,
}

/// The scene an actor belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SceneRef {
    /// Build index of the scene.
    pub index: i32,
    /// Scene asset path.
    pub path: String,
}

/// Animation parameters sampled alongside a pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AnimSample {
    /// Normalized movement speed.
    pub move_speed: f32,
    /// Movement direction relative to facing, in radians.
    pub move_direction: f32,
    /// Hand/weapon state discriminant.
    pub hand_state: u8,
    /// Weapon raised.
    pub aiming: bool,
    /// Dash in progress.
    pub dashing: bool,
}

/// Full-field copy of one actor, used by Spawn and snapshot chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    /// Actor id.
    pub actor_id: ActorId,
    /// Lifecycle status.
    pub status: ActorStatus,
    /// Whether the server-side controller is enabled.
    pub activated: bool,
    /// Proxy must survive out of range.
    pub persistent: bool,
    /// Pose at spawn.
    pub spawn_pose: Pose,
    /// Latest pose.
    pub pose: Pose,
    /// Server time the pose was sampled (seconds).
    pub pose_time: f64,
    /// Health triple.
    pub health: Health,
    /// Equipment slot name → item type id.
    pub equipment: BTreeMap<String, i32>,
    /// Weapon slot name → item type id.
    pub weapons: BTreeMap<String, i32>,
    /// Applied buffs, oldest first.
    pub buffs: Vec<BuffRecord>,
    /// Model identity.
    pub model_name: String,
    /// Character preset identity.
    pub preset_name: String,
    /// Owning scene.
    pub scene: SceneRef,
}

impl ActorState {
    /// Checks the fields a receiver must be able to trust.
    pub fn is_well_formed(&self) -> bool {
        self.pose.is_finite()
            && self.spawn_pose.is_finite()
            && self.pose_time.is_finite()
            && self.health.is_well_formed()
    }
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level replication message. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- server -> client ---
    /// A new actor exists.
    Spawn(Spawn),
    /// An actor is gone.
    Despawn(Despawn),
    /// Controller enabled/disabled.
    ActivationState(ActivationState),
    /// Periodic pose/health/animation sample.
    StateUpdate(StateUpdate),
    /// Authoritative health.
    HealthBroadcast(HealthBroadcast),
    /// A buff was applied.
    BuffBroadcast(BuffBroadcast),
    /// One chunk of a full-state transfer.
    SnapshotChunk(SnapshotChunk),

    // --- client -> server ---
    /// Local hit reported by a client.
    HealthReport(HealthReport),
    /// Local buff application reported by a client.
    BuffReport(BuffReport),
    /// "I am near this actor, start sending me its updates."
    ActivationRequest(ActivationRequest),
    /// Ask for a full-state transfer.
    SnapshotRequest(SnapshotRequest),
}

/// Discriminant-only view of [`Message`], used as a key for delivery
/// tiering and traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// [`Spawn`].
    Spawn,
    /// [`Despawn`].
    Despawn,
    /// [`ActivationState`].
    ActivationState,
    /// [`StateUpdate`].
    StateUpdate,
    /// [`HealthBroadcast`].
    HealthBroadcast,
    /// [`BuffBroadcast`].
    BuffBroadcast,
    /// [`SnapshotChunk`].
    SnapshotChunk,
    /// [`HealthReport`].
    HealthReport,
    /// [`BuffReport`].
    BuffReport,
    /// [`ActivationRequest`].
    ActivationRequest,
    /// [`SnapshotRequest`].
    SnapshotRequest,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Spawn,
        MessageKind::Despawn,
        MessageKind::ActivationState,
        MessageKind::StateUpdate,
        MessageKind::HealthBroadcast,
        MessageKind::BuffBroadcast,
        MessageKind::SnapshotChunk,
        MessageKind::HealthReport,
        MessageKind::BuffReport,
        MessageKind::ActivationRequest,
        MessageKind::SnapshotRequest,
    ];
}

impl Message {
    /// Extract the kind from a message without consuming it.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Spawn(_) => MessageKind::Spawn,
            Message::Despawn(_) => MessageKind::Despawn,
            Message::ActivationState(_) => MessageKind::ActivationState,
            Message::StateUpdate(_) => MessageKind::StateUpdate,
            Message::HealthBroadcast(_) => MessageKind::HealthBroadcast,
            Message::BuffBroadcast(_) => MessageKind::BuffBroadcast,
            Message::SnapshotChunk(_) => MessageKind::SnapshotChunk,
            Message::HealthReport(_) => MessageKind::HealthReport,
            Message::BuffReport(_) => MessageKind::BuffReport,
            Message::ActivationRequest(_) => MessageKind::ActivationRequest,
            Message::SnapshotRequest(_) => MessageKind::SnapshotRequest,
        }
    }

    /// The actor this message is about, if it is about a single actor.
    pub fn actor_id(&self) -> Option<ActorId> {
        match self {
            Message::Spawn(m) => Some(m.state.actor_id),
            Message::Despawn(m) => Some(m.actor_id),
            Message::ActivationState(m) => Some(m.actor_id),
            Message::StateUpdate(m) => Some(m.actor_id),
            Message::HealthBroadcast(m) => Some(m.actor_id),
            Message::BuffBroadcast(m) => Some(m.actor_id),
            Message::HealthReport(m) => Some(m.actor_id),
            Message::BuffReport(m) => Some(m.actor_id),
            Message::ActivationRequest(m) => Some(m.actor_id),
            Message::SnapshotChunk(_) | Message::SnapshotRequest(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Server announces a new actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Spawn {
    /// Full state at registration.
    pub state: ActorState,
}

/// Why an actor went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DespawnReason {
    /// Killed.
    Death,
    /// Deregistered or its controller disappeared.
    Removed,
}

/// Server removes an actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Despawn {
    /// Actor id.
    pub actor_id: ActorId,
    /// Why.
    pub reason: DespawnReason,
}

/// Server reports a controller enable/disable transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivationState {
    /// Actor id.
    pub actor_id: ActorId,
    /// New activation flag.
    pub activated: bool,
}

/// Periodic pose + health + animation sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateUpdate {
    /// Actor id.
    pub actor_id: ActorId,
    /// Server session time when sampled (seconds). Non-decreasing per actor.
    pub remote_time: f64,
    /// Sampled pose.
    pub pose: Pose,
    /// Health at sample time.
    pub health: Health,
    /// Animation parameters.
    pub anim: AnimSample,
}

/// Authoritative health for one actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthBroadcast {
    /// Actor id.
    pub actor_id: ActorId,
    /// Clamped health.
    pub health: Health,
    /// Actor has died.
    pub is_dead: bool,
}

/// A buff applied on the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuffBroadcast {
    /// Actor id.
    pub actor_id: ActorId,
    /// The buff.
    pub buff: BuffRecord,
}

/// One chunk of a full-state transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotChunk {
    /// Identifies the transfer this chunk belongs to.
    pub stream_id: u32,
    /// Position of this chunk within its stream.
    pub index: u32,
    /// Last chunk of the stream.
    pub last: bool,
    /// Receiver must discard its mirror before applying this stream.
    pub reset: bool,
    /// Bounded list of entries.
    pub entries: Vec<ActorState>,
}

/// Client-observed damage, described for the server's damage pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DamageInfo {
    /// Damage amount after armor on the client.
    pub amount: f32,
    /// Item type id of the weapon used.
    pub weapon_type: i32,
    /// Hit location.
    pub point: Vec3,
    /// Critical hit.
    pub critical: bool,
}

/// Client reports a local hit on an actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// Actor id.
    pub actor_id: ActorId,
    /// Health as the client sees it after the hit.
    pub health: Health,
    /// The hit itself.
    pub damage: DamageInfo,
    /// Client believes the actor died.
    pub is_dead: bool,
}

impl HealthReport {
    /// Checks float fields before the server trusts anything in the report.
    pub fn is_well_formed(&self) -> bool {
        self.health.is_well_formed()
            && self.damage.amount.is_finite()
            && self.damage.amount >= 0.0
            && self.damage.point.is_finite()
    }
}

/// Client reports a buff it applied locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuffReport {
    /// Actor id.
    pub actor_id: ActorId,
    /// The buff.
    pub buff: BuffRecord,
}

/// Client asks to watch an actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivationRequest {
    /// Actor id.
    pub actor_id: ActorId,
}

/// Client asks for a full-state transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRequest {
    /// Scene the client is in; the server only serves matching actors.
    pub scene: SceneRef,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_bounds_current_to_max() {
        let h = Health {
            max: 100.0,
            current: 140.0,
            ..Health::default()
        }
        .clamped();
        assert_eq!(h.current, 100.0);

        let h = Health {
            max: 100.0,
            current: -5.0,
            ..Health::default()
        }
        .clamped();
        assert_eq!(h.current, 0.0);
    }

    #[test]
    fn test_unknown_max_defaults_to_current() {
        let h = Health {
            max: 0.0,
            current: 40.0,
            ..Health::default()
        }
        .clamped();
        assert_eq!(h.max, 40.0);
        assert_eq!(h.current, 40.0);

        let h = Health {
            max: -1.0,
            current: 0.0,
            ..Health::default()
        }
        .clamped();
        assert_eq!(h.max, 1.0);
    }

    #[test]
    fn test_nan_health_collapses_to_zero() {
        let h = Health {
            max: 100.0,
            current: f32::NAN,
            body_armor: f32::INFINITY,
            head_armor: 2.0,
        }
        .clamped();
        assert_eq!(h.current, 0.0);
        assert_eq!(h.body_armor, 0.0);
        assert!(h.is_well_formed());
    }

    #[test]
    fn test_kind_matches_variant() {
        let msg = Message::ActivationRequest(ActivationRequest {
            actor_id: ActorId(3),
        });
        assert_eq!(msg.kind(), MessageKind::ActivationRequest);
        assert_eq!(msg.actor_id(), Some(ActorId(3)));
    }

    #[test]
    fn test_malformed_report_detected() {
        let report = HealthReport {
            actor_id: ActorId(1),
            health: Health::full(100.0),
            damage: DamageInfo {
                amount: f32::NAN,
                ..DamageInfo::default()
            },
            is_dead: false,
        };
        assert!(!report.is_well_formed());
    }

    #[test]
    fn test_gone_statuses() {
        assert!(ActorStatus::Dead.is_gone());
        assert!(ActorStatus::Despawned.is_gone());
        assert!(!ActorStatus::Dormant.is_gone());
    }
}
