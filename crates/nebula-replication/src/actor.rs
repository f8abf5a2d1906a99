//! The replicated actor record shared by the server table and the client
//! mirror.
//!
//! An [`ActorEntry`] is never removed from its table while the session runs:
//! despawn and death only move its status, so snapshots and diagnostics can
//! still read the last known state. Once `Dead`, the entry refuses every
//! further pose, health and buff mutation.

use std::collections::{BTreeMap, VecDeque};

use glam::Vec3;
use nebula_net::{ActorId, ActorState, ActorStatus, BuffRecord, Health, Pose, SceneRef};

/// Maximum number of buff records kept per actor; older ones are evicted.
pub const MAX_BUFFS: usize = 32;

// ---------------------------------------------------------------------------
// PositionKey
// ---------------------------------------------------------------------------

/// Coarse grid cell of an actor's position, used for cheap neighborhood
/// lookups before exact distance checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PositionKey {
    /// Cell X.
    pub x: i32,
    /// Cell Y.
    pub y: i32,
    /// Cell Z.
    pub z: i32,
}

impl PositionKey {
    /// The cell containing `position` for cubic cells of `cell_size` meters.
    pub fn from_position(position: Vec3, cell_size: f32) -> Self {
        let cell = if cell_size > 0.0 { cell_size } else { 1.0 };
        let scaled = (position / cell).floor();
        Self {
            x: scaled.x as i32,
            y: scaled.y as i32,
            z: scaled.z as i32,
        }
    }

    /// Chebyshev distance in cells.
    pub fn chebyshev(&self, other: &PositionKey) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dy = self.y.abs_diff(other.y);
        let dz = self.z.abs_diff(other.z);
        dx.max(dy).max(dz)
    }
}

// ---------------------------------------------------------------------------
// ActorEntry
// ---------------------------------------------------------------------------

/// One replicated AI actor.
#[derive(Debug, Clone)]
pub struct ActorEntry {
    id: ActorId,
    status: ActorStatus,
    /// Server: the controller is enabled. Client: a proxy should exist.
    pub activated: bool,
    /// Proxy survives leaving the activation radius.
    pub persistent: bool,
    /// Pose captured at spawn.
    pub spawn_pose: Pose,
    pose: Pose,
    pose_time: f64,
    health: Health,
    /// Equipment slot name → item type id.
    pub equipment: BTreeMap<String, i32>,
    /// Weapon slot name → item type id.
    pub weapons: BTreeMap<String, i32>,
    buffs: VecDeque<BuffRecord>,
    /// Model identity.
    pub model_name: String,
    /// Character preset identity.
    pub preset_name: String,
    /// Owning scene.
    pub scene: SceneRef,
    position_key: PositionKey,
    cell_size: f32,
}

impl ActorEntry {
    /// A fresh, dormant entry at the origin.
    pub fn new(id: ActorId, scene: SceneRef, cell_size: f32) -> Self {
        Self {
            id,
            status: ActorStatus::Dormant,
            activated: false,
            persistent: false,
            spawn_pose: Pose::default(),
            pose: Pose::default(),
            pose_time: 0.0,
            health: Health::default(),
            equipment: BTreeMap::new(),
            weapons: BTreeMap::new(),
            buffs: VecDeque::new(),
            model_name: String::new(),
            preset_name: String::new(),
            scene,
            position_key: PositionKey::default(),
            cell_size,
        }
    }

    /// Build an entry from a full-field wire copy.
    pub fn from_state(state: &ActorState, cell_size: f32) -> Self {
        let mut entry = Self::new(state.actor_id, state.scene.clone(), cell_size);
        entry.copy_fields(state);
        entry
    }

    /// Full-field overwrite from a wire copy, keeping the id. A dead entry
    /// ignores the overwrite. Returns whether anything was applied.
    pub fn overwrite(&mut self, state: &ActorState) -> bool {
        if self.is_dead() || state.actor_id != self.id {
            return false;
        }
        self.copy_fields(state);
        true
    }

    fn copy_fields(&mut self, state: &ActorState) {
        self.status = state.status;
        self.activated = state.activated;
        self.persistent = state.persistent;
        self.spawn_pose = state.spawn_pose;
        self.pose = state.pose;
        self.pose_time = state.pose_time;
        self.health = state.health.clamped();
        self.equipment = state.equipment.clone();
        self.weapons = state.weapons.clone();
        self.buffs.clear();
        let skip = state.buffs.len().saturating_sub(MAX_BUFFS);
        self.buffs.extend(state.buffs.iter().skip(skip).copied());
        self.model_name = state.model_name.clone();
        self.preset_name = state.preset_name.clone();
        self.scene = state.scene.clone();
        self.refresh_position_key();
    }

    /// Full-field wire copy of this entry.
    pub fn to_state(&self) -> ActorState {
        ActorState {
            actor_id: self.id,
            status: self.status,
            activated: self.activated,
            persistent: self.persistent,
            spawn_pose: self.spawn_pose,
            pose: self.pose,
            pose_time: self.pose_time,
            health: self.health,
            equipment: self.equipment.clone(),
            weapons: self.weapons.clone(),
            buffs: self.buffs.iter().copied().collect(),
            model_name: self.model_name.clone(),
            preset_name: self.preset_name.clone(),
            scene: self.scene.clone(),
        }
    }

    /// Stable id.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Lifecycle status.
    pub fn status(&self) -> ActorStatus {
        self.status
    }

    /// `true` once the actor has died.
    pub fn is_dead(&self) -> bool {
        self.status == ActorStatus::Dead
    }

    /// `true` once the actor is dead or despawned.
    pub fn is_gone(&self) -> bool {
        self.status.is_gone()
    }

    /// Last known pose.
    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    /// Time the last known pose was sampled.
    pub fn pose_time(&self) -> f64 {
        self.pose_time
    }

    /// Current (clamped) health.
    pub fn health(&self) -> Health {
        self.health
    }

    /// Coarse grid cell of the current position.
    pub fn position_key(&self) -> PositionKey {
        self.position_key
    }

    /// Applied buffs, oldest first.
    pub fn buffs(&self) -> impl Iterator<Item = &BuffRecord> {
        self.buffs.iter()
    }

    /// Record a pose sampled at `time`. Rejected when dead, non-finite, or
    /// older than the pose already held.
    pub fn record_pose(&mut self, pose: Pose, time: f64) -> bool {
        if self.is_dead() || !pose.is_finite() || !time.is_finite() || time < self.pose_time {
            return false;
        }
        self.pose = pose;
        self.pose_time = time;
        self.refresh_position_key();
        true
    }

    /// Store health, clamped. Rejected when dead.
    pub fn set_health(&mut self, health: Health) -> bool {
        if self.is_dead() {
            return false;
        }
        self.health = health.clamped();
        true
    }

    /// Append a buff, evicting the oldest past [`MAX_BUFFS`]. Rejected when
    /// dead.
    pub fn push_buff(&mut self, buff: BuffRecord) -> bool {
        if self.is_dead() {
            return false;
        }
        if self.buffs.len() == MAX_BUFFS {
            self.buffs.pop_front();
        }
        self.buffs.push_back(buff);
        true
    }

    /// Transition to `Dead`. Returns `false` if the actor was already dead.
    pub fn mark_dead(&mut self) -> bool {
        if self.is_dead() {
            return false;
        }
        self.status = ActorStatus::Dead;
        self.health.current = 0.0;
        self.activated = false;
        true
    }

    /// Transition to `Despawned`. Returns `false` if already gone.
    pub fn mark_despawned(&mut self) -> bool {
        if self.is_gone() {
            return false;
        }
        self.status = ActorStatus::Despawned;
        self.activated = false;
        true
    }

    /// Move between `Active` and `Dormant`. Gone actors stay as they are.
    /// Returns `true` if the activation flag changed.
    pub fn set_activated(&mut self, activated: bool) -> bool {
        if self.is_gone() || self.activated == activated {
            return false;
        }
        self.activated = activated;
        self.status = if activated {
            ActorStatus::Active
        } else {
            ActorStatus::Dormant
        };
        true
    }

    fn refresh_position_key(&mut self) {
        self.position_key = PositionKey::from_position(self.pose.position, self.cell_size);
    }
}
