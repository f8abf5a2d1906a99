//! Recording mock hosts for the manager tests.
//!
//! Every payload a manager sends is decoded back into a [`Message`] so tests
//! assert on what actually went over the wire.

#![allow(dead_code)]

use std::collections::BTreeMap;

use glam::Vec3;
use nebula_net::{
    ActorId, AnimSample, BuffRecord, DamageInfo, Delivery, Health, Message, MessageKind, NetSink,
    PeerId, Pose, SceneRef, SendError, ServerLink, decode,
};

use crate::collab::{
    ActorCapture, ActorRegistry, ControllerHandle, ControllerSample, DamageOutcome, PeerDirectory,
    ProxyHandle, ProxyHost, ProxyRequest, SceneDirectory,
};
use crate::error::ReplicationError;
use crate::interp_buffer::RenderPose;
use crate::peers::PeerTable;

pub fn scene(path: &str) -> SceneRef {
    SceneRef {
        index: 1,
        path: path.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Server host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockController {
    pub capture: ActorCapture,
    pub enabled: bool,
    pub pose: Pose,
    pub anim: AnimSample,
    pub health: Health,
    /// `false` makes `apply_damage` report `NotApplicable`.
    pub damageable: bool,
    pub killed: bool,
    pub buffs: Vec<BuffRecord>,
    pub bad_buff: Option<i32>,
}

#[derive(Debug, Default)]
pub struct MockServerHost {
    pub peers: PeerTable,
    pub controllers: BTreeMap<ControllerHandle, MockController>,
    pub scene: Option<SceneRef>,
    pub sent: Vec<(PeerId, Delivery, Message)>,
    next_handle: u64,
}

impl MockServerHost {
    pub fn new() -> Self {
        Self {
            scene: Some(scene("Forest")),
            ..Self::default()
        }
    }

    /// Add an enabled controller at `position` with `health` max/current.
    pub fn add_controller(&mut self, position: Vec3, health: f32) -> ControllerHandle {
        let handle = ControllerHandle(self.next_handle);
        self.next_handle += 1;
        let pose = Pose::at(position);
        let capture = ActorCapture {
            pose,
            health: Health::full(health),
            model_name: Some("scav".to_string()),
            preset_name: Some("scav_default".to_string()),
            scene: self.scene.clone().unwrap_or_default(),
            enabled: true,
            ..ActorCapture::default()
        };
        self.controllers.insert(
            handle,
            MockController {
                capture,
                enabled: true,
                pose,
                anim: AnimSample::default(),
                health: Health::full(health),
                damageable: true,
                killed: false,
                buffs: Vec::new(),
                bad_buff: None,
            },
        );
        handle
    }

    pub fn controller(&mut self, handle: ControllerHandle) -> &mut MockController {
        self.controllers
            .get_mut(&handle)
            .expect("controller exists")
    }

    pub fn take_sent(&mut self) -> Vec<(PeerId, Delivery, Message)> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent_of(&self, kind: MessageKind) -> Vec<(PeerId, Message)> {
        self.sent
            .iter()
            .filter(|(_, _, msg)| msg.kind() == kind)
            .map(|(peer, _, msg)| (*peer, msg.clone()))
            .collect()
    }
}

impl ActorRegistry for MockServerHost {
    fn capture(&self, handle: ControllerHandle) -> Option<ActorCapture> {
        self.controllers.get(&handle).map(|c| c.capture.clone())
    }

    fn sample(&self, handle: ControllerHandle) -> Option<ControllerSample> {
        self.controllers.get(&handle).map(|c| ControllerSample {
            enabled: c.enabled,
            pose: c.pose,
            anim: c.anim,
        })
    }

    fn apply_damage(&mut self, handle: ControllerHandle, damage: &DamageInfo) -> DamageOutcome {
        match self.controllers.get_mut(&handle) {
            Some(c) if c.damageable && c.enabled => {
                c.health.current -= damage.amount;
                DamageOutcome::Applied { health: c.health }
            }
            _ => DamageOutcome::NotApplicable,
        }
    }

    fn force_kill(&mut self, handle: ControllerHandle) {
        if let Some(c) = self.controllers.get_mut(&handle) {
            c.killed = true;
            c.health.current = 0.0;
        }
    }

    fn apply_buff(&mut self, handle: ControllerHandle, buff: BuffRecord) -> Result<(), ReplicationError> {
        let c = self
            .controllers
            .get_mut(&handle)
            .ok_or(ReplicationError::UnknownActor(ActorId(handle.0)))?;
        if c.bad_buff == Some(buff.buff_id) {
            return Err(ReplicationError::Resolution {
                actor: ActorId(handle.0),
                what: format!("buff {}", buff.buff_id),
            });
        }
        c.buffs.push(buff);
        Ok(())
    }
}

impl PeerDirectory for MockServerHost {
    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_peers()
    }

    fn peer_position(&self, peer: PeerId) -> Option<Vec3> {
        self.peers.peer_position(peer)
    }
}

impl SceneDirectory for MockServerHost {
    fn current_scene(&self) -> Option<SceneRef> {
        self.scene.clone()
    }

    fn is_scene_loaded(&self, scene: &SceneRef) -> bool {
        self.scene.as_ref() == Some(scene)
    }
}

impl NetSink for MockServerHost {
    fn send(&mut self, peer: PeerId, delivery: Delivery, payload: &[u8]) -> Result<(), SendError> {
        if !self.peers.is_connected(peer) {
            return Err(SendError::NotConnected);
        }
        let msg = decode(payload).map_err(|e| SendError::Rejected(e.to_string()))?;
        self.sent.push((peer, delivery, msg));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client host
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockClientHost {
    pub connected: bool,
    pub scene: Option<SceneRef>,
    pub requests: Vec<ProxyRequest>,
    pub poses: Vec<(ProxyHandle, RenderPose)>,
    pub animations: Vec<(ProxyHandle, AnimSample)>,
    pub health: Vec<(ProxyHandle, Health)>,
    pub buffs: Vec<(ProxyHandle, BuffRecord)>,
    pub destroyed: Vec<ProxyHandle>,
    pub sent: Vec<(Delivery, Message)>,
    pub bad_buff: Option<i32>,
}

impl Default for MockClientHost {
    fn default() -> Self {
        Self {
            connected: true,
            scene: Some(scene("Forest")),
            requests: Vec::new(),
            poses: Vec::new(),
            animations: Vec::new(),
            health: Vec::new(),
            buffs: Vec::new(),
            destroyed: Vec::new(),
            sent: Vec::new(),
            bad_buff: None,
        }
    }
}

impl MockClientHost {
    pub fn sent_of(&self, kind: MessageKind) -> Vec<Message> {
        self.sent
            .iter()
            .filter(|(_, msg)| msg.kind() == kind)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn last_pose(&self, proxy: ProxyHandle) -> Option<RenderPose> {
        self.poses
            .iter()
            .rev()
            .find(|(h, _)| *h == proxy)
            .map(|(_, pose)| *pose)
    }
}

impl ProxyHost for MockClientHost {
    fn request_proxy(&mut self, request: ProxyRequest) {
        self.requests.push(request);
    }

    fn apply_pose(&mut self, proxy: ProxyHandle, pose: &RenderPose) {
        self.poses.push((proxy, *pose));
    }

    fn apply_animation(&mut self, proxy: ProxyHandle, anim: &AnimSample) {
        self.animations.push((proxy, *anim));
    }

    fn apply_health(&mut self, proxy: ProxyHandle, health: Health) {
        self.health.push((proxy, health));
    }

    fn apply_buff(&mut self, proxy: ProxyHandle, buff: BuffRecord) -> Result<(), ReplicationError> {
        if self.bad_buff == Some(buff.buff_id) {
            return Err(ReplicationError::Resolution {
                actor: ActorId(proxy.0),
                what: format!("buff {}", buff.buff_id),
            });
        }
        self.buffs.push((proxy, buff));
        Ok(())
    }

    fn destroy_proxy(&mut self, proxy: ProxyHandle) {
        self.destroyed.push(proxy);
    }
}

impl ServerLink for MockClientHost {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send_to_server(&mut self, delivery: Delivery, payload: &[u8]) -> Result<(), SendError> {
        if !self.connected {
            return Err(SendError::NotConnected);
        }
        let msg = decode(payload).map_err(|e| SendError::Rejected(e.to_string()))?;
        self.sent.push((delivery, msg));
        Ok(())
    }
}

impl SceneDirectory for MockClientHost {
    fn current_scene(&self) -> Option<SceneRef> {
        self.scene.clone()
    }

    fn is_scene_loaded(&self, scene: &SceneRef) -> bool {
        self.scene.as_ref() == Some(scene)
    }
}
