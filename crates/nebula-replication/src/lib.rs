//! Multiplayer actor replication: an authoritative server manager, a
//! mirroring client manager, interest management, chunked snapshot
//! transfer and a jitter-adaptive interpolation engine.
//!
//! Both managers are driven by the host's frame loop through `tick` and
//! talk to the host only through the traits in [`collab`].

pub mod actor;
pub mod client;
pub mod collab;
pub mod error;
pub mod interest;
pub mod interp_buffer;
pub mod interpolation;
pub mod jitter;
pub mod peers;
pub mod server;
pub mod snapshot;
pub mod tasks;
pub mod throttle;

#[cfg(test)]
mod test_support;

pub use actor::{ActorEntry, MAX_BUFFS, PositionKey};
pub use client::{ClientReplication, ClientStats};
pub use collab::{
    ActorCapture, ActorRegistry, ClientHost, ControllerHandle, ControllerSample, DamageOutcome,
    PeerDirectory, ProxyHandle, ProxyHost, ProxyRequest, SceneDirectory, ServerHost, SpawnTicket,
};
pub use error::ReplicationError;
pub use interest::{DistanceTier, PosePolicy, TIME_EPSILON, WatchOutcome, WatchRecord, WatcherRegistry};
pub use interp_buffer::{
    BufferSettings, InterpolationBuffer, PoseSample, PushOutcome, RenderPose, SampleMode,
};
pub use interpolation::{FeedOutcome, InterpolationSettings, NetworkInterpolator, PoseFeed};
pub use jitter::JitterEstimator;
pub use peers::PeerTable;
pub use server::{ReplicationServer, ServerStats};
pub use snapshot::{BroadcastSchedule, RefreshSchedule, SnapshotReceiver, SnapshotWriter};
pub use tasks::{CooperativeQueue, TickBudget};
pub use throttle::HealthThrottle;
