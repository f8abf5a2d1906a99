//! Replication wire layer: message catalog, versioned codec, delivery
//! tiering, traffic counters, retry backoff, and the transport seams the
//! host implements.

pub mod codec;
pub mod counters;
pub mod delivery;
pub mod messages;
pub mod retry;
pub mod transport;

pub use codec::{CodecConfig, CodecError, PROTOCOL_VERSION, decode, encode};
pub use counters::{KindStats, TrafficCounters};
pub use delivery::{Delivery, DeliveryMethod, DeliveryPolicy, DeliveryTier};
pub use messages::*;
pub use retry::{RetryPolicy, RetryState};
pub use transport::{Endpoint, NetSink, PeerId, SendError, ServerLink};
