//! Outbound seams to the host's transport, plus the [`Endpoint`] that
//! encodes, tiers and counts every message crossing them.
//!
//! Sends are fire-and-forget: a failed encode or a rejected send is logged,
//! counted, and skipped. Nothing here blocks.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecConfig, CodecError};
use crate::counters::TrafficCounters;
use crate::delivery::{Delivery, DeliveryPolicy};
use crate::messages::{Message, MessageKind};

/// Stable handle for a connected peer.
///
/// `index` is a slot in the host's peer arena; `generation` changes every
/// time the slot is reused, so a reconnecting peer never aliases the stale
/// handle of its previous connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    /// Arena slot.
    pub index: u32,
    /// Slot generation.
    pub generation: u32,
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}v{}", self.index, self.generation)
    }
}

/// Why the transport refused a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The peer (or server link) is not connected yet / anymore.
    #[error("not connected")]
    NotConnected,
    /// The transport rejected the payload.
    #[error("transport rejected payload: {0}")]
    Rejected(String),
}

/// Server-side sending capability: one payload to one peer.
pub trait NetSink {
    /// Enqueue `payload` for `peer` with the given delivery parameters.
    fn send(&mut self, peer: PeerId, delivery: Delivery, payload: &[u8]) -> Result<(), SendError>;
}

/// Client-side sending capability: the link to the server.
pub trait ServerLink {
    /// `true` once the handshake with the server has completed.
    fn is_connected(&self) -> bool;

    /// Enqueue `payload` for the server.
    fn send_to_server(&mut self, delivery: Delivery, payload: &[u8]) -> Result<(), SendError>;
}

/// Encodes, tiers and counts messages for one side of the connection.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    codec: CodecConfig,
    policy: DeliveryPolicy,
    counters: TrafficCounters,
}

impl Endpoint {
    /// Endpoint with the given codec settings and delivery policy.
    pub fn new(codec: CodecConfig, policy: DeliveryPolicy) -> Self {
        Self {
            codec,
            policy,
            counters: TrafficCounters::new(),
        }
    }

    /// Traffic counters gathered so far.
    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    /// Mutable counters (for callers that record their own rejections).
    pub fn counters_mut(&mut self) -> &mut TrafficCounters {
        &mut self.counters
    }

    /// The delivery policy in use.
    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    fn encode(&mut self, msg: &Message) -> Option<Vec<u8>> {
        match codec::encode(msg, &self.codec) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(kind = ?msg.kind(), %err, "failed to encode message, skipping send");
                self.counters.record_send_failure(msg.kind());
                None
            }
        }
    }

    /// Send `msg` to one peer. Returns `true` if the transport accepted it.
    pub fn send_to<S: NetSink + ?Sized>(&mut self, sink: &mut S, peer: PeerId, msg: &Message) -> bool {
        let Some(payload) = self.encode(msg) else {
            return false;
        };
        self.deliver(sink, peer, msg.kind(), &payload)
    }

    /// Send `msg` to every peer in `peers`, encoding once. Returns how many
    /// sends the transport accepted.
    pub fn broadcast<S: NetSink + ?Sized>(
        &mut self,
        sink: &mut S,
        peers: &[PeerId],
        msg: &Message,
    ) -> usize {
        if peers.is_empty() {
            return 0;
        }
        let Some(payload) = self.encode(msg) else {
            return 0;
        };
        let kind = msg.kind();
        peers
            .iter()
            .filter(|&&peer| self.deliver(sink, peer, kind, &payload))
            .count()
    }

    fn deliver<S: NetSink + ?Sized>(
        &mut self,
        sink: &mut S,
        peer: PeerId,
        kind: MessageKind,
        payload: &[u8],
    ) -> bool {
        let delivery = self.policy.delivery(kind);
        match sink.send(peer, delivery, payload) {
            Ok(()) => {
                tracing::trace!(?kind, %peer, bytes = payload.len(), "sent");
                self.counters.record_sent(kind, payload.len());
                true
            }
            Err(err) => {
                tracing::warn!(?kind, %peer, %err, "send failed, skipping");
                self.counters.record_send_failure(kind);
                false
            }
        }
    }

    /// Send `msg` to the server. Returns `true` if the link accepted it.
    pub fn send_to_server<L: ServerLink + ?Sized>(&mut self, link: &mut L, msg: &Message) -> bool {
        let Some(payload) = self.encode(msg) else {
            return false;
        };
        let kind = msg.kind();
        let delivery = self.policy.delivery(kind);
        match link.send_to_server(delivery, &payload) {
            Ok(()) => {
                self.counters.record_sent(kind, payload.len());
                true
            }
            Err(err) => {
                tracing::debug!(?kind, %err, "server send failed");
                self.counters.record_send_failure(kind);
                false
            }
        }
    }

    /// Decode an inbound payload and count it as received.
    pub fn receive(&mut self, payload: &[u8]) -> Result<Message, CodecError> {
        let msg = codec::decode(payload)?;
        self.counters.record_received(msg.kind(), payload.len());
        Ok(msg)
    }

    /// Count a decoded message the caller then dropped (malformed contents,
    /// unknown actor, stale timestamp).
    pub fn reject(&mut self, kind: MessageKind) {
        self.counters.record_rejected(kind);
    }
}
