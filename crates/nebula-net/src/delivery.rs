//! Delivery tiering: message kind → reliability/ordering tier → channel.
//!
//! The table is built once and consulted at every send. Kinds missing from
//! the table resolve to [`DeliveryTier::Critical`].

use rustc_hash::FxHashMap;

use crate::messages::MessageKind;

/// Reliability/ordering tiers, strictest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeliveryTier {
    /// Guaranteed and strictly ordered.
    Critical,
    /// Guaranteed, sequenced: stale arrivals are dropped, latest wins.
    Important,
    /// Guaranteed, any order.
    Normal,
    /// Best effort.
    Frequent,
    /// Best effort, latest wins.
    Voice,
}

/// Transport-level delivery method a tier asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// Reliable, in order.
    ReliableOrdered,
    /// Reliable, only the newest is kept.
    ReliableSequenced,
    /// Reliable, unordered.
    ReliableUnordered,
    /// Unreliable, unordered.
    Unreliable,
    /// Unreliable, only the newest is kept.
    Sequenced,
}

/// Resolved delivery parameters handed to the transport with each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Delivery {
    /// Tier the kind maps to.
    pub tier: DeliveryTier,
    /// Method the transport should use.
    pub method: DeliveryMethod,
    /// Channel number.
    pub channel: u8,
}

impl DeliveryTier {
    /// The transport method for this tier.
    pub fn method(self) -> DeliveryMethod {
        match self {
            DeliveryTier::Critical => DeliveryMethod::ReliableOrdered,
            DeliveryTier::Important => DeliveryMethod::ReliableSequenced,
            DeliveryTier::Normal => DeliveryMethod::ReliableUnordered,
            DeliveryTier::Frequent => DeliveryMethod::Unreliable,
            DeliveryTier::Voice => DeliveryMethod::Sequenced,
        }
    }

    /// The channel number for this tier.
    pub fn channel(self) -> u8 {
        match self {
            DeliveryTier::Critical => 0,
            DeliveryTier::Important => 1,
            DeliveryTier::Normal => 2,
            DeliveryTier::Frequent => 3,
            DeliveryTier::Voice => 4,
        }
    }

    /// `true` if the transport retransmits lost messages on this tier.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryTier::Critical | DeliveryTier::Important | DeliveryTier::Normal
        )
    }

    /// Resolve the full [`Delivery`] triple.
    pub fn delivery(self) -> Delivery {
        Delivery {
            tier: self,
            method: self.method(),
            channel: self.channel(),
        }
    }
}

/// Static kind → tier table.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    table: FxHashMap<MessageKind, DeliveryTier>,
}

impl DeliveryPolicy {
    /// A policy with no entries: everything resolves to `Critical`.
    pub fn empty() -> Self {
        Self {
            table: FxHashMap::default(),
        }
    }

    /// Set or replace the tier for one kind.
    pub fn with(mut self, kind: MessageKind, tier: DeliveryTier) -> Self {
        self.table.insert(kind, tier);
        self
    }

    /// Remove a kind from the table so it falls back to `Critical`.
    pub fn without(mut self, kind: MessageKind) -> Self {
        self.table.remove(&kind);
        self
    }

    /// Tier for `kind`.
    pub fn tier(&self, kind: MessageKind) -> DeliveryTier {
        self.table
            .get(&kind)
            .copied()
            .unwrap_or(DeliveryTier::Critical)
    }

    /// Full delivery parameters for `kind`.
    pub fn delivery(&self, kind: MessageKind) -> Delivery {
        self.tier(kind).delivery()
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::empty()
            .with(MessageKind::Spawn, DeliveryTier::Critical)
            .with(MessageKind::Despawn, DeliveryTier::Critical)
            .with(MessageKind::SnapshotChunk, DeliveryTier::Critical)
            .with(MessageKind::ActivationState, DeliveryTier::Important)
            .with(MessageKind::HealthBroadcast, DeliveryTier::Important)
            .with(MessageKind::HealthReport, DeliveryTier::Important)
            .with(MessageKind::BuffBroadcast, DeliveryTier::Normal)
            .with(MessageKind::BuffReport, DeliveryTier::Normal)
            .with(MessageKind::ActivationRequest, DeliveryTier::Normal)
            .with(MessageKind::SnapshotRequest, DeliveryTier::Normal)
            .with(MessageKind::StateUpdate, DeliveryTier::Voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_covers_every_kind() {
        let policy = DeliveryPolicy::default();
        for kind in MessageKind::ALL {
            assert!(policy.table.contains_key(&kind), "{kind:?} is unmapped");
        }
    }

    #[test]
    fn test_lifecycle_messages_are_strictly_ordered() {
        let policy = DeliveryPolicy::default();
        for kind in [
            MessageKind::Spawn,
            MessageKind::Despawn,
            MessageKind::SnapshotChunk,
        ] {
            let delivery = policy.delivery(kind);
            assert_eq!(delivery.method, DeliveryMethod::ReliableOrdered);
            assert_eq!(delivery.channel, 0);
        }
    }

    #[test]
    fn test_pose_updates_are_latest_wins() {
        let delivery = DeliveryPolicy::default().delivery(MessageKind::StateUpdate);
        assert_eq!(delivery.tier, DeliveryTier::Voice);
        assert_eq!(delivery.method, DeliveryMethod::Sequenced);
        assert!(!delivery.tier.is_reliable());
    }

    #[test]
    fn test_unmapped_kind_defaults_to_critical() {
        let policy = DeliveryPolicy::default().without(MessageKind::BuffBroadcast);
        assert_eq!(
            policy.tier(MessageKind::BuffBroadcast),
            DeliveryTier::Critical
        );
        assert_eq!(
            DeliveryPolicy::empty().tier(MessageKind::StateUpdate),
            DeliveryTier::Critical
        );
    }

    #[test]
    fn test_channels_are_distinct_per_tier() {
        let tiers = [
            DeliveryTier::Critical,
            DeliveryTier::Important,
            DeliveryTier::Normal,
            DeliveryTier::Frequent,
            DeliveryTier::Voice,
        ];
        let mut channels: Vec<u8> = tiers.iter().map(|t| t.channel()).collect();
        channels.dedup();
        assert_eq!(channels, vec![0, 1, 2, 3, 4]);
        assert_eq!(DeliveryTier::Voice.method(), DeliveryMethod::Sequenced);
    }
}
