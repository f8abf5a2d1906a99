//! Per-message-kind traffic counters for introspection.

use rustc_hash::FxHashMap;

use crate::messages::MessageKind;

/// Accumulated counts and bytes for a single message kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Messages sent.
    pub sent: u64,
    /// Messages received and accepted.
    pub received: u64,
    /// Messages received and dropped (malformed, stale, unknown actor).
    pub rejected: u64,
    /// Messages whose send failed or was skipped.
    pub send_failures: u64,
    /// Encoded bytes sent.
    pub bytes_sent: u64,
    /// Encoded bytes received.
    pub bytes_received: u64,
}

/// Counters keyed by [`MessageKind`].
#[derive(Debug, Clone, Default)]
pub struct TrafficCounters {
    per_kind: FxHashMap<MessageKind, KindStats>,
}

impl TrafficCounters {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// One message of `kind` was sent as `bytes` encoded bytes.
    pub fn record_sent(&mut self, kind: MessageKind, bytes: usize) {
        let entry = self.per_kind.entry(kind).or_default();
        entry.sent += 1;
        entry.bytes_sent += bytes as u64;
    }

    /// One message of `kind` arrived as `bytes` encoded bytes and was accepted.
    pub fn record_received(&mut self, kind: MessageKind, bytes: usize) {
        let entry = self.per_kind.entry(kind).or_default();
        entry.received += 1;
        entry.bytes_received += bytes as u64;
    }

    /// One message of `kind` arrived and was dropped.
    pub fn record_rejected(&mut self, kind: MessageKind) {
        self.per_kind.entry(kind).or_default().rejected += 1;
    }

    /// Sending one message of `kind` failed.
    pub fn record_send_failure(&mut self, kind: MessageKind) {
        self.per_kind.entry(kind).or_default().send_failures += 1;
    }

    /// Stats for one kind (zeroes if never seen).
    pub fn stats(&self, kind: MessageKind) -> KindStats {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }

    /// Sent count for one kind.
    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.stats(kind).sent
    }

    /// Received (accepted) count for one kind.
    pub fn received(&self, kind: MessageKind) -> u64 {
        self.stats(kind).received
    }

    /// Sum over every kind.
    pub fn total(&self) -> KindStats {
        self.per_kind
            .values()
            .fold(KindStats::default(), |mut acc, s| {
                acc.sent += s.sent;
                acc.received += s.received;
                acc.rejected += s.rejected;
                acc.send_failures += s.send_failures;
                acc.bytes_sent += s.bytes_sent;
                acc.bytes_received += s.bytes_received;
                acc
            })
    }

    /// Take the current counters, leaving zeroes behind.
    pub fn snapshot_and_reset(&mut self) -> FxHashMap<MessageKind, KindStats> {
        std::mem::take(&mut self.per_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate_per_kind() {
        let mut counters = TrafficCounters::new();
        counters.record_sent(MessageKind::StateUpdate, 40);
        counters.record_sent(MessageKind::StateUpdate, 42);
        counters.record_received(MessageKind::HealthReport, 20);
        counters.record_rejected(MessageKind::HealthReport);

        let pose = counters.stats(MessageKind::StateUpdate);
        assert_eq!(pose.sent, 2);
        assert_eq!(pose.bytes_sent, 82);
        assert_eq!(counters.received(MessageKind::HealthReport), 1);
        assert_eq!(counters.stats(MessageKind::HealthReport).rejected, 1);
        assert_eq!(counters.sent(MessageKind::Spawn), 0);
    }

    #[test]
    fn test_total_and_reset() {
        let mut counters = TrafficCounters::new();
        counters.record_sent(MessageKind::Spawn, 100);
        counters.record_sent(MessageKind::Despawn, 10);
        counters.record_send_failure(MessageKind::Despawn);
        let total = counters.total();
        assert_eq!(total.sent, 2);
        assert_eq!(total.bytes_sent, 110);
        assert_eq!(total.send_failures, 1);

        let taken = counters.snapshot_and_reset();
        assert_eq!(taken.len(), 2);
        assert_eq!(counters.total(), KindStats::default());
    }
}
