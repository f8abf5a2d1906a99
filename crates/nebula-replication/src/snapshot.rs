//! Snapshot transfer: chunked full-state copies for late join, reconnect
//! and periodic consistency refresh.
//!
//! The server side is stateless apart from a stream counter: it cuts the
//! live actor list into fixed-capacity chunks. The client side queues the
//! received entries and drains them a few per frame. A `reset` chunk asks
//! the client to tear down every proxy once before the stream's entries are
//! applied.

use std::time::Duration;

use nebula_net::{ActorState, RetryPolicy, RetryState, SnapshotChunk};

use crate::tasks::{CooperativeQueue, TickBudget};

// ---------------------------------------------------------------------------
// SnapshotWriter
// ---------------------------------------------------------------------------

/// Cuts actor state lists into chunks.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    chunk_capacity: usize,
    next_stream: u32,
}

impl SnapshotWriter {
    /// Writer producing chunks of at most `chunk_capacity` entries.
    pub fn new(chunk_capacity: usize) -> Self {
        Self {
            chunk_capacity: chunk_capacity.max(1),
            next_stream: 0,
        }
    }

    /// Build one stream. The first chunk carries `reset`; the last one is
    /// flagged `last`. An empty list still yields one empty chunk so the
    /// reset reaches the receiver.
    pub fn write(&mut self, entries: impl IntoIterator<Item = ActorState>, reset: bool) -> Vec<SnapshotChunk> {
        let stream_id = self.next_stream;
        self.next_stream = self.next_stream.wrapping_add(1);

        let mut chunks = Vec::new();
        let mut buffer = Vec::with_capacity(self.chunk_capacity);
        for entry in entries {
            buffer.push(entry);
            if buffer.len() == self.chunk_capacity {
                let full = std::mem::replace(&mut buffer, Vec::with_capacity(self.chunk_capacity));
                chunks.push(Self::chunk(stream_id, chunks.len(), reset, full));
            }
        }
        if !buffer.is_empty() || chunks.is_empty() {
            chunks.push(Self::chunk(stream_id, chunks.len(), reset, buffer));
        }
        if let Some(last) = chunks.last_mut() {
            last.last = true;
        }
        chunks
    }

    fn chunk(stream_id: u32, index: usize, reset: bool, entries: Vec<ActorState>) -> SnapshotChunk {
        SnapshotChunk {
            stream_id,
            index: index as u32,
            last: false,
            reset: reset && index == 0,
            entries,
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotReceiver
// ---------------------------------------------------------------------------

/// Client-side queue of received snapshot entries.
#[derive(Debug, Clone)]
pub struct SnapshotReceiver {
    queue: CooperativeQueue<(u32, ActorState)>,
    reset_pending: bool,
    last_reset_stream: Option<u32>,
    rejected: u64,
}

impl SnapshotReceiver {
    /// Receiver holding at most `capacity` entries and applying at most
    /// `per_frame` entries (and `time_budget` of wall time) per drain.
    pub fn new(capacity: usize, per_frame: usize, time_budget: Duration) -> Self {
        Self {
            queue: CooperativeQueue::new(capacity, per_frame, time_budget),
            reset_pending: false,
            last_reset_stream: None,
            rejected: 0,
        }
    }

    /// Queue a chunk's entries. Malformed entries are dropped and counted.
    /// Returns how many entries were queued.
    pub fn receive(&mut self, chunk: SnapshotChunk) -> usize {
        if chunk.reset && self.last_reset_stream != Some(chunk.stream_id) {
            let stream = chunk.stream_id;
            self.queue.retain(|(s, _)| *s == stream);
            self.reset_pending = true;
            self.last_reset_stream = Some(stream);
        }

        let mut queued = 0;
        for entry in chunk.entries {
            if !entry.is_well_formed() {
                tracing::warn!(actor = %entry.actor_id, "dropping malformed snapshot entry");
                self.rejected += 1;
                continue;
            }
            if self.queue.push((chunk.stream_id, entry)).is_some() {
                tracing::debug!("snapshot queue full, oldest entry dropped");
            }
            queued += 1;
        }
        queued
    }

    /// Returns `true` exactly once per reset stream; the caller tears down
    /// its proxies and mirror before draining.
    pub fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_pending)
    }

    /// Start a drain.
    pub fn begin_drain(&self) -> TickBudget {
        self.queue.begin_tick()
    }

    /// Next entry to apply if the budget allows.
    pub fn next_entry(&mut self, budget: &mut TickBudget) -> Option<ActorState> {
        self.queue.pop(budget).map(|(_, entry)| entry)
    }

    /// Entries waiting.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Entries dropped for failing validation.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Entries evicted by overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Server's periodic full broadcast. If the previous broadcast found no
/// peers the next one comes after the shorter retry interval.
#[derive(Debug, Clone)]
pub struct BroadcastSchedule {
    interval: f64,
    retry_interval: f64,
    next_at: f64,
}

impl BroadcastSchedule {
    /// First broadcast one `interval` after `now`.
    pub fn new(interval: f64, retry_interval: f64, now: f64) -> Self {
        Self {
            interval,
            retry_interval: retry_interval.min(interval),
            next_at: now + interval,
        }
    }

    /// `true` if a broadcast is due.
    pub fn due(&self, now: f64) -> bool {
        now >= self.next_at
    }

    /// Record a broadcast at `now` that reached `peers` peers.
    pub fn record(&mut self, now: f64, peers: usize) {
        let wait = if peers == 0 {
            self.retry_interval
        } else {
            self.interval
        };
        self.next_at = now + wait;
    }

    /// Time of the next broadcast.
    pub fn next_at(&self) -> f64 {
        self.next_at
    }
}

/// Client's refresh cadence: once per scene entry, then every `interval`.
/// While the server link is down, attempts back off and retry.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    interval: f64,
    next_at: f64,
    retry: RetryState,
}

impl RefreshSchedule {
    /// Schedule whose first request is due immediately.
    pub fn new(interval: f64, retry: RetryPolicy) -> Self {
        Self {
            interval,
            next_at: f64::NEG_INFINITY,
            retry: RetryState::new(retry),
        }
    }

    /// Make a request due now (scene entry, unknown actor seen).
    pub fn request_now(&mut self) {
        self.next_at = f64::NEG_INFINITY;
        self.retry.reset();
    }

    /// `true` if a request should go out at `now`.
    pub fn due(&self, now: f64) -> bool {
        now >= self.next_at
    }

    /// A request went out at `now`.
    pub fn record_sent(&mut self, now: f64) {
        self.retry.reset();
        self.next_at = now + self.interval;
    }

    /// A request could not be sent at `now`. Backs off; once retries run
    /// out the schedule falls back to the regular interval.
    pub fn record_failed(&mut self, now: f64) {
        match self.retry.record_attempt(now) {
            Some(delay) => self.next_at = now + delay,
            None => {
                self.retry.reset();
                self.next_at = now + self.interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_net::{ActorId, ActorStatus, Health, Pose, SceneRef};

    fn state(id: u64) -> ActorState {
        ActorState {
            actor_id: ActorId(id),
            status: ActorStatus::Active,
            activated: true,
            persistent: false,
            spawn_pose: Pose::default(),
            pose: Pose::default(),
            pose_time: 0.0,
            health: Health::full(100.0),
            equipment: Default::default(),
            weapons: Default::default(),
            buffs: Vec::new(),
            model_name: "scav".to_string(),
            preset_name: String::new(),
            scene: SceneRef::default(),
        }
    }

    fn receiver() -> SnapshotReceiver {
        SnapshotReceiver::new(512, 16, Duration::ZERO)
    }

    fn drain_all(rx: &mut SnapshotReceiver) -> Vec<u64> {
        let mut budget = rx.begin_drain();
        let mut out = Vec::new();
        while let Some(entry) = rx.next_entry(&mut budget) {
            out.push(entry.actor_id.0);
        }
        out
    }

    #[test]
    fn test_writer_chunks_at_capacity() {
        let mut writer = SnapshotWriter::new(3);
        let chunks = writer.write((0..7).map(state), true);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.entries.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(chunks[0].reset);
        assert!(!chunks[1].reset && !chunks[2].reset);
        assert!(chunks[2].last && !chunks[0].last);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let mut writer = SnapshotWriter::new(2);
        let chunks = writer.write((0..4).map(state), false);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].last);
    }

    #[test]
    fn test_empty_table_yields_one_reset_chunk() {
        let mut writer = SnapshotWriter::new(32);
        let chunks = writer.write(Vec::new(), true);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].reset && chunks[0].last);
        assert!(chunks[0].entries.is_empty());
    }

    #[test]
    fn test_streams_get_distinct_ids() {
        let mut writer = SnapshotWriter::new(32);
        let a = writer.write(vec![state(1)], false);
        let b = writer.write(vec![state(1)], false);
        assert_ne!(a[0].stream_id, b[0].stream_id);
    }

    #[test]
    fn test_reset_drops_older_streams_and_fires_once() {
        let mut writer = SnapshotWriter::new(2);
        let mut rx = receiver();
        for chunk in writer.write((0..2).map(state), false) {
            rx.receive(chunk);
        }
        assert_eq!(rx.pending(), 2);

        let mut reset_stream = writer.write((10..15).map(state), true).into_iter();
        rx.receive(reset_stream.next().unwrap());
        assert_eq!(rx.pending(), 2);
        for chunk in reset_stream {
            rx.receive(chunk);
        }

        assert!(rx.take_reset());
        assert!(!rx.take_reset());
        assert_eq!(drain_all(&mut rx), vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_repeated_reset_chunk_in_same_stream_fires_once() {
        let mut rx = receiver();
        let chunk = SnapshotChunk {
            stream_id: 7,
            index: 0,
            last: false,
            reset: true,
            entries: vec![state(1)],
        };
        rx.receive(chunk.clone());
        rx.receive(SnapshotChunk {
            index: 1,
            ..chunk
        });
        assert!(rx.take_reset());
        assert!(!rx.take_reset());
        assert_eq!(rx.pending(), 2);
    }

    #[test]
    fn test_malformed_entries_are_rejected() {
        let mut rx = receiver();
        let mut bad = state(2);
        bad.health.current = f32::NAN;
        let queued = rx.receive(SnapshotChunk {
            stream_id: 0,
            index: 0,
            last: true,
            reset: false,
            entries: vec![state(1), bad],
        });
        assert_eq!(queued, 1);
        assert_eq!(rx.rejected(), 1);
    }

    #[test]
    fn test_drain_is_budgeted_per_frame() {
        let mut rx = SnapshotReceiver::new(512, 4, Duration::ZERO);
        let mut writer = SnapshotWriter::new(32);
        for chunk in writer.write((0..10).map(state), false) {
            rx.receive(chunk);
        }
        assert_eq!(drain_all(&mut rx).len(), 4);
        assert_eq!(rx.pending(), 6);
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let mut rx = SnapshotReceiver::new(3, 16, Duration::ZERO);
        let mut writer = SnapshotWriter::new(32);
        for chunk in writer.write((0..5).map(state), false) {
            rx.receive(chunk);
        }
        assert_eq!(rx.dropped(), 2);
        assert_eq!(drain_all(&mut rx), vec![2, 3, 4]);
    }

    #[test]
    fn test_broadcast_retries_sooner_without_peers() {
        let mut schedule = BroadcastSchedule::new(60.0, 5.0, 0.0);
        assert!(!schedule.due(59.0));
        assert!(schedule.due(60.0));
        schedule.record(60.0, 0);
        assert_eq!(schedule.next_at(), 65.0);
        schedule.record(65.0, 3);
        assert_eq!(schedule.next_at(), 125.0);
    }

    #[test]
    fn test_refresh_backs_off_while_disconnected() {
        let mut schedule = RefreshSchedule::new(30.0, RetryPolicy::default());
        assert!(schedule.due(0.0));
        schedule.record_failed(0.0);
        assert!(!schedule.due(0.4));
        assert!(schedule.due(0.5));
        schedule.record_sent(0.5);
        assert!(!schedule.due(30.0));
        assert!(schedule.due(30.5));
        schedule.request_now();
        assert!(schedule.due(31.0));
    }
}
