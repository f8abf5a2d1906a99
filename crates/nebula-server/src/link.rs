//! Simulated lossy datagram links over crossbeam channels.
//!
//! Each send is stamped with a delivery time drawn from the link profile.
//! Reliable tiers are never lost (a lost roll costs one extra latency as a
//! retransmit); ordered tiers never overtake earlier sends on the same
//! channel. Sequenced sends carry a per-channel sequence number and the
//! receiver drops any that arrive after a newer one. The receiving side
//! holds datagrams until their delivery time.

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use nebula_net::{Delivery, DeliveryMethod, PeerId, SendError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Number of delivery channels (one per tier).
const CHANNELS: usize = 5;

/// Latency, jitter and loss for one direction of a link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProfile {
    /// One-way latency in seconds.
    pub latency: f64,
    /// Uniform jitter added on top of the latency, in seconds.
    pub jitter: f64,
    /// Probability a datagram is lost in transit.
    pub loss: f64,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            latency: 0.06,
            jitter: 0.02,
            loss: 0.02,
        }
    }
}

/// One payload in flight.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The client end of the conversation.
    pub peer: PeerId,
    /// Simulation time at which the payload arrives.
    pub deliver_at: f64,
    /// Channel and sequence number for latest-wins sends.
    pub sequence: Option<(u8, u64)>,
    /// Encoded message.
    pub payload: Vec<u8>,
}

/// Counts for one link direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Datagrams handed to the channel.
    pub sent: u64,
    /// Unreliable datagrams lost.
    pub lost: u64,
    /// Reliable datagrams that needed a retransmit.
    pub retransmitted: u64,
}

/// Sending half of a simulated link.
#[derive(Debug)]
pub struct LinkSender {
    peer: PeerId,
    tx: Sender<Datagram>,
    profile: LinkProfile,
    rng: ChaCha8Rng,
    ordered_until: [f64; CHANNELS],
    next_sequence: [u64; CHANNELS],
    stats: LinkStats,
}

impl LinkSender {
    /// Sender for `peer`'s conversation feeding `tx`.
    pub fn new(peer: PeerId, tx: Sender<Datagram>, profile: LinkProfile, seed: u64) -> Self {
        Self {
            peer,
            tx,
            profile,
            rng: ChaCha8Rng::seed_from_u64(seed),
            ordered_until: [f64::NEG_INFINITY; CHANNELS],
            next_sequence: [0; CHANNELS],
            stats: LinkStats::default(),
        }
    }

    /// Counts so far.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Put `payload` on the wire at simulation time `now`.
    pub fn send(&mut self, now: f64, delivery: Delivery, payload: &[u8]) -> Result<(), SendError> {
        let mut deliver_at = now + self.profile.latency;
        if self.profile.jitter > 0.0 {
            deliver_at += self.rng.random_range(0.0..self.profile.jitter);
        }

        let lost = self.profile.loss > 0.0 && self.rng.random_bool(self.profile.loss.min(1.0));
        if lost {
            if !delivery.tier.is_reliable() {
                self.stats.lost += 1;
                return Ok(());
            }
            deliver_at += self.profile.latency * 2.0;
            self.stats.retransmitted += 1;
        }

        let channel = (delivery.channel as usize).min(CHANNELS - 1);
        let mut sequence = None;
        match delivery.method {
            DeliveryMethod::ReliableOrdered | DeliveryMethod::ReliableSequenced => {
                deliver_at = deliver_at.max(self.ordered_until[channel]);
                self.ordered_until[channel] = deliver_at;
            }
            DeliveryMethod::Sequenced => {
                sequence = Some((channel as u8, self.next_sequence[channel]));
                self.next_sequence[channel] += 1;
            }
            DeliveryMethod::ReliableUnordered | DeliveryMethod::Unreliable => {}
        }

        self.tx
            .send(Datagram {
                peer: self.peer,
                deliver_at,
                sequence,
                payload: payload.to_vec(),
            })
            .map_err(|_| SendError::Rejected("link closed".to_string()))?;
        self.stats.sent += 1;
        Ok(())
    }
}

/// Receiving half: holds datagrams until they are due.
#[derive(Debug)]
pub struct LinkReceiver {
    rx: Receiver<Datagram>,
    in_flight: Vec<Datagram>,
    newest: HashMap<(PeerId, u8), u64>,
    superseded: u64,
}

impl LinkReceiver {
    /// Receiver reading `rx`.
    pub fn new(rx: Receiver<Datagram>) -> Self {
        Self {
            rx,
            in_flight: Vec::new(),
            newest: HashMap::new(),
            superseded: 0,
        }
    }

    /// Datagrams due at `now`, earliest first. Ties keep send order.
    /// Sequenced datagrams older than one already delivered are dropped.
    pub fn poll(&mut self, now: f64) -> Vec<Datagram> {
        loop {
            match self.rx.try_recv() {
                Ok(datagram) => self.in_flight.push(datagram),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        let (mut due, waiting): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|d| d.deliver_at <= now);
        self.in_flight = waiting;
        due.sort_by(|a, b| a.deliver_at.total_cmp(&b.deliver_at));
        due.retain(|datagram| {
            let Some((channel, seq)) = datagram.sequence else {
                return true;
            };
            let newest = self.newest.entry((datagram.peer, channel)).or_insert(seq);
            if seq < *newest {
                self.superseded += 1;
                return false;
            }
            *newest = seq;
            true
        });
        due
    }

    /// Sequenced datagrams dropped for arriving after a newer one.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    /// Datagrams still in transit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len() + self.rx.len()
    }
}

/// A fresh channel pair.
pub fn channel() -> (Sender<Datagram>, LinkReceiver) {
    let (tx, rx) = unbounded();
    (tx, LinkReceiver::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_net::DeliveryTier;

    const PEER: PeerId = PeerId {
        index: 0,
        generation: 0,
    };

    fn profile(loss: f64) -> LinkProfile {
        LinkProfile {
            latency: 0.05,
            jitter: 0.03,
            loss,
        }
    }

    #[test]
    fn test_datagrams_wait_for_latency() {
        let (tx, mut rx) = channel();
        let mut link = LinkSender::new(PEER, tx, profile(0.0), 1);
        link.send(0.0, DeliveryTier::Frequent.delivery(), b"a").unwrap();

        assert!(rx.poll(0.04).is_empty());
        assert_eq!(rx.in_flight(), 1);
        assert_eq!(rx.poll(0.09).len(), 1);
        assert_eq!(rx.in_flight(), 0);
    }

    #[test]
    fn test_reliable_tiers_are_never_lost() {
        let (tx, mut rx) = channel();
        let mut link = LinkSender::new(PEER, tx, profile(1.0), 2);
        for _ in 0..20 {
            link.send(0.0, DeliveryTier::Normal.delivery(), b"r").unwrap();
            link.send(0.0, DeliveryTier::Frequent.delivery(), b"u").unwrap();
        }

        let arrived = rx.poll(10.0);
        assert_eq!(arrived.len(), 20);
        assert!(arrived.iter().all(|d| d.payload == b"r"));
        assert_eq!(link.stats().lost, 20);
        assert_eq!(link.stats().retransmitted, 20);
    }

    #[test]
    fn test_ordered_channel_never_reorders() {
        let (tx, mut rx) = channel();
        let mut link = LinkSender::new(PEER, tx, profile(0.3), 3);
        for i in 0..50u8 {
            link.send(f64::from(i) * 0.001, DeliveryTier::Critical.delivery(), &[i])
                .unwrap();
        }

        let order: Vec<u8> = rx.poll(10.0).iter().map(|d| d.payload[0]).collect();
        assert_eq!(order, (0..50).collect::<Vec<u8>>());
    }

    #[test]
    fn test_sequenced_channel_drops_late_arrivals() {
        let (tx, mut rx) = channel();
        let jittery = LinkProfile {
            latency: 0.05,
            jitter: 0.2,
            loss: 0.0,
        };
        let mut link = LinkSender::new(PEER, tx, jittery, 5);
        for i in 0..50u8 {
            link.send(f64::from(i) * 0.01, DeliveryTier::Voice.delivery(), &[i])
                .unwrap();
        }

        let mut arrived = Vec::new();
        for step in 0..200 {
            arrived.extend(rx.poll(f64::from(step) * 0.01).into_iter().map(|d| d.payload[0]));
        }
        assert!(arrived.windows(2).all(|w| w[0] < w[1]), "{arrived:?}");
        assert_eq!(arrived.len() as u64 + rx.superseded(), 50);
        assert!(rx.superseded() > 0);
    }

    #[test]
    fn test_closed_link_is_rejected() {
        let (tx, rx) = channel();
        drop(rx);
        let mut link = LinkSender::new(PEER, tx, profile(0.0), 4);
        assert!(link.send(0.0, DeliveryTier::Critical.delivery(), b"x").is_err());
    }
}
