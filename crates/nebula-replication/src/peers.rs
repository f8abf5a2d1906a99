//! Generational arena of connected peers.
//!
//! Slots are reused after a disconnect, but every reuse bumps the slot's
//! generation, so a [`PeerId`] held by stale bookkeeping never matches the
//! peer that reconnected into the same slot.

use glam::Vec3;
use nebula_net::PeerId;

use crate::collab::PeerDirectory;

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    position: Option<Vec3>,
    occupied: bool,
}

/// Connected peers with their last known player positions.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    connected: usize,
}

impl PeerTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new peer.
    pub fn connect(&mut self) -> PeerId {
        self.connected += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.occupied = true;
            slot.position = None;
            return PeerId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            position: None,
            occupied: true,
        });
        PeerId {
            index,
            generation: 0,
        }
    }

    /// Remove a peer. Returns `false` for unknown or stale ids.
    pub fn disconnect(&mut self, peer: PeerId) -> bool {
        let Some(slot) = self.live_slot_mut(peer) else {
            return false;
        };
        slot.occupied = false;
        slot.position = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(peer.index);
        self.connected -= 1;
        true
    }

    /// `true` if `peer` is connected under this exact generation.
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.live_slot(peer).is_some()
    }

    /// Update a peer's player position. Returns `false` for stale ids.
    pub fn set_position(&mut self, peer: PeerId, position: Vec3) -> bool {
        match self.live_slot_mut(peer) {
            Some(slot) => {
                slot.position = Some(position);
                true
            }
            None => false,
        }
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.connected
    }

    /// `true` if nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.connected == 0
    }

    /// Connected peers in slot order.
    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.occupied)
            .map(|(index, slot)| PeerId {
                index: index as u32,
                generation: slot.generation,
            })
    }

    fn live_slot(&self, peer: PeerId) -> Option<&Slot> {
        self.slots
            .get(peer.index as usize)
            .filter(|slot| slot.occupied && slot.generation == peer.generation)
    }

    fn live_slot_mut(&mut self, peer: PeerId) -> Option<&mut Slot> {
        self.slots
            .get_mut(peer.index as usize)
            .filter(|slot| slot.occupied && slot.generation == peer.generation)
    }
}

impl PeerDirectory for PeerTable {
    fn connected_peers(&self) -> Vec<PeerId> {
        self.iter().collect()
    }

    fn peer_position(&self, peer: PeerId) -> Option<Vec3> {
        self.live_slot(peer).and_then(|slot| slot.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_assigns_distinct_ids() {
        let mut table = PeerTable::new();
        let a = table.connect();
        let b = table.connect();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.connected_peers(), vec![a, b]);
    }

    #[test]
    fn test_reconnect_gets_new_generation() {
        let mut table = PeerTable::new();
        let old = table.connect();
        table.set_position(old, Vec3::ONE);
        assert!(table.disconnect(old));
        let new = table.connect();

        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(!table.is_connected(old));
        assert!(table.is_connected(new));
        assert_eq!(table.peer_position(new), None);
        assert!(!table.set_position(old, Vec3::ZERO));
    }

    #[test]
    fn test_double_disconnect_is_rejected() {
        let mut table = PeerTable::new();
        let peer = table.connect();
        assert!(table.disconnect(peer));
        assert!(!table.disconnect(peer));
        assert!(table.is_empty());
    }

    #[test]
    fn test_position_lookup() {
        let mut table = PeerTable::new();
        let peer = table.connect();
        assert_eq!(table.peer_position(peer), None);
        table.set_position(peer, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(table.peer_position(peer), Some(Vec3::new(1.0, 2.0, 3.0)));
    }
}
