use super::Bitfield;
use crate::peer::PeerKey;
use std::collections::HashMap;

/// Swarm-wide view of who has what.
///
/// Per-peer bitfields are the only input; `availability[i]` always equals the
/// number of tracked peers whose bitfield marks piece `i`.
pub struct BitfieldTracker {
    piece_count: usize,
    availability: Vec<u32>,
    peers: HashMap<PeerKey, Bitfield>,
    local: Bitfield,
}

impl BitfieldTracker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_count,
            availability: vec![0; piece_count],
            peers: HashMap::new(),
            local: Bitfield::new(piece_count),
        }
    }

    pub fn add_peer(&mut self, peer: PeerKey) {
        self.peers
            .entry(peer)
            .or_insert_with(|| Bitfield::new(self.piece_count));
    }

    /// Replace a peer's bitfield wholesale
    pub fn set_bitfield(&mut self, peer: PeerKey, bitfield: Bitfield) {
        if let Some(old) = self.peers.remove(&peer) {
            for index in old.iter_set() {
                self.availability[index] -= 1;
            }
        }
        for index in bitfield.iter_set() {
            self.availability[index] += 1;
        }
        self.peers.insert(peer, bitfield);
    }

    /// Record a "have". Returns true if this was new information.
    pub fn record_have(&mut self, peer: PeerKey, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let bitfield = self
            .peers
            .entry(peer)
            .or_insert_with(|| Bitfield::new(self.piece_count));
        if bitfield.set(index) {
            self.availability[index] += 1;
            true
        } else {
            false
        }
    }

    /// Drop a peer's contribution entirely
    pub fn remove_peer(&mut self, peer: PeerKey) -> Option<Bitfield> {
        let bitfield = self.peers.remove(&peer)?;
        for index in bitfield.iter_set() {
            self.availability[index] -= 1;
        }
        Some(bitfield)
    }

    pub fn availability(&self, index: usize) -> u32 {
        self.availability.get(index).copied().unwrap_or(0)
    }

    pub fn holders(&self, index: usize) -> impl Iterator<Item = PeerKey> + '_ {
        self.peers
            .iter()
            .filter(move |(_, bf)| bf.has(index))
            .map(|(key, _)| *key)
    }

    pub fn peer_has(&self, peer: PeerKey, index: usize) -> bool {
        self.peers.get(&peer).is_some_and(|bf| bf.has(index))
    }

    /// Whether the peer has at least one piece we are missing
    pub fn is_interesting(&self, peer: PeerKey) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|bf| bf.iter_set().any(|i| !self.local.has(i)))
    }

    pub fn mark_local(&mut self, index: usize) {
        self.local.set(index);
    }

    pub fn local(&self) -> &Bitfield {
        &self.local
    }

    pub fn local_has(&self, index: usize) -> bool {
        self.local.has(index)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Fraction of the torrent a peer has announced, 0.0 for unknown peers
    pub fn peer_completion(&self, peer: PeerKey) -> f64 {
        match self.peers.get(&peer) {
            Some(bf) if self.piece_count > 0 => bf.count() as f64 / self.piece_count as f64,
            _ => 0.0,
        }
    }
}
