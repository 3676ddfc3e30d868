use crate::peer::PeerKey;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Snapshot of one active peer as seen by the choke cycle
#[derive(Debug, Clone)]
pub struct ChokeCandidate {
    pub key: PeerKey,
    /// Bytes/s we receive from the peer
    pub download_rate: f64,
    /// Bytes/s we send to the peer
    pub upload_rate: f64,
    /// Peer is interested in us
    pub interested: bool,
    /// We are currently choking the peer
    pub am_choking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeDecision {
    Choke(PeerKey),
    Unchoke(PeerKey),
}

/// Tit-for-tat upload slot allocation.
///
/// Each cycle the `slots` fastest interested peers are unchoked, plus one
/// optimistic slot that rotates to a random choked peer every
/// `optimistic_every` cycles. Rates are ranked by what the peer gives us
/// while downloading and by what it takes from us while seeding.
#[derive(Debug)]
pub struct ChokeManager {
    slots: usize,
    optimistic_every: u64,
    cycle: u64,
    optimistic: Option<PeerKey>,
    /// Unchoked peers that were already uninterested at the previous cycle
    idle_unchoked: HashSet<PeerKey>,
}

impl ChokeManager {
    pub fn new(slots: usize, optimistic_every: u64) -> Self {
        Self {
            slots,
            optimistic_every: optimistic_every.max(1),
            cycle: 0,
            optimistic: None,
            idle_unchoked: HashSet::new(),
        }
    }

    pub fn optimistic(&self) -> Option<PeerKey> {
        self.optimistic
    }

    pub fn remove_peer(&mut self, key: PeerKey) {
        if self.optimistic == Some(key) {
            self.optimistic = None;
        }
        self.idle_unchoked.remove(&key);
    }

    /// Run one cycle and return the changes to apply. Peers whose state is
    /// already right are not mentioned.
    pub fn run_cycle<R: Rng>(
        &mut self,
        candidates: &[ChokeCandidate],
        seeding: bool,
        rng: &mut R,
    ) -> Vec<ChokeDecision> {
        self.cycle += 1;

        let rate = |c: &ChokeCandidate| if seeding { c.upload_rate } else { c.download_rate };
        let mut ranked: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.interested).collect();
        ranked.sort_by(|a, b| {
            rate(b)
                .partial_cmp(&rate(a))
                .unwrap_or(Ordering::Equal)
                .then(a.key.cmp(&b.key))
        });

        let mut unchoke: HashSet<PeerKey> =
            ranked.iter().take(self.slots).map(|c| c.key).collect();

        let still_valid = self.optimistic.map_or(false, |key| {
            candidates.iter().any(|c| c.key == key && c.interested) && !unchoke.contains(&key)
        });
        let rotate = (self.cycle - 1) % self.optimistic_every == 0;
        if rotate || !still_valid {
            let pool: Vec<PeerKey> = ranked
                .iter()
                .map(|c| c.key)
                .filter(|key| !unchoke.contains(key))
                .collect();
            let previous = self.optimistic;
            self.optimistic = pool.choose(rng).copied();
            if self.optimistic != previous {
                debug!("Optimistic unchoke moved to {:?}", self.optimistic);
            }
        }
        if let Some(key) = self.optimistic {
            unchoke.insert(key);
        }

        // One cycle of grace for unchoked peers that lost interest, while a slot is free
        let limit = self.slots + 1;
        let mut idle_now = HashSet::new();
        for c in candidates {
            if c.am_choking || c.interested || unchoke.contains(&c.key) {
                continue;
            }
            if !self.idle_unchoked.contains(&c.key) && unchoke.len() < limit {
                unchoke.insert(c.key);
                idle_now.insert(c.key);
            }
        }
        self.idle_unchoked = idle_now;

        candidates
            .iter()
            .filter_map(|c| match (c.am_choking, unchoke.contains(&c.key)) {
                (true, true) => Some(ChokeDecision::Unchoke(c.key)),
                (false, false) => Some(ChokeDecision::Choke(c.key)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(key: u64, download_rate: f64, interested: bool) -> ChokeCandidate {
        ChokeCandidate {
            key: PeerKey(key),
            download_rate,
            upload_rate: 0.0,
            interested,
            am_choking: true,
        }
    }

    fn apply(candidates: &mut [ChokeCandidate], decisions: &[ChokeDecision]) {
        for decision in decisions {
            match *decision {
                ChokeDecision::Choke(key) => {
                    if let Some(c) = candidates.iter_mut().find(|c| c.key == key) {
                        c.am_choking = true;
                    }
                }
                ChokeDecision::Unchoke(key) => {
                    if let Some(c) = candidates.iter_mut().find(|c| c.key == key) {
                        c.am_choking = false;
                    }
                }
            }
        }
    }

    fn unchoked(candidates: &[ChokeCandidate]) -> Vec<PeerKey> {
        candidates.iter().filter(|c| !c.am_choking).map(|c| c.key).collect()
    }

    #[test]
    fn test_fastest_peers_are_unchoked() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut manager = ChokeManager::new(4, 3);
        let mut peers: Vec<_> = (0..8).map(|i| candidate(i, (i * 100) as f64, true)).collect();

        let decisions = manager.run_cycle(&peers, false, &mut rng);
        apply(&mut peers, &decisions);

        let open = unchoked(&peers);
        for key in 4..8 {
            assert!(open.contains(&PeerKey(key)));
        }
        assert_eq!(open.len(), 5);
        let optimistic = manager.optimistic().unwrap();
        assert!(optimistic.0 < 4);
    }

    #[test]
    fn test_never_more_than_slots_plus_one() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut manager = ChokeManager::new(4, 3);
        let mut peers: Vec<_> = (0..12).map(|i| candidate(i, 0.0, true)).collect();

        for round in 0..30u64 {
            for (i, peer) in peers.iter_mut().enumerate() {
                peer.download_rate = ((i as u64 * 37 + round * 11) % 97) as f64;
                peer.interested = (i as u64 + round) % 5 != 0;
            }
            let decisions = manager.run_cycle(&peers, false, &mut rng);
            apply(&mut peers, &decisions);
            assert!(unchoked(&peers).len() <= 5, "round {}", round);
        }
    }

    #[test]
    fn test_seeding_ranks_by_upload_rate() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut manager = ChokeManager::new(1, 3);
        let mut peers = vec![candidate(1, 900.0, true), candidate(2, 0.0, true), candidate(3, 0.0, true)];
        peers[1].upload_rate = 500.0;

        let decisions = manager.run_cycle(&peers, true, &mut rng);
        assert!(decisions.contains(&ChokeDecision::Unchoke(PeerKey(2))));
        assert_ne!(manager.optimistic(), Some(PeerKey(2)));
    }

    #[test]
    fn test_optimistic_rotates_every_third_cycle() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut manager = ChokeManager::new(1, 3);
        let mut peers: Vec<_> = (0..10).map(|i| candidate(i, if i == 0 { 1000.0 } else { 0.0 }, true)).collect();

        let mut picks = Vec::new();
        for _ in 0..3 {
            let decisions = manager.run_cycle(&peers, false, &mut rng);
            apply(&mut peers, &decisions);
            picks.push(manager.optimistic());
        }
        assert!(picks[0].is_some());
        assert_eq!(picks[0], picks[1]);
        assert_eq!(picks[1], picks[2]);
        assert_ne!(picks[0], Some(PeerKey(0)));
    }

    #[test]
    fn test_uninterested_peer_choked_after_grace_cycle() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut manager = ChokeManager::new(2, 3);
        let mut peers = vec![candidate(1, 100.0, true), candidate(2, 50.0, true)];

        let decisions = manager.run_cycle(&peers, false, &mut rng);
        apply(&mut peers, &decisions);
        assert_eq!(unchoked(&peers).len(), 2);

        // Peer 2 loses interest: kept for one cycle, then choked
        peers[1].interested = false;
        let decisions = manager.run_cycle(&peers, false, &mut rng);
        assert!(decisions.is_empty());
        let decisions = manager.run_cycle(&peers, false, &mut rng);
        assert_eq!(decisions, vec![ChokeDecision::Choke(PeerKey(2))]);
    }

    #[test]
    fn test_removed_optimistic_is_replaced() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut manager = ChokeManager::new(0, 3);
        let mut peers = vec![candidate(1, 0.0, true), candidate(2, 0.0, true)];

        manager.run_cycle(&peers, false, &mut rng);
        let first = manager.optimistic().unwrap();
        manager.remove_peer(first);
        peers.retain(|c| c.key != first);

        let decisions = manager.run_cycle(&peers, false, &mut rng);
        let other = peers[0].key;
        assert_eq!(manager.optimistic(), Some(other));
        assert_eq!(decisions, vec![ChokeDecision::Unchoke(other)]);
    }
}
