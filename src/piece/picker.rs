use super::{BitfieldTracker, PieceState, BLOCK_SIZE};
use crate::peer::{BlockInfo, PeerKey};
use crate::torrent::TorrentMeta;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// Tunables for request scheduling
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    /// Maximum outstanding requests per peer
    pub pipeline_depth: usize,
    /// Endgame starts when fewer than this many pieces remain...
    pub endgame_pieces: usize,
    /// ...or fewer than this fraction of all pieces
    pub endgame_fraction: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            pipeline_depth: 10,
            endgame_pieces: 4,
            endgame_fraction: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
enum BlockSlot {
    Missing,
    /// In flight, with every peer asked and when
    Requested(Vec<(PeerKey, Instant)>),
    Received,
}

#[derive(Debug)]
struct PieceSlot {
    length: u32,
    state: PieceState,
    blocks: Vec<BlockSlot>,
    /// Peers that fed this piece when it last failed verification
    suspects: HashSet<PeerKey>,
}

impl PieceSlot {
    fn refresh_state(&mut self) {
        if matches!(self.state, PieceState::Verifying | PieceState::Complete) {
            return;
        }
        self.state = if self.blocks.iter().all(|b| matches!(b, BlockSlot::Missing)) {
            PieceState::Missing
        } else {
            PieceState::Requested
        };
    }

    fn block(&self, piece_index: usize, block_index: usize) -> BlockInfo {
        let offset = block_index as u32 * BLOCK_SIZE;
        BlockInfo::new(piece_index as u32, offset, (self.length - offset).min(BLOCK_SIZE))
    }
}

/// Result of handing a received block to the selector
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// New data for a needed block. Redundant endgame requests to other
    /// peers must be cancelled.
    Accepted {
        cancels: Vec<(PeerKey, BlockInfo)>,
        piece_assembled: bool,
    },
    /// Already received, or the piece is verifying/complete
    Duplicate,
    /// Never requested from this peer
    Unsolicited,
    /// Not a block of this torrent
    Invalid,
}

/// Decides which block to request from which peer.
///
/// Rarest-first with an ascending-index tie-break, parallel block fetch
/// across peers and an endgame phase allowing duplicate requests. This is
/// the single record of who was asked for what.
pub struct PieceSelector {
    pieces: Vec<PieceSlot>,
    outstanding: HashMap<PeerKey, HashSet<BlockInfo>>,
    /// Requests taken back from a peer whose reply may still be in flight
    cancelled: HashMap<PeerKey, HashSet<BlockInfo>>,
    policy: SelectionPolicy,
    complete: usize,
}

impl PieceSelector {
    pub fn new(meta: &TorrentMeta, policy: SelectionPolicy) -> Self {
        let pieces = (0..meta.num_pieces() as u32)
            .map(|index| PieceSlot {
                length: meta.piece_len(index),
                state: PieceState::Missing,
                blocks: vec![BlockSlot::Missing; meta.block_count(index)],
                suspects: HashSet::new(),
            })
            .collect();

        Self {
            pieces,
            outstanding: HashMap::new(),
            cancelled: HashMap::new(),
            policy,
            complete: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn complete_count(&self) -> usize {
        self.complete
    }

    pub fn remaining(&self) -> usize {
        self.pieces.len() - self.complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete == self.pieces.len()
    }

    pub fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(|p| p.state)
    }

    pub fn in_endgame(&self) -> bool {
        let remaining = self.remaining();
        remaining > 0
            && (remaining < self.policy.endgame_pieces
                || (remaining as f64) < self.pieces.len() as f64 * self.policy.endgame_fraction)
    }

    pub fn outstanding(&self, peer: PeerKey) -> usize {
        self.outstanding.get(&peer).map_or(0, |set| set.len())
    }

    pub fn is_requested_from(&self, peer: PeerKey, block: &BlockInfo) -> bool {
        self.outstanding
            .get(&peer)
            .is_some_and(|set| set.contains(block))
    }

    /// Fill `peer`'s pipeline. The caller has already checked that the peer
    /// is active and not choking us. Every returned block is recorded as
    /// assigned before this returns.
    pub fn next_requests(
        &mut self,
        peer: PeerKey,
        tracker: &BitfieldTracker,
        now: Instant,
    ) -> Vec<BlockInfo> {
        let room = self
            .policy
            .pipeline_depth
            .saturating_sub(self.outstanding(peer));
        if room == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(u32, usize)> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                matches!(piece.state, PieceState::Missing | PieceState::Requested)
                    && tracker.peer_has(peer, *index)
                    && !Self::avoid(piece, peer, *index, tracker)
            })
            .map(|(index, _)| (tracker.availability(index), index))
            .collect();
        candidates.sort_unstable();

        let endgame = self.in_endgame();
        let mut picked = Vec::new();

        // First pass: untouched blocks. Second pass (endgame only): blocks
        // already in flight to someone else.
        for duplicate in [false, true] {
            if duplicate && !endgame {
                break;
            }
            for &(_, index) in &candidates {
                let piece = &mut self.pieces[index];
                for block_index in 0..piece.blocks.len() {
                    if picked.len() == room {
                        break;
                    }
                    let eligible = match &piece.blocks[block_index] {
                        BlockSlot::Missing => !duplicate,
                        BlockSlot::Requested(askers) => {
                            duplicate && !askers.iter().any(|(p, _)| *p == peer)
                        }
                        BlockSlot::Received => false,
                    };
                    if !eligible {
                        continue;
                    }

                    match &mut piece.blocks[block_index] {
                        BlockSlot::Requested(askers) => askers.push((peer, now)),
                        slot => *slot = BlockSlot::Requested(vec![(peer, now)]),
                    }

                    picked.push(piece.block(index, block_index));
                }
                piece.refresh_state();
            }
        }

        if !picked.is_empty() {
            debug!(
                "Assigned {} blocks to peer {} (endgame: {})",
                picked.len(),
                peer,
                endgame
            );
            self.outstanding
                .entry(peer)
                .or_default()
                .extend(picked.iter().copied());
        }
        picked
    }

    /// A peer that fed a corrupt copy of this piece is passed over while any
    /// other holder exists.
    fn avoid(piece: &PieceSlot, peer: PeerKey, index: usize, tracker: &BitfieldTracker) -> bool {
        piece.suspects.contains(&peer)
            && tracker.holders(index).any(|p| !piece.suspects.contains(&p))
    }

    /// Record a block that arrived from `peer`. Only blocks requested from
    /// that peer (or cancelled after being requested) are accepted.
    pub fn block_received(&mut self, peer: PeerKey, block: BlockInfo) -> Delivery {
        let Some(block_index) = self.block_index(&block) else {
            return Delivery::Invalid;
        };
        let requested = self
            .outstanding
            .get_mut(&peer)
            .is_some_and(|set| set.remove(&block));
        let cancelled = self
            .cancelled
            .get_mut(&peer)
            .is_some_and(|set| set.remove(&block));
        if !requested && !cancelled {
            return Delivery::Unsolicited;
        }

        let piece = &mut self.pieces[block.piece_index as usize];
        if matches!(piece.state, PieceState::Verifying | PieceState::Complete) {
            return Delivery::Duplicate;
        }

        let askers = match std::mem::replace(&mut piece.blocks[block_index], BlockSlot::Received) {
            BlockSlot::Received => return Delivery::Duplicate,
            // Late reply to a cancelled request nobody else picked up
            BlockSlot::Missing => Vec::new(),
            BlockSlot::Requested(askers) => askers,
        };

        let mut cancels = Vec::new();
        for (asker, _) in askers {
            if asker == peer {
                continue;
            }
            if let Some(set) = self.outstanding.get_mut(&asker) {
                set.remove(&block);
            }
            self.cancelled.entry(asker).or_default().insert(block);
            cancels.push((asker, block));
        }

        let piece_assembled = piece
            .blocks
            .iter()
            .all(|b| matches!(b, BlockSlot::Received));
        if piece_assembled {
            piece.state = PieceState::Verifying;
        } else {
            piece.refresh_state();
        }

        Delivery::Accepted {
            cancels,
            piece_assembled,
        }
    }

    pub fn piece_verified(&mut self, index: usize) {
        if let Some(piece) = self.pieces.get_mut(index) {
            if piece.state != PieceState::Complete {
                piece.state = PieceState::Complete;
                piece.blocks.fill(BlockSlot::Received);
                piece.suspects.clear();
                self.complete += 1;
            }
        }
        for set in self.cancelled.values_mut() {
            set.retain(|b| b.piece_index as usize != index);
        }
    }

    /// Hash mismatch: discard every block and remember who supplied them.
    pub fn piece_failed(&mut self, index: usize, contributors: &[PeerKey]) {
        if let Some(piece) = self.pieces.get_mut(index) {
            if piece.state == PieceState::Complete {
                return;
            }
            piece.blocks.fill(BlockSlot::Missing);
            piece.state = PieceState::Missing;
            piece.suspects.extend(contributors.iter().copied());
        }
    }

    /// Take back everything assigned to `peer` so other peers can be asked.
    /// Replies already in flight are still accepted.
    pub fn release_peer(&mut self, peer: PeerKey) -> Vec<BlockInfo> {
        let Some(blocks) = self.outstanding.remove(&peer) else {
            return Vec::new();
        };
        let released: Vec<BlockInfo> = blocks.into_iter().collect();
        for block in &released {
            self.unassign(peer, block);
        }
        self.cancelled
            .entry(peer)
            .or_default()
            .extend(released.iter().copied());
        released
    }

    /// Forget a disconnected peer entirely
    pub fn remove_peer(&mut self, peer: PeerKey) -> Vec<BlockInfo> {
        let released = self.release_peer(peer);
        self.cancelled.remove(&peer);
        released
    }

    /// Take back a single assignment, e.g. after a timeout.
    pub fn release_block(&mut self, peer: PeerKey, block: &BlockInfo) -> bool {
        let removed = self
            .outstanding
            .get_mut(&peer)
            .is_some_and(|set| set.remove(block));
        if removed {
            self.unassign(peer, block);
            self.cancelled.entry(peer).or_default().insert(*block);
        }
        removed
    }

    /// Release requests that have been in flight longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(PeerKey, BlockInfo)> {
        let mut stale = Vec::new();
        for (index, piece) in self.pieces.iter().enumerate() {
            for (block_index, slot) in piece.blocks.iter().enumerate() {
                if let BlockSlot::Requested(askers) = slot {
                    for (peer, at) in askers {
                        if now.saturating_duration_since(*at) >= timeout {
                            stale.push((*peer, piece.block(index, block_index)));
                        }
                    }
                }
            }
        }
        for (peer, block) in &stale {
            self.release_block(*peer, block);
        }
        stale
    }

    /// Mark a piece found complete on disk at startup.
    pub fn mark_complete(&mut self, index: usize) {
        self.piece_verified(index);
    }

    fn unassign(&mut self, peer: PeerKey, block: &BlockInfo) {
        let Some(block_index) = self.block_index(block) else {
            return;
        };
        let piece = &mut self.pieces[block.piece_index as usize];
        if let BlockSlot::Requested(askers) = &mut piece.blocks[block_index] {
            askers.retain(|(p, _)| *p != peer);
            if askers.is_empty() {
                piece.blocks[block_index] = BlockSlot::Missing;
            }
        }
        piece.refresh_state();
    }

    /// Block index for a well-formed block of this torrent
    fn block_index(&self, block: &BlockInfo) -> Option<usize> {
        let piece = self.pieces.get(block.piece_index as usize)?;
        if block.offset % BLOCK_SIZE != 0 {
            return None;
        }
        let block_index = (block.offset / BLOCK_SIZE) as usize;
        if block_index >= piece.blocks.len() || piece.block(block.piece_index as usize, block_index) != *block {
            return None;
        }
        Some(block_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::Bitfield;
    use crate::torrent::FileInfo;

    const A: PeerKey = PeerKey(1);
    const B: PeerKey = PeerKey(2);
    const C: PeerKey = PeerKey(3);

    fn meta(pieces: usize, piece_length: u64, last_len: u64) -> TorrentMeta {
        let total = piece_length * (pieces as u64 - 1) + last_len;
        let files = vec![FileInfo { path: vec!["data".into()], length: total }];
        TorrentMeta::new("data".into(), piece_length, files, vec![[0; 20]; pieces], [0; 20]).unwrap()
    }

    fn tracker_with(count: usize, peers: &[(PeerKey, &[usize])]) -> BitfieldTracker {
        let mut tracker = BitfieldTracker::new(count);
        for (peer, pieces) in peers {
            let mut bf = Bitfield::new(count);
            for &i in *pieces {
                bf.set(i);
            }
            tracker.set_bitfield(*peer, bf);
        }
        tracker
    }

    fn policy(depth: usize) -> SelectionPolicy {
        SelectionPolicy {
            pipeline_depth: depth,
            endgame_pieces: 0,
            endgame_fraction: 0.0,
        }
    }

    fn deliver_piece(selector: &mut PieceSelector, meta: &TorrentMeta, peer: PeerKey, index: u32) -> Delivery {
        let mut last = Delivery::Invalid;
        for b in 0..meta.block_count(index) as u32 {
            let offset = b * BLOCK_SIZE;
            last = selector.block_received(peer, BlockInfo::new(index, offset, meta.block_len(index, offset)));
        }
        last
    }

    #[test]
    fn test_rarest_first_with_index_tiebreak() {
        let meta = meta(4, BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        // piece 3 held by one peer, pieces 1 and 2 by two, piece 0 by three
        let tracker = tracker_with(4, &[(A, &[0, 1, 2, 3]), (B, &[0, 1, 2]), (C, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(1));

        let order: Vec<u32> = (0..4)
            .map(|_| {
                let picked = selector.next_requests(A, &tracker, Instant::now());
                let index = picked[0].piece_index;
                selector.block_received(A, picked[0]);
                index
            })
            .collect();
        assert_eq!(order, vec![3, 1, 2, 0]);
    }

    #[test]
    fn test_equal_rarity_prefers_lower_index() {
        let meta = meta(3, BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        let tracker = tracker_with(3, &[(A, &[2, 1])]);
        let mut selector = PieceSelector::new(&meta, policy(1));

        let picked = selector.next_requests(A, &tracker, Instant::now());
        assert_eq!(picked, vec![BlockInfo::new(1, 0, BLOCK_SIZE)]);
    }

    #[test]
    fn test_only_requests_pieces_the_peer_has() {
        let meta = meta(4, BLOCK_SIZE as u64 * 2, 1000);
        let tracker = tracker_with(4, &[(A, &[0, 1]), (B, &[2, 3])]);
        let mut selector = PieceSelector::new(&meta, policy(16));

        let from_a = selector.next_requests(A, &tracker, Instant::now());
        let from_b = selector.next_requests(B, &tracker, Instant::now());
        assert!(from_a.iter().all(|b| b.piece_index < 2));
        assert!(from_b.iter().all(|b| b.piece_index >= 2));
        assert_eq!(from_a.len(), 4);
        // piece 3 is short: one 1000-byte block
        assert_eq!(from_b.len(), 3);
        assert!(from_b.contains(&BlockInfo::new(3, 0, 1000)));
    }

    #[test]
    fn test_no_double_assignment_outside_endgame() {
        let meta = meta(20, BLOCK_SIZE as u64 * 4, BLOCK_SIZE as u64 * 4);
        let all: Vec<usize> = (0..20).collect();
        let tracker = tracker_with(20, &[(A, &all), (B, &all), (C, &all)]);
        let mut selector = PieceSelector::new(&meta, policy(7));

        let mut seen = HashSet::new();
        for _ in 0..3 {
            for peer in [A, B, C] {
                for block in selector.next_requests(peer, &tracker, Instant::now()) {
                    assert!(seen.insert(block), "block {:?} assigned twice", block);
                }
            }
        }
        assert_eq!(selector.outstanding(A), 7);
        // Full pipelines ask for nothing more
        assert!(selector.next_requests(A, &tracker, Instant::now()).is_empty());
    }

    #[test]
    fn test_parallel_fetch_splits_one_piece() {
        let meta = meta(1, BLOCK_SIZE as u64 * 4, BLOCK_SIZE as u64 * 4);
        let tracker = tracker_with(1, &[(A, &[0]), (B, &[0])]);
        let mut selector = PieceSelector::new(&meta, SelectionPolicy {
            pipeline_depth: 2,
            endgame_pieces: 0,
            endgame_fraction: 0.0,
        });

        let a = selector.next_requests(A, &tracker, Instant::now());
        let b = selector.next_requests(B, &tracker, Instant::now());
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|blk| !b.contains(blk)));
        assert_eq!(selector.piece_state(0), Some(PieceState::Requested));
    }

    #[test]
    fn test_piece_assembles_across_peers_in_any_order() {
        let meta = meta(1, BLOCK_SIZE as u64 * 2, BLOCK_SIZE as u64 * 2);
        let tracker = tracker_with(1, &[(A, &[0]), (B, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(1));

        let a = selector.next_requests(A, &tracker, Instant::now());
        let b = selector.next_requests(B, &tracker, Instant::now());

        let first = selector.block_received(B, b[0]);
        assert_eq!(first, Delivery::Accepted { cancels: vec![], piece_assembled: false });
        let second = selector.block_received(A, a[0]);
        assert_eq!(second, Delivery::Accepted { cancels: vec![], piece_assembled: true });
        assert_eq!(selector.piece_state(0), Some(PieceState::Verifying));
        assert_eq!(selector.outstanding(A), 0);
    }

    #[test]
    fn test_release_peer_returns_assignments() {
        let meta = meta(2, BLOCK_SIZE as u64 * 2, BLOCK_SIZE as u64 * 2);
        let tracker = tracker_with(2, &[(A, &[0, 1]), (B, &[0, 1])]);
        let mut selector = PieceSelector::new(&meta, policy(4));

        let assigned = selector.next_requests(A, &tracker, Instant::now());
        assert_eq!(assigned.len(), 4);
        assert!(selector.next_requests(B, &tracker, Instant::now()).is_empty());

        let mut released = selector.release_peer(A);
        released.sort_by_key(|b| (b.piece_index, b.offset));
        assert_eq!(released.len(), 4);
        assert_eq!(selector.outstanding(A), 0);
        assert_eq!(selector.piece_state(0), Some(PieceState::Missing));

        let reassigned = selector.next_requests(B, &tracker, Instant::now());
        assert_eq!(reassigned.len(), 4);
        assert!(selector.release_peer(A).is_empty());
    }

    #[test]
    fn test_failed_piece_becomes_selectable_again() {
        let meta = meta(2, BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        let tracker = tracker_with(2, &[(A, &[0]), (B, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(1));

        let picked = selector.next_requests(A, &tracker, Instant::now());
        assert_eq!(picked[0].piece_index, 0);
        assert!(matches!(
            selector.block_received(A, picked[0]),
            Delivery::Accepted { piece_assembled: true, .. }
        ));

        selector.piece_failed(0, &[A]);
        assert_eq!(selector.piece_state(0), Some(PieceState::Missing));

        // A supplied the bad copy and B also has it, so B is asked first
        assert!(selector.next_requests(A, &tracker, Instant::now()).is_empty());
        let retry = selector.next_requests(B, &tracker, Instant::now());
        assert_eq!(retry, vec![BlockInfo::new(0, 0, BLOCK_SIZE)]);
    }

    #[test]
    fn test_suspect_is_used_when_sole_holder() {
        let meta = meta(1, BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        let tracker = tracker_with(1, &[(A, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(1));

        let picked = selector.next_requests(A, &tracker, Instant::now());
        selector.block_received(A, picked[0]);
        selector.piece_failed(0, &[A]);

        assert_eq!(selector.next_requests(A, &tracker, Instant::now()).len(), 1);
    }

    #[test]
    fn test_endgame_duplicates_and_cancels() {
        let meta = meta(2, BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        let tracker = tracker_with(2, &[(A, &[0, 1]), (B, &[0, 1])]);
        let mut selector = PieceSelector::new(&meta, SelectionPolicy {
            pipeline_depth: 4,
            endgame_pieces: 4,
            endgame_fraction: 0.0,
        });
        assert!(selector.in_endgame());

        let a = selector.next_requests(A, &tracker, Instant::now());
        assert_eq!(a.len(), 2);
        let b = selector.next_requests(B, &tracker, Instant::now());
        assert_eq!(b.len(), 2, "endgame allows duplicate requests");

        // Never the same block twice to the same peer
        assert!(selector.next_requests(A, &tracker, Instant::now()).is_empty());

        let block = BlockInfo::new(1, 0, BLOCK_SIZE);
        assert_eq!(
            selector.block_received(A, block),
            Delivery::Accepted { cancels: vec![(B, block)], piece_assembled: true }
        );
        assert!(!selector.is_requested_from(B, &block));

        // B's late copy is dropped without another verification
        assert_eq!(selector.block_received(B, block), Delivery::Duplicate);
        selector.piece_verified(1);
        assert_eq!(selector.block_received(B, block), Delivery::Unsolicited);
        assert_eq!(selector.piece_state(1), Some(PieceState::Complete));
    }

    #[test]
    fn test_endgame_threshold() {
        let meta = meta(100, BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        let tracker = tracker_with(100, &[]);
        let mut selector = PieceSelector::new(&meta, SelectionPolicy::default());
        assert!(!selector.in_endgame());

        for index in 0..95 {
            selector.mark_complete(index);
        }
        // 5 remaining: not below 4 nor below 5% of 100
        assert!(!selector.in_endgame());
        selector.mark_complete(95);
        assert!(selector.in_endgame());
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_invalid_and_duplicate_blocks() {
        let meta = meta(1, BLOCK_SIZE as u64 * 2, BLOCK_SIZE as u64 * 2);
        let tracker = tracker_with(1, &[(A, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(2));

        assert_eq!(selector.block_received(A, BlockInfo::new(5, 0, BLOCK_SIZE)), Delivery::Invalid);
        assert_eq!(selector.block_received(A, BlockInfo::new(0, 3, BLOCK_SIZE)), Delivery::Invalid);
        assert_eq!(selector.block_received(A, BlockInfo::new(0, 0, 10)), Delivery::Invalid);

        assert_eq!(selector.next_requests(A, &tracker, Instant::now()).len(), 2);
        let block = BlockInfo::new(0, 0, BLOCK_SIZE);
        assert!(matches!(selector.block_received(A, block), Delivery::Accepted { .. }));
        // A second copy answers nothing
        assert_eq!(selector.block_received(A, block), Delivery::Unsolicited);
        assert!(matches!(
            deliver_piece(&mut selector, &meta, A, 0),
            Delivery::Accepted { piece_assembled: true, .. }
        ));
        assert_eq!(deliver_piece(&mut selector, &meta, A, 0), Delivery::Unsolicited);
        assert_eq!(selector.piece_state(0), Some(PieceState::Verifying));
    }

    #[test]
    fn test_unrequested_blocks_are_refused() {
        let meta = meta(64, BLOCK_SIZE as u64 * 256, BLOCK_SIZE as u64 * 256);
        let all: Vec<usize> = (0..64).collect();
        let tracker = tracker_with(64, &[(A, &all)]);
        let mut selector = PieceSelector::new(&meta, policy(4));
        let stranger = PeerKey(99);

        let accepted = (0..64)
            .filter(|&index| {
                let block = BlockInfo::new(index, 0, BLOCK_SIZE);
                matches!(selector.block_received(stranger, block), Delivery::Accepted { .. })
            })
            .count();
        assert_eq!(accepted, 0);
        assert!((0..64).all(|i| selector.piece_state(i) == Some(PieceState::Missing)));

        // A block requested from A is still refused from anyone else
        let assigned = selector.next_requests(A, &tracker, Instant::now());
        assert_eq!(selector.block_received(stranger, assigned[0]), Delivery::Unsolicited);
        assert!(matches!(selector.block_received(A, assigned[0]), Delivery::Accepted { .. }));
    }

    #[test]
    fn test_late_reply_after_release_is_accepted() {
        let meta = meta(1, BLOCK_SIZE as u64 * 2, BLOCK_SIZE as u64 * 2);
        let tracker = tracker_with(1, &[(A, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(2));

        let assigned = selector.next_requests(A, &tracker, Instant::now());
        assert_eq!(selector.release_peer(A).len(), 2);
        assert!(matches!(
            selector.block_received(A, assigned[0]),
            Delivery::Accepted { piece_assembled: false, .. }
        ));
        // Only once
        assert_eq!(selector.block_received(A, assigned[0]), Delivery::Unsolicited);

        // A removed peer's replies are no longer expected
        selector.remove_peer(A);
        assert_eq!(selector.block_received(A, assigned[1]), Delivery::Unsolicited);
    }

    #[test]
    fn test_expire_releases_stale_requests() {
        let meta = meta(1, BLOCK_SIZE as u64 * 2, BLOCK_SIZE as u64 * 2);
        let tracker = tracker_with(1, &[(A, &[0])]);
        let mut selector = PieceSelector::new(&meta, policy(2));

        let start = Instant::now();
        assert_eq!(selector.next_requests(A, &tracker, start).len(), 2);
        assert!(selector.expire(start + Duration::from_secs(5), Duration::from_secs(60)).is_empty());

        let stale = selector.expire(start + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(stale.len(), 2);
        assert_eq!(selector.outstanding(A), 0);
        assert_eq!(selector.piece_state(0), Some(PieceState::Missing));
    }
}
