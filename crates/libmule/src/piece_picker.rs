use std::{cmp::Reverse, collections::BTreeMap};

use itertools::Itertools;
use libmule_core::lengths::{Lengths, PieceBlock, ValidPieceIndex};
use serde::Serialize;
use tracing::trace;

use crate::type_aliases::{BF, PeerHandle};

pub const PRIORITY_FILTERED: u8 = 0;
pub const DEFAULT_PRIORITY: u8 = 4;
pub const MAX_PRIORITY: u8 = 7;

/// How fast a peer is relative to the transfer. Pieces remember the class
/// of the peer that started them, so peers of similar speed end up working
/// on the same pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedClass {
    #[default]
    Slow,
    Medium,
    Fast,
}

/// Bit mask of picking strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PickOptions(u8);

impl PickOptions {
    pub const NONE: Self = Self(0);
    /// Lowest piece index first.
    pub const SEQUENTIAL: Self = Self(1);
    /// Least available piece first.
    pub const RAREST_FIRST: Self = Self(1 << 1);
    /// Avoid joining pieces started by peers of a different speed class.
    pub const SPEED_AFFINITY: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PickOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    #[default]
    None,
    Requested,
    Writing,
    Finished,
}

#[derive(Debug, Default, Clone)]
struct BlockEntry {
    state: BlockState,
    // Peers this block is requested from, only while Requested.
    peers: Vec<PeerHandle>,
}

#[derive(Debug)]
struct DownloadingPiece {
    speed: SpeedClass,
    blocks: Vec<BlockEntry>,
}

impl DownloadingPiece {
    fn new(num_blocks: u32, speed: SpeedClass) -> Self {
        Self {
            speed,
            blocks: vec![BlockEntry::default(); num_blocks as usize],
        }
    }

    fn is_untouched(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::None)
    }

    fn all_finished(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Finished)
    }
}

/// Per-transfer bookkeeping of which pieces we have, which blocks are in
/// flight and from whom, and how available each piece is among peers.
pub struct PiecePicker {
    lengths: Lengths,
    have: BF,
    num_have: u32,
    availability: Vec<u32>,
    priority: Vec<u8>,
    // Pieces with at least one block not in the None state.
    downloading: BTreeMap<u32, DownloadingPiece>,
}

impl std::fmt::Debug for PiecePicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiecePicker")
            .field("num_have", &self.num_have)
            .field("total_pieces", &self.lengths.total_pieces())
            .field("downloading", &self.downloading.len())
            .finish()
    }
}

impl PiecePicker {
    pub fn new(lengths: Lengths) -> Self {
        let have = BF::repeat(false, lengths.total_pieces() as usize);
        Self::with_have(lengths, have)
    }

    pub fn with_have(lengths: Lengths, mut have: BF) -> Self {
        let total = lengths.total_pieces() as usize;
        have.resize(total, false);
        let num_have = have.count_ones() as u32;
        Self {
            lengths,
            have,
            num_have,
            availability: vec![0; total],
            priority: vec![DEFAULT_PRIORITY; total],
            downloading: BTreeMap::new(),
        }
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn have_bitmap(&self) -> &BF {
        &self.have
    }

    pub fn have_piece(&self, piece: u32) -> bool {
        self.have.get(piece as usize).map(|b| *b).unwrap_or(false)
    }

    pub fn num_have(&self) -> u32 {
        self.num_have
    }

    pub fn num_pieces(&self) -> u32 {
        self.lengths.total_pieces()
    }

    pub fn num_wanted(&self) -> u32 {
        self.priority.iter().filter(|p| **p > PRIORITY_FILTERED).count() as u32
    }

    pub fn have_bytes(&self) -> u64 {
        self.have
            .iter_ones()
            .filter_map(|p| self.lengths.validate_piece_index(p as u32))
            .map(|p| self.lengths.piece_length(p) as u64)
            .sum()
    }

    /// All wanted pieces are verified.
    pub fn is_finished(&self) -> bool {
        self.have
            .iter()
            .zip(self.priority.iter())
            .all(|(have, prio)| *have || *prio == PRIORITY_FILTERED)
    }

    /// Every piece is verified.
    pub fn is_seed(&self) -> bool {
        self.num_have == self.lengths.total_pieces()
    }

    fn is_wanted(&self, piece: u32) -> bool {
        !self.have_piece(piece)
            && self
                .priority
                .get(piece as usize)
                .is_some_and(|p| *p > PRIORITY_FILTERED)
    }

    pub fn piece_priority(&self, piece: u32) -> Option<u8> {
        self.priority.get(piece as usize).copied()
    }

    /// Returns true if the priority changed.
    pub fn set_piece_priority(&mut self, piece: u32, priority: u8) -> bool {
        let priority = priority.min(MAX_PRIORITY);
        match self.priority.get_mut(piece as usize) {
            Some(p) if *p != priority => {
                *p = priority;
                true
            }
            _ => false,
        }
    }

    pub fn availability(&self) -> &[u32] {
        &self.availability
    }

    pub fn inc_refcount(&mut self, piece: u32) {
        if let Some(a) = self.availability.get_mut(piece as usize) {
            *a += 1;
        }
    }

    pub fn dec_refcount(&mut self, piece: u32) {
        if let Some(a) = self.availability.get_mut(piece as usize) {
            *a = a.saturating_sub(1);
        }
    }

    pub fn inc_refcount_bitmap(&mut self, bitmap: &BF) {
        for p in bitmap.iter_ones() {
            self.inc_refcount(p as u32);
        }
    }

    pub fn dec_refcount_bitmap(&mut self, bitmap: &BF) {
        for p in bitmap.iter_ones() {
            self.dec_refcount(p as u32);
        }
    }

    fn blocks_in_piece(&self, piece: u32) -> Option<u32> {
        let idx = self.lengths.validate_piece_index(piece)?;
        Some(self.lengths.blocks_in_piece(idx))
    }

    fn entry(&self, block: PieceBlock) -> Option<&BlockEntry> {
        self.downloading
            .get(&block.piece_index)?
            .blocks
            .get(block.block_index as usize)
    }

    pub fn block_state(&self, block: PieceBlock) -> BlockState {
        if self.have_piece(block.piece_index) {
            return BlockState::Finished;
        }
        self.entry(block).map(|e| e.state).unwrap_or_default()
    }

    pub fn is_block_requested(&self, block: PieceBlock) -> bool {
        self.block_state(block) == BlockState::Requested
    }

    pub fn is_block_downloaded(&self, block: PieceBlock) -> bool {
        matches!(
            self.block_state(block),
            BlockState::Writing | BlockState::Finished
        )
    }

    pub fn is_block_finished(&self, block: PieceBlock) -> bool {
        self.block_state(block) == BlockState::Finished
    }

    pub fn num_peers(&self, block: PieceBlock) -> usize {
        self.entry(block)
            .filter(|e| e.state == BlockState::Requested)
            .map(|e| e.peers.len())
            .unwrap_or(0)
    }

    pub fn downloaders(&self, block: PieceBlock) -> &[PeerHandle] {
        self.entry(block).map(|e| e.peers.as_slice()).unwrap_or(&[])
    }

    pub fn piece_speed(&self, piece: u32) -> Option<SpeedClass> {
        self.downloading.get(&piece).map(|d| d.speed)
    }

    pub fn is_downloading(&self, piece: u32) -> bool {
        self.downloading.contains_key(&piece)
    }

    pub fn downloading_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.downloading.keys().copied()
    }

    /// Every block of the piece is written to disk and it can be hashed.
    pub fn is_piece_finished(&self, piece: u32) -> bool {
        self.downloading
            .get(&piece)
            .is_some_and(|d| d.all_finished())
    }

    /// Marks `block` as requested from `peer`. Fails if the block is already
    /// past the request stage or already requested from this peer.
    pub fn mark_as_downloading(&mut self, block: PieceBlock, peer: PeerHandle, speed: SpeedClass) -> bool {
        if self.have_piece(block.piece_index) {
            return false;
        }
        let Some(num_blocks) = self.blocks_in_piece(block.piece_index) else {
            return false;
        };
        if block.block_index >= num_blocks {
            return false;
        }
        let dp = self
            .downloading
            .entry(block.piece_index)
            .or_insert_with(|| DownloadingPiece::new(num_blocks, speed));
        let e = &mut dp.blocks[block.block_index as usize];
        match e.state {
            BlockState::Writing | BlockState::Finished => return false,
            BlockState::Requested if e.peers.contains(&peer) => return false,
            BlockState::None | BlockState::Requested => {}
        }
        e.peers.push(peer);
        e.state = BlockState::Requested;
        true
    }

    fn entry_mut_or_insert(&mut self, block: PieceBlock) -> Option<&mut BlockEntry> {
        if self.have_piece(block.piece_index) {
            return None;
        }
        let num_blocks = self.blocks_in_piece(block.piece_index)?;
        let dp = self
            .downloading
            .entry(block.piece_index)
            .or_insert_with(|| DownloadingPiece::new(num_blocks, SpeedClass::default()));
        dp.blocks.get_mut(block.block_index as usize)
    }

    /// The block's data arrived and is being written.
    pub fn mark_as_writing(&mut self, block: PieceBlock) -> bool {
        let Some(e) = self.entry_mut_or_insert(block) else {
            return false;
        };
        if e.state == BlockState::Finished {
            return false;
        }
        e.state = BlockState::Writing;
        e.peers.clear();
        true
    }

    pub fn mark_as_finished(&mut self, block: PieceBlock) -> bool {
        let Some(e) = self.entry_mut_or_insert(block) else {
            return false;
        };
        e.state = BlockState::Finished;
        e.peers.clear();
        true
    }

    /// A write failed: the block has to be fetched again.
    pub fn write_failed(&mut self, block: PieceBlock) {
        if let Some(dp) = self.downloading.get_mut(&block.piece_index) {
            if let Some(e) = dp.blocks.get_mut(block.block_index as usize) {
                if e.state == BlockState::Writing {
                    e.state = BlockState::None;
                }
            }
            if dp.is_untouched() {
                self.downloading.remove(&block.piece_index);
            }
        }
    }

    /// Releases `peer`'s claim on a requested block. Blocks past the request
    /// stage are left alone.
    pub fn abort_download(&mut self, block: PieceBlock, peer: PeerHandle) {
        let Some(dp) = self.downloading.get_mut(&block.piece_index) else {
            return;
        };
        let Some(e) = dp.blocks.get_mut(block.block_index as usize) else {
            return;
        };
        if e.state != BlockState::Requested {
            return;
        }
        e.peers.retain(|p| *p != peer);
        if e.peers.is_empty() {
            e.state = BlockState::None;
        }
        if dp.is_untouched() {
            trace!(piece = block.piece_index, "piece no longer downloading");
            self.downloading.remove(&block.piece_index);
        }
    }

    pub fn we_have(&mut self, index: ValidPieceIndex) {
        let piece = index.get();
        self.downloading.remove(&piece);
        if !self.have_piece(piece) {
            self.have.set(piece as usize, true);
            self.num_have += 1;
        }
    }

    /// Forgets all block progress of a piece, e.g. after it failed hashing.
    pub fn restore_piece(&mut self, piece: u32) {
        self.downloading.remove(&piece);
    }

    fn collect_free_blocks(&self, piece: u32, exclude: &[PieceBlock], limit: usize, out: &mut Vec<PieceBlock>) {
        let Some(num_blocks) = self.blocks_in_piece(piece) else {
            return;
        };
        let dp = self.downloading.get(&piece);
        for block_index in 0..num_blocks {
            if out.len() >= limit {
                return;
            }
            let block = PieceBlock::new(piece, block_index);
            let state = dp
                .and_then(|d| d.blocks.get(block_index as usize))
                .map(|e| e.state)
                .unwrap_or_default();
            if state == BlockState::None && !exclude.contains(&block) {
                out.push(block);
            }
        }
    }

    /// Picks up to `count` blocks to request from a peer having `peer_has`.
    ///
    /// Free blocks come first, ordered by `options`. If there aren't enough,
    /// blocks already requested from other peers are appended, least shared
    /// first; the caller decides whether to request them as busy duplicates.
    /// `prefer_whole_pieces` > 0 makes untouched pieces preferable to joining
    /// partially downloaded ones.
    #[allow(clippy::too_many_arguments)]
    pub fn pick_pieces(
        &self,
        peer_has: &BF,
        count: usize,
        prefer_whole_pieces: u32,
        peer: PeerHandle,
        speed: SpeedClass,
        options: PickOptions,
        exclude: &[PieceBlock],
        num_transfer_peers: usize,
    ) -> Vec<PieceBlock> {
        let mut out = Vec::new();
        if count == 0 {
            return out;
        }
        let peer_has_piece = |p: u32| peer_has.get(p as usize).map(|b| *b).unwrap_or(false);
        let use_affinity = options.contains(PickOptions::SPEED_AFFINITY) && num_transfer_peers > 1;
        let sequential = options.contains(PickOptions::SEQUENTIAL);

        let (mut matching, mut other): (Vec<u32>, Vec<u32>) = self
            .downloading
            .iter()
            .filter(|(p, _)| self.is_wanted(**p) && peer_has_piece(**p))
            .map(|(p, d)| (*p, d))
            .partition_map(|(p, d)| {
                if !use_affinity || d.speed == speed {
                    itertools::Either::Left(p)
                } else {
                    itertools::Either::Right(p)
                }
            });

        let mut fresh: Vec<u32> = (0..self.lengths.total_pieces())
            .filter(|p| self.is_wanted(*p) && peer_has_piece(*p) && !self.downloading.contains_key(p))
            .collect();

        if !sequential {
            let prio = |p: &u32| Reverse(self.priority[*p as usize]);
            if options.contains(PickOptions::RAREST_FIRST) {
                let key = |p: &u32| (prio(p), self.availability[*p as usize]);
                matching.sort_by_key(key);
                other.sort_by_key(key);
                fresh.sort_by_key(key);
            } else {
                matching.sort_by_key(prio);
                other.sort_by_key(prio);
                fresh.sort_by_key(prio);
            }
        }

        let order: [&[u32]; 3] = if prefer_whole_pieces > 0 {
            [&fresh, &matching, &other]
        } else {
            [&matching, &fresh, &other]
        };
        for piece in order.into_iter().flatten() {
            if out.len() >= count {
                return out;
            }
            self.collect_free_blocks(*piece, exclude, count, &mut out);
        }

        // Not enough free blocks: offer blocks others are already downloading.
        let mut busy: Vec<(usize, PieceBlock)> = self
            .downloading
            .iter()
            .filter(|(p, _)| self.is_wanted(**p) && peer_has_piece(**p))
            .flat_map(|(p, d)| {
                d.blocks.iter().enumerate().filter_map(move |(i, e)| {
                    let block = PieceBlock::new(*p, i as u32);
                    (e.state == BlockState::Requested && !e.peers.contains(&peer))
                        .then_some((e.peers.len(), block))
                })
            })
            .filter(|(_, b)| !exclude.contains(b))
            .collect();
        busy.sort_by_key(|(n, b)| (*n, *b));
        out.extend(
            busy.into_iter()
                .map(|(_, b)| b)
                .take(count.saturating_sub(out.len())),
        );
        out
    }
}


#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn peer(n: u8) -> PeerHandle {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, n), 4662))
    }

    // 4 pieces of 4 blocks each
    fn lengths() -> Lengths {
        Lengths::new(4 * 400, 400, 100).unwrap()
    }

    fn all(n: usize) -> BF {
        BF::repeat(true, n)
    }

    fn pick(pp: &PiecePicker, has: &BF, count: usize, p: PeerHandle, options: PickOptions) -> Vec<PieceBlock> {
        pp.pick_pieces(has, count, 0, p, SpeedClass::Slow, options, &[], 1)
    }

    #[test]
    fn test_pick_sequential() {
        let pp = PiecePicker::new(lengths());
        let got = pick(&pp, &all(4), 6, peer(1), PickOptions::SEQUENTIAL);
        assert_eq!(
            got,
            vec![
                PieceBlock::new(0, 0),
                PieceBlock::new(0, 1),
                PieceBlock::new(0, 2),
                PieceBlock::new(0, 3),
                PieceBlock::new(1, 0),
                PieceBlock::new(1, 1),
            ]
        );
    }

    #[test]
    fn test_pick_rarest_first() {
        let mut pp = PiecePicker::new(lengths());
        pp.inc_refcount_bitmap(&all(4));
        pp.inc_refcount(0);
        pp.inc_refcount(1);
        pp.inc_refcount(3);
        let got = pick(&pp, &all(4), 1, peer(1), PickOptions::RAREST_FIRST);
        assert_eq!(got, vec![PieceBlock::new(2, 0)]);
    }

    #[test]
    fn test_pick_only_pieces_peer_has() {
        let pp = PiecePicker::new(lengths());
        let mut has = BF::repeat(false, 4);
        has.set(3, true);
        let got = pick(&pp, &has, 10, peer(1), PickOptions::RAREST_FIRST);
        assert_eq!(got.len(), 4);
        assert!(got.iter().all(|b| b.piece_index == 3));
    }

    #[test]
    fn test_pick_skips_have_and_filtered() {
        let mut have = BF::repeat(false, 4);
        have.set(0, true);
        let mut pp = PiecePicker::with_have(lengths(), have);
        pp.set_piece_priority(1, PRIORITY_FILTERED);
        let got = pick(&pp, &all(4), 1, peer(1), PickOptions::SEQUENTIAL);
        assert_eq!(got, vec![PieceBlock::new(2, 0)]);
        assert_eq!(pp.num_wanted(), 3);
    }

    #[test]
    fn test_partial_pieces_first_then_busy() {
        let mut pp = PiecePicker::new(lengths());
        let b = PieceBlock::new(2, 0);
        assert!(pp.mark_as_downloading(b, peer(1), SpeedClass::Slow));

        let got = pick(&pp, &all(4), 3, peer(2), PickOptions::RAREST_FIRST);
        assert_eq!(
            got,
            vec![
                PieceBlock::new(2, 1),
                PieceBlock::new(2, 2),
                PieceBlock::new(2, 3)
            ]
        );

        // only piece 2 is available, everything else is in flight
        let mut has = BF::repeat(false, 4);
        has.set(2, true);
        for i in 1..4 {
            assert!(pp.mark_as_downloading(PieceBlock::new(2, i), peer(1), SpeedClass::Slow));
        }
        let got = pick(&pp, &has, 2, peer(2), PickOptions::RAREST_FIRST);
        assert_eq!(got, vec![PieceBlock::new(2, 0), PieceBlock::new(2, 1)]);
        assert!(pick(&pp, &has, 2, peer(1), PickOptions::RAREST_FIRST).is_empty());
    }

    #[test]
    fn test_speed_affinity() {
        let mut pp = PiecePicker::new(lengths());
        assert!(pp.mark_as_downloading(PieceBlock::new(3, 0), peer(1), SpeedClass::Fast));
        let got = pp.pick_pieces(
            &all(4),
            1,
            0,
            peer(2),
            SpeedClass::Slow,
            PickOptions::RAREST_FIRST | PickOptions::SPEED_AFFINITY,
            &[],
            2,
        );
        assert_eq!(got, vec![PieceBlock::new(0, 0)]);

        let got = pp.pick_pieces(
            &all(4),
            1,
            0,
            peer(2),
            SpeedClass::Fast,
            PickOptions::RAREST_FIRST | PickOptions::SPEED_AFFINITY,
            &[],
            2,
        );
        assert_eq!(got, vec![PieceBlock::new(3, 1)]);
    }

    #[test]
    fn test_mark_and_abort() {
        let mut pp = PiecePicker::new(lengths());
        let b = PieceBlock::new(1, 2);
        assert!(pp.mark_as_downloading(b, peer(1), SpeedClass::Slow));
        assert!(!pp.mark_as_downloading(b, peer(1), SpeedClass::Slow));
        assert!(pp.mark_as_downloading(b, peer(2), SpeedClass::Slow));
        assert_eq!(pp.num_peers(b), 2);

        pp.abort_download(b, peer(1));
        assert_eq!(pp.downloaders(b), &[peer(2)]);
        pp.abort_download(b, peer(2));
        assert_eq!(pp.block_state(b), BlockState::None);
        assert!(!pp.is_downloading(1));

        // aborting again changes nothing
        pp.abort_download(b, peer(2));
        assert_eq!(pp.block_state(b), BlockState::None);
    }

    #[test]
    fn test_block_lifecycle_and_we_have() {
        let mut pp = PiecePicker::new(lengths());
        for i in 0..4 {
            let b = PieceBlock::new(0, i);
            assert!(pp.mark_as_downloading(b, peer(1), SpeedClass::Slow));
            assert!(pp.mark_as_writing(b));
            assert!(pp.is_block_downloaded(b));
            assert!(!pp.mark_as_downloading(b, peer(2), SpeedClass::Slow));
            assert!(!pp.is_piece_finished(0));
            pp.mark_as_finished(b);
        }
        assert!(pp.is_piece_finished(0));

        pp.abort_download(PieceBlock::new(0, 0), peer(1));
        assert!(pp.is_block_finished(PieceBlock::new(0, 0)));

        pp.we_have(lengths().validate_piece_index(0).unwrap());
        assert_eq!(pp.num_have(), 1);
        assert!(!pp.is_downloading(0));
        assert!(!pp.is_seed());
    }

    #[test]
    fn test_restore_piece() {
        let mut pp = PiecePicker::new(lengths());
        for i in 0..4 {
            let b = PieceBlock::new(2, i);
            pp.mark_as_writing(b);
            pp.mark_as_finished(b);
        }
        assert!(pp.is_piece_finished(2));
        pp.restore_piece(2);
        assert!(!pp.is_downloading(2));
        assert_eq!(pp.block_state(PieceBlock::new(2, 0)), BlockState::None);
    }

    #[test]
    fn test_finished_vs_seed() {
        let mut have = BF::repeat(true, 4);
        have.set(3, false);
        let mut pp = PiecePicker::with_have(lengths(), have);
        assert!(!pp.is_finished());
        pp.set_piece_priority(3, PRIORITY_FILTERED);
        assert!(pp.is_finished());
        assert!(!pp.is_seed());
    }

    #[test]
    fn test_refcounts() {
        let mut pp = PiecePicker::new(lengths());
        let mut bf = BF::repeat(false, 4);
        bf.set(1, true);
        bf.set(3, true);
        pp.inc_refcount_bitmap(&bf);
        pp.inc_refcount(1);
        assert_eq!(pp.availability(), &[0, 2, 0, 1]);
        pp.dec_refcount_bitmap(&bf);
        pp.dec_refcount(0);
        assert_eq!(pp.availability(), &[0, 1, 0, 0]);
    }
}
