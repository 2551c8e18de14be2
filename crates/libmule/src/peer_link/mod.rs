//! Per-connection request scheduling.
//!
//! A [`PeerLink`] keeps two queues of blocks: the request queue (picked, not
//! yet sent) and the download queue (sent, awaiting data). Every block in
//! either queue is marked as downloading by this peer in the transfer's
//! [`PiecePicker`] unless it has been flagged `timed_out` or `not_wanted`,
//! in which case the mark was already released.

pub mod stats;

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use libmule_core::{
    Id16,
    constants::BLOCK_SIZE,
    lengths::{Lengths, PieceBlock},
    speed_estimator::RateEstimator,
};
use tracing::{debug, trace};

use crate::{
    bandwidth::{BandwidthChannel, ChannelState, Direction},
    error::{Error, Result},
    message::{ByteRange, WriterRequest, batch_ranges},
    piece_picker::{PickOptions, PiecePicker, SpeedClass},
    type_aliases::{BF, PeerHandle, PeerTx},
};

use self::stats::{PeerCounters, PeerLinkStats};

/// Classifies a peer by its download rate relative to the whole transfer.
pub fn classify_speed(peer_rate: u64, transfer_rate: u64, previous: SpeedClass) -> SpeedClass {
    if peer_rate > 512 && peer_rate > transfer_rate / 16 {
        SpeedClass::Fast
    } else if peer_rate > 4096 && peer_rate > transfer_rate / 64 {
        SpeedClass::Medium
    } else if peer_rate < transfer_rate / 15 && previous == SpeedClass::Fast {
        SpeedClass::Medium
    } else {
        SpeedClass::Slow
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub desired_queue_size: usize,
    pub max_busy_blocks: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            desired_queue_size: 4,
            max_busy_blocks: 1,
        }
    }
}

/// What the owning transfer lends a link while it schedules requests.
pub struct SchedulingContext<'a> {
    pub hash: Id16,
    pub upload_only: bool,
    pub sequential: bool,
    pub transfer_download_rate: u64,
    pub num_transfer_peers: usize,
    pub download_channel: &'a BandwidthChannel,
}

#[derive(Debug)]
pub struct PendingBlock {
    pub block: PieceBlock,
    pub size: u32,
    /// Requested although another peer was already downloading it.
    pub busy: bool,
    /// The piece timeout fired and the picker mark was released.
    pub timed_out: bool,
    /// Cancelled after sending; data will be discarded.
    pub not_wanted: bool,
    pub create_time: Instant,
    buffer: Option<Vec<u8>>,
}

impl PendingBlock {
    fn new(block: PieceBlock, size: u32, busy: bool, now: Instant) -> Self {
        Self {
            block,
            size,
            busy,
            timed_out: false,
            not_wanted: false,
            create_time: now,
            buffer: None,
        }
    }

    pub fn received(&self) -> u32 {
        self.buffer.as_ref().map(|b| b.len() as u32).unwrap_or(0)
    }

    // Whether the picker still holds a mark for this entry.
    fn is_marked(&self) -> bool {
        !self.timed_out && !self.not_wanted
    }
}

/// A block whose bytes have all arrived.
#[derive(Debug)]
pub struct ReceivedBlock {
    pub block: PieceBlock,
    pub data: Vec<u8>,
    pub not_wanted: bool,
}

pub struct PeerLink {
    addr: PeerHandle,
    hash: Id16,
    tx: PeerTx,
    settings: LinkSettings,

    request_queue: VecDeque<PendingBlock>,
    download_queue: VecDeque<PendingBlock>,
    upload_queue: VecDeque<ByteRange>,

    speed: SpeedClass,
    channel_state: [ChannelState; 2],

    bitfield: BF,
    bitfield_known: bool,
    upload_accepted: bool,
    queue_rank: Option<u32>,

    disconnecting: bool,
    snubbed: bool,
    last_data: Instant,

    download_rate: RateEstimator,
    counters: PeerCounters,
    outstanding_writes: usize,
    outstanding_reads: usize,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("addr", &self.addr)
            .field("requested", &self.request_queue.len())
            .field("outstanding", &self.download_queue.len())
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    pub fn new(
        addr: PeerHandle,
        hash: Id16,
        tx: PeerTx,
        settings: LinkSettings,
        total_pieces: u32,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            hash,
            tx,
            settings,
            request_queue: Default::default(),
            download_queue: Default::default(),
            upload_queue: Default::default(),
            speed: SpeedClass::Slow,
            channel_state: [ChannelState::Idle; 2],
            bitfield: BF::repeat(false, total_pieces as usize),
            bitfield_known: false,
            upload_accepted: false,
            queue_rank: None,
            disconnecting: false,
            snubbed: false,
            last_data: now,
            download_rate: RateEstimator::new(5),
            counters: Default::default(),
            outstanding_writes: 0,
            outstanding_reads: 0,
        }
    }

    pub fn addr(&self) -> PeerHandle {
        self.addr
    }

    pub fn speed(&self) -> SpeedClass {
        self.speed
    }

    pub fn bitfield(&self) -> Option<&BF> {
        self.bitfield_known.then_some(&self.bitfield)
    }

    pub fn is_complete_source(&self) -> bool {
        self.bitfield_known && self.bitfield.all()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.bitfield_known && self.bitfield.get(piece as usize).map(|b| *b).unwrap_or(false)
    }

    pub fn request_queue(&self) -> &VecDeque<PendingBlock> {
        &self.request_queue
    }

    pub fn download_queue(&self) -> &VecDeque<PendingBlock> {
        &self.download_queue
    }

    pub fn channel_state(&self, direction: Direction) -> ChannelState {
        self.channel_state[direction as usize]
    }

    fn set_channel_state(&mut self, direction: Direction, state: ChannelState) {
        self.channel_state[direction as usize] = state;
    }

    pub fn counters(&self) -> &PeerCounters {
        &self.counters
    }

    pub fn download_bps(&self) -> u64 {
        self.download_rate.bps()
    }

    pub fn is_snubbed(&self) -> bool {
        self.snubbed
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn upload_accepted(&self) -> bool {
        self.upload_accepted
    }

    pub fn queue_rank(&self) -> Option<u32> {
        self.queue_rank
    }

    pub fn num_busy(&self) -> usize {
        self.queued_blocks_iter().filter(|pb| pb.busy).count()
    }

    fn queued_blocks_iter(&self) -> impl Iterator<Item = &PendingBlock> {
        self.download_queue.iter().chain(self.request_queue.iter())
    }

    fn is_queued(&self, block: PieceBlock) -> bool {
        self.queued_blocks_iter().any(|pb| pb.block == block)
    }

    fn has_ordinary_requests(&self) -> bool {
        self.queued_blocks_iter().any(|pb| !pb.busy && pb.is_marked())
    }

    pub fn stats(&self) -> PeerLinkStats {
        PeerLinkStats {
            addr: self.addr.to_string(),
            counters: self.counters,
            download_bps: self.download_rate.bps(),
            speed: self.speed,
            snubbed: self.snubbed,
            requested: self.request_queue.len(),
            outstanding: self.download_queue.len(),
            upload_state: self.channel_state(Direction::Upload),
            download_state: self.channel_state(Direction::Download),
        }
    }

    pub(crate) fn send(&self, req: WriterRequest) -> bool {
        self.tx.send(req).is_ok()
    }

    /// Asks the peer to upload to us.
    pub(crate) fn request_upload(&self) {
        self.send(WriterRequest::StartUpload { hash: self.hash });
    }

    pub(crate) fn disconnect(&mut self) {
        if !self.disconnecting {
            self.disconnecting = true;
            self.send(WriterRequest::Disconnect);
        }
    }

    /// Replaces the peer's bitmap. Returns the previous one if it was known,
    /// for the caller to un-count its availability.
    pub(crate) fn set_bitfield(&mut self, bitfield: BF) -> Option<BF> {
        let old = std::mem::replace(&mut self.bitfield, bitfield);
        let was_known = std::mem::replace(&mut self.bitfield_known, true);
        was_known.then_some(old)
    }

    /// Returns true if the piece wasn't known to be present before.
    pub(crate) fn set_have(&mut self, piece: u32) -> bool {
        self.bitfield_known = true;
        match self.bitfield.get(piece as usize).map(|b| *b) {
            Some(false) => {
                self.bitfield.set(piece as usize, true);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn on_accept_upload(&mut self) {
        self.upload_accepted = true;
        self.queue_rank = None;
    }

    pub(crate) fn on_queue_ranking(&mut self, rank: u32) {
        self.upload_accepted = false;
        self.queue_rank = Some(rank);
    }

    /// The peer refuses to serve what we asked for: give everything back.
    pub(crate) fn on_out_of_parts(&mut self, picker: Option<&mut PiecePicker>) {
        debug!(peer = %self.addr, "peer is out of parts");
        self.upload_accepted = false;
        self.abort_all_requests(picker);
    }

    fn can_request(&self) -> bool {
        self.bitfield_known && self.upload_accepted && !self.disconnecting
    }

    pub(crate) fn update_speed(&mut self, transfer_rate: u64) {
        self.speed = classify_speed(self.download_rate.bps(), transfer_rate, self.speed);
    }

    /// Tops up the request queue from the picker.
    ///
    /// Ordinary blocks come first. Blocks already requested from others
    /// ("busy") are only taken when no ordinary block was available and the
    /// link has no ordinary request outstanding, and never more than
    /// `max_busy_blocks` at a time.
    pub fn request_block(&mut self, picker: Option<&mut PiecePicker>, ctx: &SchedulingContext<'_>) -> usize {
        let Some(picker) = picker else {
            return 0;
        };
        if picker.is_seed() || ctx.upload_only || !self.can_request() {
            return 0;
        }
        let queued = self.download_queue.len() + self.request_queue.len();
        let mut num_requests = self.settings.desired_queue_size.saturating_sub(queued);
        if num_requests == 0 {
            return 0;
        }

        self.update_speed(ctx.transfer_download_rate);
        let options = if ctx.sequential {
            PickOptions::SEQUENTIAL
        } else {
            PickOptions::RAREST_FIRST | PickOptions::SPEED_AFFINITY
        };
        let prefer_whole_pieces = u32::from(self.speed == SpeedClass::Fast);
        let exclude: Vec<PieceBlock> = self.queued_blocks_iter().map(|pb| pb.block).collect();

        let candidates = picker.pick_pieces(
            &self.bitfield,
            num_requests,
            prefer_whole_pieces,
            self.addr,
            self.speed,
            options,
            &exclude,
            ctx.num_transfer_peers,
        );

        let mut busy = Vec::new();
        let mut added = 0;
        for block in candidates {
            if num_requests == 0 {
                break;
            }
            if picker.is_block_requested(block) {
                busy.push(block);
                continue;
            }
            if self.add_request_inner(picker, block, false) {
                num_requests -= 1;
                added += 1;
            }
        }

        if added == 0 && ctx.sequential {
            self.set_channel_state(Direction::Download, ChannelState::Sequential);
        }
        if added > 0 || busy.is_empty() || self.has_ordinary_requests() {
            return added;
        }

        busy.sort_by_key(|b| picker.num_peers(*b));
        for block in busy {
            if num_requests == 0 || self.num_busy() >= self.settings.max_busy_blocks {
                break;
            }
            if self.add_request_inner(picker, block, true) {
                trace!(peer = %self.addr, %block, "requesting busy block");
                num_requests -= 1;
                added += 1;
            }
        }
        added
    }

    /// Appends one block to the request queue. Fails if the transfer can't
    /// download, the block is already queued here, the picker refuses it,
    /// or a busy request would exceed `max_busy_blocks`.
    pub fn add_request(
        &mut self,
        picker: Option<&mut PiecePicker>,
        upload_only: bool,
        block: PieceBlock,
        busy: bool,
    ) -> bool {
        match picker {
            Some(picker) if !upload_only => self.add_request_inner(picker, block, busy),
            _ => false,
        }
    }

    fn add_request_inner(&mut self, picker: &mut PiecePicker, block: PieceBlock, busy: bool) -> bool {
        if busy && self.num_busy() >= self.settings.max_busy_blocks {
            return false;
        }
        if self.is_queued(block) {
            return false;
        }
        let Some(size) = picker.lengths().block_size(block) else {
            return false;
        };
        if !picker.mark_as_downloading(block, self.addr, self.speed) {
            return false;
        }
        self.request_queue
            .push_back(PendingBlock::new(block, size, busy, Instant::now()));
        true
    }

    /// Moves blocks from the request queue to the download queue and sends
    /// them, batched into as few wire requests as possible.
    pub fn send_block_requests(&mut self, mut picker: Option<&mut PiecePicker>, ctx: &SchedulingContext<'_>) -> usize {
        if self.disconnecting || !self.upload_accepted {
            return 0;
        }
        let Some(lengths) = picker.as_deref().map(|p| *p.lengths()) else {
            return 0;
        };
        let mut ranges = Vec::new();
        while self.download_queue.len() < self.settings.desired_queue_size {
            let Some(pb) = self.request_queue.pop_front() else {
                break;
            };
            if let Some(p) = picker.as_deref_mut() {
                if p.is_block_downloaded(pb.block) {
                    // someone else delivered it while it sat in our queue
                    p.abort_download(pb.block, self.addr);
                    continue;
                }
            }
            if !ctx.download_channel.try_acquire(pb.size as usize) {
                self.set_channel_state(Direction::Download, ChannelState::Limit);
                self.request_queue.push_front(pb);
                break;
            }
            let Some(range) = lengths.block_absolute_range(pb.block) else {
                continue;
            };
            ranges.push(ByteRange::from(range));
            self.download_queue.push_back(pb);
        }

        let sent = ranges.len();
        if sent == 0 {
            return 0;
        }
        for req in batch_ranges(self.hash, ranges) {
            self.counters.requests_sent += 1;
            if !self.send(WriterRequest::RequestParts(req)) {
                debug!(peer = %self.addr, "writer is gone");
                break;
            }
        }
        self.set_channel_state(Direction::Download, ChannelState::Network);
        sent
    }

    /// Drops queued blocks older than `timeout`, releasing their marks.
    pub fn abort_expired_requests(
        &mut self,
        mut picker: Option<&mut PiecePicker>,
        now: Instant,
        timeout: Duration,
    ) -> usize {
        let addr = self.addr;
        let mut expired = 0;
        let mut keep = |pb: &PendingBlock| {
            if now.saturating_duration_since(pb.create_time) <= timeout {
                return true;
            }
            if pb.is_marked() {
                if let Some(p) = picker.as_deref_mut() {
                    p.abort_download(pb.block, addr);
                }
            }
            expired += 1;
            false
        };
        self.request_queue.retain(&mut keep);
        self.download_queue.retain(&mut keep);
        if expired > 0 {
            debug!(peer = %addr, expired, "{}", Error::RequestTimeout);
            self.counters.timeouts += expired as u32;
        }
        expired
    }

    /// If nothing arrived for `piece_timeout`, gives up on the oldest
    /// outstanding block so other peers can take it. The entry stays in the
    /// queue in case its data shows up late.
    pub fn check_piece_timeout(
        &mut self,
        picker: Option<&mut PiecePicker>,
        now: Instant,
        piece_timeout: Duration,
    ) -> bool {
        let last_data = self.last_data;
        let addr = self.addr;
        let Some(front) = self.download_queue.iter_mut().find(|pb| pb.is_marked()) else {
            return false;
        };
        let since = last_data.max(front.create_time);
        if now.saturating_duration_since(since) <= piece_timeout {
            return false;
        }
        front.timed_out = true;
        if let Some(p) = picker {
            p.abort_download(front.block, addr);
        }
        debug!(peer = %addr, block = %front.block, "piece timeout, peer snubbed");
        self.snubbed = true;
        true
    }

    /// Releases every queued block and empties both queues. Entries already
    /// flagged `timed_out` or `not_wanted` hold no mark and are skipped.
    pub fn abort_all_requests(&mut self, mut picker: Option<&mut PiecePicker>) {
        let addr = self.addr;
        for pb in self
            .download_queue
            .drain(..)
            .chain(self.request_queue.drain(..))
        {
            if !pb.is_marked() {
                continue;
            }
            if let Some(p) = picker.as_deref_mut() {
                p.abort_download(pb.block, addr);
            }
        }
        if self.channel_state(Direction::Download) == ChannelState::Network {
            self.set_channel_state(Direction::Download, ChannelState::Idle);
        }
    }

    /// Cancels one block: unsent entries are removed, sent entries are
    /// flagged `not_wanted`.
    pub fn cancel_block(&mut self, block: PieceBlock, mut picker: Option<&mut PiecePicker>) -> bool {
        if let Some(pos) = self.request_queue.iter().position(|pb| pb.block == block) {
            if let Some(pb) = self.request_queue.remove(pos) {
                if let (true, Some(p)) = (pb.is_marked(), picker.as_deref_mut()) {
                    p.abort_download(pb.block, self.addr);
                }
            }
            return true;
        }
        if let Some(pb) = self.download_queue.iter_mut().find(|pb| pb.block == block) {
            if pb.is_marked() {
                if let Some(p) = picker {
                    p.abort_download(pb.block, self.addr);
                }
            }
            pb.not_wanted = true;
            return true;
        }
        false
    }

    /// Drops a block from the request queue if it was not sent yet.
    pub fn drop_unsent(&mut self, block: PieceBlock, picker: Option<&mut PiecePicker>) -> bool {
        if !self.request_queue.iter().any(|pb| pb.block == block) {
            return false;
        }
        self.cancel_block(block, picker)
    }

    /// Re-marks this link's claims on `piece` after the picker forgot them.
    pub fn restore_marks(&self, picker: &mut PiecePicker, piece: u32) {
        for pb in self.queued_blocks_iter() {
            if pb.block.piece_index == piece && pb.is_marked() {
                picker.mark_as_downloading(pb.block, self.addr, self.speed);
            }
        }
    }

    /// Feeds payload bytes starting at absolute offset `start`. The data may
    /// span several blocks but must continue each block where it left off.
    pub fn incoming_data(
        &mut self,
        lengths: &Lengths,
        mut start: u64,
        mut data: &[u8],
        now: Instant,
    ) -> Result<Vec<ReceivedBlock>> {
        let mut completed = Vec::new();
        self.last_data = now;
        self.snubbed = false;
        self.counters.fetched_bytes += data.len() as u64;

        while !data.is_empty() {
            let (block, offset) = lengths
                .locate(start)
                .ok_or_else(|| Error::violation(format!("data at {start} is past the end of file")))?;
            let Some(pos) = self.download_queue.iter().position(|pb| pb.block == block) else {
                // Late data for a request we already gave up on.
                let block_size = lengths.block_size(block).unwrap_or(0);
                let take = data.len().min(block_size.saturating_sub(offset).max(1) as usize);
                trace!(peer = %self.addr, %block, take, "discarding data for unknown block");
                self.counters.redundant_bytes += take as u64;
                data = &data[take..];
                start += take as u64;
                continue;
            };
            let pb = &mut self.download_queue[pos];
            if offset != pb.received() {
                return Err(Error::violation(format!(
                    "block {block}: data at offset {offset}, expected {}",
                    pb.received()
                )));
            }
            let size = pb.size;
            let take = data.len().min((size - pb.received()) as usize);
            pb.buffer
                .get_or_insert_with(|| Vec::with_capacity(size as usize))
                .extend_from_slice(&data[..take]);
            data = &data[take..];
            start += take as u64;

            if pb.received() == pb.size {
                if let Some(pb) = self.download_queue.remove(pos) {
                    self.counters.fetched_blocks += 1;
                    completed.push(ReceivedBlock {
                        block: pb.block,
                        data: pb.buffer.unwrap_or_default(),
                        not_wanted: pb.not_wanted,
                    });
                }
            }
        }
        if self.download_queue.is_empty() && self.request_queue.is_empty() {
            self.set_channel_state(Direction::Download, ChannelState::Idle);
        }
        Ok(completed)
    }

    pub(crate) fn on_redundant(&mut self, bytes: u64) {
        self.counters.redundant_bytes += bytes;
    }

    pub(crate) fn on_write_started(&mut self) {
        self.outstanding_writes += 1;
        self.set_channel_state(Direction::Download, ChannelState::Disk);
    }

    pub(crate) fn on_write_finished(&mut self) {
        self.outstanding_writes = self.outstanding_writes.saturating_sub(1);
        if self.outstanding_writes == 0 && self.channel_state(Direction::Download) == ChannelState::Disk {
            let next = if self.download_queue.is_empty() {
                ChannelState::Idle
            } else {
                ChannelState::Network
            };
            self.set_channel_state(Direction::Download, next);
        }
    }

    /// Queues `range` in chunks of at most one block, so that a single read
    /// never asks the upload quota for more than its bucket holds.
    pub(crate) fn push_upload_request(&mut self, range: ByteRange) {
        let mut start = range.start;
        while start < range.end {
            let end = range.end.min(start + BLOCK_SIZE as u64);
            self.upload_queue.push_back(ByteRange::new(start, end));
            start = end;
        }
    }

    /// Takes the next upload range if the quota allows it.
    pub(crate) fn next_upload(&mut self, up: &BandwidthChannel) -> Option<ByteRange> {
        let range = *self.upload_queue.front()?;
        if !up.try_acquire(range.len() as usize) {
            self.set_channel_state(Direction::Upload, ChannelState::Limit);
            return None;
        }
        self.upload_queue.pop_front();
        self.outstanding_reads += 1;
        self.set_channel_state(Direction::Upload, ChannelState::Disk);
        Some(range)
    }

    pub(crate) fn on_read_finished(&mut self, uploaded: u64) {
        self.outstanding_reads = self.outstanding_reads.saturating_sub(1);
        self.counters.uploaded_bytes += uploaded;
        if self.outstanding_reads == 0 {
            let next = if self.upload_queue.is_empty() {
                ChannelState::Idle
            } else {
                ChannelState::Network
            };
            self.set_channel_state(Direction::Upload, next);
        }
    }

    pub(crate) fn tick(&mut self, now: Instant) {
        self.download_rate.add_snapshot(self.counters.fetched_bytes, now);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{piece_picker::BlockState, type_aliases::PeerRx};

    fn peer(n: u8) -> PeerHandle {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, n), 4662))
    }

    // 4 pieces of 4 blocks each
    fn lengths() -> Lengths {
        Lengths::new(4 * 400, 400, 100).unwrap()
    }

    fn ready_link(n: u8, desired_queue_size: usize) -> (PeerLink, PeerRx) {
        let (tx, rx) = unbounded_channel();
        let mut link = PeerLink::new(
            peer(n),
            Id16::default(),
            tx,
            LinkSettings {
                desired_queue_size,
                max_busy_blocks: 1,
            },
            4,
            Instant::now(),
        );
        link.set_bitfield(BF::repeat(true, 4));
        link.on_accept_upload();
        (link, rx)
    }

    fn ctx(ch: &BandwidthChannel, num_peers: usize) -> SchedulingContext<'_> {
        SchedulingContext {
            hash: Id16::default(),
            upload_only: false,
            sequential: false,
            transfer_download_rate: 0,
            num_transfer_peers: num_peers,
            download_channel: ch,
        }
    }

    fn marked_blocks(pp: &PiecePicker, p: PeerHandle) -> Vec<PieceBlock> {
        (0..4)
            .flat_map(|piece| (0..4).map(move |b| PieceBlock::new(piece, b)))
            .filter(|b| pp.downloaders(*b).contains(&p))
            .collect()
    }

    #[test]
    fn test_classify_speed() {
        assert_eq!(classify_speed(1000, 0, SpeedClass::Slow), SpeedClass::Fast);
        assert_eq!(classify_speed(100, 0, SpeedClass::Slow), SpeedClass::Slow);
        assert_eq!(
            classify_speed(5000, 160_000, SpeedClass::Slow),
            SpeedClass::Medium
        );
        assert_eq!(
            classify_speed(100, 160_000, SpeedClass::Fast),
            SpeedClass::Medium
        );
        assert_eq!(
            classify_speed(100, 160_000, SpeedClass::Medium),
            SpeedClass::Slow
        );
    }

    #[test]
    fn test_request_block_fills_queue() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 3);

        assert_eq!(link.request_block(Some(&mut pp), &ctx(&ch, 1)), 3);
        assert_eq!(link.request_queue().len(), 3);
        assert!(link.request_queue().iter().all(|pb| !pb.busy));
        assert_eq!(marked_blocks(&pp, peer(1)).len(), 3);

        // queue is full
        assert_eq!(link.request_block(Some(&mut pp), &ctx(&ch, 1)), 0);
    }

    #[test]
    fn test_request_block_noop_without_picker_or_bitfield() {
        let ch = BandwidthChannel::new(None);
        let (mut link, _rx) = ready_link(1, 3);
        assert_eq!(link.request_block(None, &ctx(&ch, 1)), 0);

        let (tx, _rx2) = unbounded_channel();
        let mut fresh = PeerLink::new(peer(2), Id16::default(), tx, LinkSettings::default(), 4, Instant::now());
        fresh.on_accept_upload();
        let mut pp = PiecePicker::new(lengths());
        assert_eq!(fresh.request_block(Some(&mut pp), &ctx(&ch, 1)), 0);

        let mut c = ctx(&ch, 1);
        c.upload_only = true;
        assert_eq!(link.request_block(Some(&mut pp), &c), 0);
        assert!(!link.add_request(Some(&mut pp), true, PieceBlock::new(0, 0), false));
    }

    #[test]
    fn test_busy_blocks_only_when_nothing_else() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut a, _rxa) = ready_link(1, 16);
        // a takes every block there is
        assert_eq!(a.request_block(Some(&mut pp), &ctx(&ch, 2)), 16);

        let (mut b, _rxb) = ready_link(2, 4);
        assert_eq!(b.request_block(Some(&mut pp), &ctx(&ch, 2)), 1);
        assert_eq!(b.num_busy(), 1);
        assert!(b.request_queue()[0].busy);

        // at most max_busy_blocks
        assert_eq!(b.request_block(Some(&mut pp), &ctx(&ch, 2)), 0);
        assert!(!b.add_request(Some(&mut pp), false, PieceBlock::new(3, 3), true));
    }

    #[test]
    fn test_send_block_requests_batches() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, mut rx) = ready_link(1, 4);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        assert_eq!(link.send_block_requests(Some(&mut pp), &ctx(&ch, 1)), 4);
        assert!(link.request_queue().is_empty());
        assert_eq!(link.download_queue().len(), 4);
        assert_eq!(link.channel_state(Direction::Download), ChannelState::Network);

        let mut reqs = Vec::new();
        while let Ok(r) = rx.try_recv() {
            reqs.push(r);
        }
        assert_eq!(reqs.len(), 1);
        match &reqs[0] {
            WriterRequest::RequestParts(r) => {
                assert_eq!(r.ranges.as_slice(), &[ByteRange::new(0, 400)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_send_respects_bandwidth() {
        let ch = BandwidthChannel::new(Some(10));
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 4);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        // bucket starts with 1 byte, a block is 100
        assert_eq!(link.send_block_requests(Some(&mut pp), &ctx(&ch, 1)), 0);
        assert_eq!(link.request_queue().len(), 4);
        assert_eq!(link.channel_state(Direction::Download), ChannelState::Limit);
    }

    #[test]
    fn test_abort_all_requests_releases_marks() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 6);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        link.send_block_requests(Some(&mut pp), &ctx(&ch, 1));
        assert!(!marked_blocks(&pp, peer(1)).is_empty());

        link.abort_all_requests(Some(&mut pp));
        assert!(marked_blocks(&pp, peer(1)).is_empty());
        assert!(link.download_queue().is_empty());
        assert!(link.request_queue().is_empty());
        assert_eq!(pp.downloading_pieces().count(), 0);

        link.abort_all_requests(Some(&mut pp));
    }

    #[test]
    fn test_abort_expired_requests() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 2);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        let now = Instant::now();
        assert_eq!(
            link.abort_expired_requests(Some(&mut pp), now, Duration::from_secs(60)),
            0
        );
        assert_eq!(
            link.abort_expired_requests(Some(&mut pp), now + Duration::from_secs(61), Duration::from_secs(60)),
            2
        );
        assert!(marked_blocks(&pp, peer(1)).is_empty());
        assert_eq!(link.counters().timeouts, 2);
    }

    #[test]
    fn test_piece_timeout_releases_front_block_once() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 2);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        link.send_block_requests(Some(&mut pp), &ctx(&ch, 1));
        let front = link.download_queue()[0].block;

        let later = Instant::now() + Duration::from_secs(30);
        assert!(link.check_piece_timeout(Some(&mut pp), later, Duration::from_secs(20)));
        assert!(link.is_snubbed());
        assert!(link.download_queue()[0].timed_out);
        assert_eq!(pp.block_state(front), BlockState::None);

        // another peer grabs it, our late abort must not release theirs
        assert!(pp.mark_as_downloading(front, peer(2), SpeedClass::Slow));
        link.abort_all_requests(Some(&mut pp));
        assert_eq!(pp.downloaders(front), &[peer(2)]);
    }

    #[test]
    fn test_incoming_data() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 2);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        link.send_block_requests(Some(&mut pp), &ctx(&ch, 1));
        let l = lengths();

        let got = link.incoming_data(&l, 0, &[1u8; 150], Instant::now()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].block, PieceBlock::new(0, 0));
        assert_eq!(got[0].data.len(), 100);
        assert_eq!(link.download_queue()[0].received(), 50);

        // gap
        assert!(matches!(
            link.incoming_data(&l, 160, &[1u8; 10], Instant::now()),
            Err(Error::PeerProtocolViolation(_))
        ));
        // unrequested data is dropped
        assert!(link.incoming_data(&l, 1000, &[1u8; 10], Instant::now()).unwrap().is_empty());
        assert_eq!(link.counters().redundant_bytes, 10);
        // past the end of the file
        assert!(matches!(
            link.incoming_data(&l, 1600, &[1u8; 10], Instant::now()),
            Err(Error::PeerProtocolViolation(_))
        ));

        let got = link.incoming_data(&l, 150, &[2u8; 50], Instant::now()).unwrap();
        assert_eq!(got.len(), 1);
        assert!(link.download_queue().is_empty());
        assert_eq!(link.counters().fetched_blocks, 2);
    }

    #[test]
    fn test_cancel_block() {
        let ch = BandwidthChannel::new(None);
        let mut pp = PiecePicker::new(lengths());
        let (mut link, _rx) = ready_link(1, 2);
        link.request_block(Some(&mut pp), &ctx(&ch, 1));
        link.send_block_requests(Some(&mut pp), &ctx(&ch, 1));
        let b = PieceBlock::new(0, 0);
        assert!(link.cancel_block(b, Some(&mut pp)));
        assert!(link.download_queue()[0].not_wanted);
        assert_eq!(pp.block_state(b), BlockState::None);
        assert!(!link.drop_unsent(b, Some(&mut pp)));
    }

    #[tokio::test]
    async fn test_long_upload_range_is_served_under_limit() {
        let ch = BandwidthChannel::new(Some(100_000));
        let (mut link, _rx) = ready_link(1, 2);
        let end = 2 * BLOCK_SIZE as u64 + 10;
        link.push_upload_request(ByteRange::new(0, end));

        let mut served = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while served.len() < 3 && Instant::now() < deadline {
            while let Some(r) = link.next_upload(&ch) {
                served.push(r);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            served,
            vec![
                ByteRange::new(0, BLOCK_SIZE as u64),
                ByteRange::new(BLOCK_SIZE as u64, 2 * BLOCK_SIZE as u64),
                ByteRange::new(2 * BLOCK_SIZE as u64, end),
            ]
        );
    }
}
