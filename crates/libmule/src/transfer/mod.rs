//! One file being downloaded or shared.
//!
//! A [`Transfer`] owns the piece picker, the attached peer links and the
//! peer policy, and drives the piece lifecycle:
//! unverified -> downloading -> writing -> verifying -> passed, with a failed
//! hash sending the piece back to unverified.
//!
//! It never blocks: disk work is queued as [`DiskJob`]s for the session to
//! run, and results come back through [`Transfer::on_disk_completion`].

mod stats;

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use libmule_core::{
    Id16,
    lengths::{Lengths, PieceBlock, ValidPieceIndex},
    speed_estimator::RateEstimator,
};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    alerts::{AlertKind, TransferAlertBus},
    bandwidth::BandwidthManager,
    connection_queue::{ConnectionQueue, OnConnect, OnTimeout, Ticket},
    disk::{DiskCompletion, DiskJob},
    error::{Error, Result},
    message::{ByteRange, PeerMessage, RangeRequest, WriterRequest},
    peer_link::{LinkSettings, PeerLink, SchedulingContext, stats::PeerLinkStats},
    piece_picker::{BlockState, PiecePicker},
    policy::{PeerPolicy, PeerSource},
    resume_data::ResumeData,
    type_aliases::{BF, PeerHandle, PeerTx},
};

pub use self::stats::{TransferCounters, TransferStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Waiting for its turn to check existing data.
    Queued,
    Checking,
    Allocating,
    Downloading,
    /// Every wanted piece is verified.
    Finished,
    /// Every piece is verified.
    Seeding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceState {
    Unverified,
    Downloading,
    Writing,
    Verifying,
    Passed,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub link: LinkSettings,
    pub request_timeout: Duration,
    pub piece_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_peers: usize,
    pub max_failcount: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            request_timeout: Duration::from_secs(60),
            piece_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(15),
            max_peers: 50,
            max_failcount: 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct AddTransferParams {
    pub hash: Id16,
    pub size: u64,
    /// One MD4 per piece. They must add up to `hash`.
    pub piece_hashes: Vec<Id16>,
    pub resume: Option<ResumeData>,
    pub paused: bool,
    /// The data on disk is known to be complete: skip checking.
    pub seed_mode: bool,
    pub sequential: bool,
    pub upload_only: bool,
    pub peers: Vec<SocketAddr>,
    /// Piece and block sizes other than the protocol ones.
    pub lengths: Option<Lengths>,
}

pub struct Transfer {
    hash: Id16,
    lengths: Lengths,
    piece_hashes: Vec<Id16>,

    state: TransferState,
    paused: bool,
    upload_only: bool,
    sequential: bool,
    error: Option<String>,
    queue_position: usize,

    // Created on entering the download state, dropped once seeding.
    picker: Option<PiecePicker>,
    // The verified pieces while there is no picker.
    have: BF,
    needs_check: bool,
    checking_piece: Option<u32>,
    verifying: HashSet<u32>,

    links: HashMap<PeerHandle, PeerLink>,
    policy: PeerPolicy,

    disk_jobs: Vec<DiskJob>,
    counters: TransferCounters,
    download_rate: RateEstimator,
    resume_dirty: bool,

    settings: TransferSettings,
    bandwidth: Arc<BandwidthManager>,
    alerts: TransferAlertBus,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("hash", &self.hash)
            .field("state", &self.state)
            .field("paused", &self.paused)
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

fn validate_hashset(hash: Id16, lengths: &Lengths, piece_hashes: &[Id16]) -> Result<()> {
    let expected = lengths.total_pieces() as usize;
    if piece_hashes.len() != expected {
        return Err(Error::BadHashset {
            expected,
            actual: piece_hashes.len(),
        });
    }
    let raw: Vec<[u8; 16]> = piece_hashes.iter().map(|h| h.0).collect();
    if md4w::ed2k_file_hash(&raw) != hash.0 {
        return Err(Error::HashsetMismatch(hash));
    }
    Ok(())
}

impl Transfer {
    pub fn new(
        params: AddTransferParams,
        settings: TransferSettings,
        bandwidth: Arc<BandwidthManager>,
        alerts: TransferAlertBus,
        queue_position: usize,
    ) -> Result<Self> {
        let lengths = match params.lengths {
            Some(l) => l,
            None => Lengths::for_file_size(params.size)?,
        };
        validate_hashset(params.hash, &lengths, &params.piece_hashes)?;

        let total = lengths.total_pieces() as usize;
        let mut counters = TransferCounters::default();
        let mut paused = params.paused;
        let resume = params
            .resume
            .filter(|r| r.hash == params.hash && r.total_pieces as usize == total);
        let have = if params.seed_mode {
            BF::repeat(true, total)
        } else if let Some(r) = resume.as_ref() {
            counters.accepted = r.accepted;
            counters.requested = r.requested;
            counters.transferred = r.transferred;
            paused |= r.paused;
            r.have_pieces()
        } else {
            BF::repeat(false, total)
        };

        let mut policy = PeerPolicy::new(settings.max_failcount);
        for addr in params.peers {
            policy.add_peer(addr, PeerSource::Server);
        }

        let mut t = Self {
            hash: params.hash,
            lengths,
            piece_hashes: params.piece_hashes,
            state: TransferState::Allocating,
            paused,
            upload_only: params.upload_only,
            sequential: params.sequential,
            error: None,
            queue_position,
            picker: None,
            have,
            needs_check: resume.is_none() && !params.seed_mode,
            checking_piece: None,
            verifying: HashSet::new(),
            links: HashMap::new(),
            policy,
            disk_jobs: Vec::new(),
            counters,
            download_rate: RateEstimator::new(5),
            resume_dirty: false,
            settings,
            bandwidth,
            alerts,
        };
        t.disk_jobs.push(DiskJob::Allocate {
            len: t.lengths.total_length(),
        });
        t.alerts.emit(AlertKind::Added);
        Ok(t)
    }

    pub fn hash(&self) -> Id16 {
        self.hash
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_upload_only(&self) -> bool {
        self.upload_only || self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn picker(&self) -> Option<&PiecePicker> {
        self.picker.as_ref()
    }

    pub fn policy(&self) -> &PeerPolicy {
        &self.policy
    }

    pub fn link(&self, addr: &PeerHandle) -> Option<&PeerLink> {
        self.links.get(addr)
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn alerts(&self) -> &TransferAlertBus {
        &self.alerts
    }

    pub fn counters(&self) -> &TransferCounters {
        &self.counters
    }

    pub fn queue_position(&self) -> usize {
        self.queue_position
    }

    pub(crate) fn set_queue_position(&mut self, pos: usize) {
        self.queue_position = pos;
    }

    pub fn have_bitmap(&self) -> &BF {
        match self.picker.as_ref() {
            Some(p) => p.have_bitmap(),
            None => &self.have,
        }
    }

    pub fn have_piece(&self, piece: u32) -> bool {
        self.have_bitmap()
            .get(piece as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn num_have(&self) -> u32 {
        self.have_bitmap().count_ones() as u32
    }

    /// Waiting for a checking slot. The session owns the queue of those.
    pub fn needs_check(&self) -> bool {
        self.needs_check && self.state == TransferState::Queued && !self.paused
    }

    pub fn is_checking(&self) -> bool {
        self.state == TransferState::Checking
    }

    /// Disk work queued since the last call.
    pub fn take_disk_jobs(&mut self) -> Vec<DiskJob> {
        std::mem::take(&mut self.disk_jobs)
    }

    /// Whether something worth persisting changed since the last call.
    pub fn take_resume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.resume_dirty)
    }

    pub fn write_resume_data(&self) -> ResumeData {
        ResumeData {
            hash: self.hash,
            total_pieces: self.lengths.total_pieces(),
            have: self.have_bitmap().clone(),
            accepted: self.counters.accepted,
            requested: self.counters.requested,
            transferred: self.counters.transferred,
            paused: self.paused,
        }
    }

    pub fn piece_availability(&self) -> Option<Vec<u32>> {
        self.picker.as_ref().map(|p| p.availability().to_vec())
    }

    pub fn piece_state(&self, piece: u32) -> Option<PieceState> {
        let index = self.lengths.validate_piece_index(piece)?;
        if self.have_piece(piece) {
            return Some(PieceState::Passed);
        }
        if self.verifying.contains(&piece) {
            return Some(PieceState::Verifying);
        }
        let Some(picker) = self.picker.as_ref().filter(|p| p.is_downloading(piece)) else {
            return Some(PieceState::Unverified);
        };
        let writing = (0..self.lengths.blocks_in_piece(index))
            .any(|b| picker.block_state(PieceBlock::new(piece, b)) == BlockState::Writing);
        Some(if writing {
            PieceState::Writing
        } else {
            PieceState::Downloading
        })
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus {
            hash: self.hash,
            state: self.state,
            paused: self.paused,
            upload_only: self.is_upload_only(),
            sequential: self.sequential,
            error: self.error.clone(),
            total_pieces: self.lengths.total_pieces(),
            num_have: self.num_have(),
            total_bytes: self.lengths.total_length(),
            have_bytes: self
                .have_bitmap()
                .iter_ones()
                .filter_map(|p| self.lengths.validate_piece_index(p as u32))
                .map(|p| self.lengths.piece_length(p) as u64)
                .sum(),
            num_links: self.links.len(),
            num_known_peers: self.policy.num_peers(),
            download_bps: self.download_rate.bps(),
            queue_position: self.queue_position,
            counters: self.counters,
        }
    }

    pub fn peer_stats(&self) -> Vec<PeerLinkStats> {
        self.links.values().map(|l| l.stats()).collect()
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!(hash = %self.hash, from = ?self.state, to = ?state, "state changed");
            self.state = state;
            self.alerts.emit(AlertKind::StateChanged { state });
        }
    }

    /// Switches to upload-only with an error after a failed disk operation.
    fn set_error(&mut self, e: Error) {
        warn!(hash = %self.hash, "{e:#}");
        let msg = format!("{e:#}");
        self.error = Some(msg.clone());
        let mut picker = self.picker.as_mut();
        for link in self.links.values_mut() {
            link.abort_all_requests(picker.as_deref_mut());
        }
        self.alerts.emit(AlertKind::Error { error: msg });
    }

    /// Clears the error, going back to downloading if wanted.
    pub fn clear_error(&mut self) {
        if self.error.take().is_some() {
            self.request_upload_from_links();
            let addrs: Vec<_> = self.links.keys().copied().collect();
            for addr in addrs {
                self.request_blocks(addr);
            }
        }
    }

    pub fn on_disk_completion(&mut self, completion: DiskCompletion, now: Instant) {
        match completion {
            DiskCompletion::Allocate { result } => self.on_allocate_complete(result),
            DiskCompletion::Write {
                peer,
                block,
                result,
            } => self.on_write_complete(peer, block, result, now),
            DiskCompletion::Hash { piece, result } => self.on_hash_complete(piece, result),
            DiskCompletion::Read {
                peer,
                range,
                result,
            } => self.on_read_complete(peer, range, result),
        }
    }

    fn on_allocate_complete(&mut self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            self.set_error(Error::Disk(e));
        }
        if self.needs_check {
            self.set_state(TransferState::Queued);
        } else {
            self.enter_download_state();
        }
    }

    /// Starts hashing what is on disk, one piece at a time.
    pub fn start_checking(&mut self) {
        info!(hash = %self.hash, "checking existing data");
        self.have = BF::repeat(false, self.lengths.total_pieces() as usize);
        self.set_state(TransferState::Checking);
        self.queue_check(0);
    }

    fn queue_check(&mut self, piece: u32) {
        let Some(index) = self.lengths.validate_piece_index(piece) else {
            return;
        };
        self.checking_piece = Some(piece);
        self.disk_jobs.push(DiskJob::Hash {
            piece,
            range: self.lengths.piece_range(index),
        });
    }

    fn on_check_complete(&mut self, piece: u32, result: anyhow::Result<Id16>) {
        // Unreadable pieces simply count as missing.
        if let Ok(h) = result {
            if self.piece_hashes.get(piece as usize) == Some(&h) {
                self.have.set(piece as usize, true);
            }
        }
        if piece < self.lengths.last_piece_id().get() {
            self.queue_check(piece + 1);
            return;
        }
        self.checking_piece = None;
        self.needs_check = false;
        self.resume_dirty = true;
        info!(hash = %self.hash, have = self.have.count_ones(), "check finished");
        self.enter_download_state();
    }

    fn enter_download_state(&mut self) {
        let mut picker = PiecePicker::with_have(self.lengths, self.have.clone());
        for link in self.links.values() {
            if let Some(bf) = link.bitfield() {
                picker.inc_refcount_bitmap(bf);
            }
        }
        self.picker = Some(picker);
        self.set_state(TransferState::Downloading);
        self.check_finished();
    }

    fn check_finished(&mut self) {
        let Some(picker) = self.picker.as_ref() else {
            return;
        };
        let (finished, seed) = (picker.is_finished(), picker.is_seed());
        if finished && self.state == TransferState::Downloading {
            self.finished();
        }
        if seed {
            self.completed();
        }
    }

    fn finished(&mut self) {
        info!(hash = %self.hash, "finished");
        self.set_state(TransferState::Finished);
        self.policy.set_finished(true);
        self.resume_dirty = true;
        self.alerts.emit(AlertKind::Finished);
        let now = Instant::now();
        let sources: Vec<_> = self
            .links
            .values()
            .filter(|l| l.is_complete_source())
            .map(|l| l.addr())
            .collect();
        for addr in sources {
            self.detach_link(addr, "both sides are complete", false, now);
        }
    }

    fn completed(&mut self) {
        let Some(picker) = self.picker.take() else {
            return;
        };
        self.have = picker.have_bitmap().clone();
        for link in self.links.values_mut() {
            link.abort_all_requests(None);
        }
        self.set_state(TransferState::Seeding);
        self.alerts.emit(AlertKind::Completed);
    }

    fn queue_verification(&mut self, index: ValidPieceIndex) {
        let piece = index.get();
        if self.verifying.insert(piece) {
            trace!(piece, "verifying");
            self.disk_jobs.push(DiskJob::Hash {
                piece,
                range: self.lengths.piece_range(index),
            });
        }
    }

    fn on_write_complete(&mut self, peer: PeerHandle, block: PieceBlock, result: anyhow::Result<()>, _now: Instant) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.on_write_finished();
        }
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        match result {
            Err(e) => {
                picker.write_failed(block);
                self.set_error(Error::Disk(e));
            }
            Ok(()) => {
                picker.mark_as_finished(block);
                if picker.is_piece_finished(block.piece_index) {
                    if let Some(index) = self.lengths.validate_piece_index(block.piece_index) {
                        self.queue_verification(index);
                    }
                }
            }
        }
    }

    fn on_hash_complete(&mut self, piece: u32, result: anyhow::Result<Id16>) {
        if self.state == TransferState::Checking && self.checking_piece == Some(piece) {
            self.on_check_complete(piece, result);
            return;
        }
        if !self.verifying.remove(&piece) {
            trace!(piece, "stale hash result");
            return;
        }
        let Some(index) = self.lengths.validate_piece_index(piece) else {
            return;
        };
        match result {
            Ok(h) if self.piece_hashes.get(piece as usize) == Some(&h) => self.piece_passed(index),
            Ok(_) => {
                warn!(hash = %self.hash, "{}", Error::HashMismatch { piece });
                self.piece_failed(piece);
            }
            Err(e) => {
                if let Some(p) = self.picker.as_mut() {
                    p.restore_piece(piece);
                }
                self.restore_piece_state(piece);
                self.set_error(Error::Disk(e));
            }
        }
    }

    /// A piece hashed correctly.
    pub fn piece_passed(&mut self, index: ValidPieceIndex) {
        let piece = index.get();
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        picker.we_have(index);
        self.counters.passed_pieces += 1;

        // Whatever is still outstanding for this piece is not wanted anymore.
        let blocks = self.lengths.blocks_in_piece(index);
        for link in self.links.values_mut() {
            for b in 0..blocks {
                link.cancel_block(PieceBlock::new(piece, b), Some(&mut *picker));
            }
        }
        debug!(hash = %self.hash, piece, "piece passed");
        self.resume_dirty = true;
        self.alerts.emit(AlertKind::PieceFinished { piece });
        self.check_finished();
    }

    /// A piece failed its hash: it goes back to unverified, keeping the
    /// claims of links that still have it queued.
    pub fn piece_failed(&mut self, piece: u32) {
        self.counters.failed_hashes += 1;
        self.alerts.emit(AlertKind::HashFailed { piece });
        if let Some(p) = self.picker.as_mut() {
            p.restore_piece(piece);
        }
        self.restore_piece_state(piece);
        let addrs: Vec<_> = self.links.keys().copied().collect();
        for addr in addrs {
            self.request_blocks(addr);
        }
    }

    /// Re-marks blocks of `piece` that links still have queued.
    pub fn restore_piece_state(&mut self, piece: u32) {
        let Some(picker) = self.picker.as_mut() else {
            return;
        };
        for link in self.links.values() {
            link.restore_marks(picker, piece);
        }
    }

    fn on_read_complete(&mut self, peer: PeerHandle, range: ByteRange, result: anyhow::Result<Bytes>) {
        match result {
            Ok(data) => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                let len = data.len() as u64;
                link.on_read_finished(len);
                if link.send(WriterRequest::SendingPart {
                    hash: self.hash,
                    start: range.start,
                    data,
                }) {
                    self.counters.transferred += len;
                }
                self.serve_uploads(peer);
            }
            Err(e) => {
                if let Some(link) = self.links.get_mut(&peer) {
                    link.on_read_finished(0);
                }
                self.set_error(Error::Disk(e));
            }
        }
    }

    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) -> bool {
        self.policy.add_peer(addr, source)
    }

    fn accepts_links(&self) -> bool {
        !self.paused
            && matches!(
                self.state,
                TransferState::Downloading | TransferState::Finished | TransferState::Seeding
            )
    }

    pub fn attach_link(&mut self, addr: PeerHandle, tx: PeerTx, now: Instant) -> Result<()> {
        if !self.accepts_links() {
            return Err(Error::TransferNotReady);
        }
        if self.links.contains_key(&addr) {
            return Err(Error::PeerAlreadyConnected(addr));
        }
        if self.links.len() >= self.settings.max_peers {
            return Err(Error::TooManyPeers);
        }
        let link = PeerLink::new(
            addr,
            self.hash,
            tx,
            self.settings.link,
            self.lengths.total_pieces(),
            now,
        );
        if self.wants_data() {
            link.request_upload();
        }
        self.links.insert(addr, link);
        self.policy.set_connection(addr, addr);
        debug!(hash = %self.hash, peer = %addr, "peer attached");
        self.alerts.emit(AlertKind::PeerConnected { peer: addr });
        Ok(())
    }

    fn wants_data(&self) -> bool {
        self.picker.as_ref().is_some_and(|p| !p.is_finished()) && !self.is_upload_only()
    }

    /// Asks every attached peer that isn't serving us yet to start uploading.
    /// Links attached while nothing was wanted never sent the request.
    fn request_upload_from_links(&self) {
        if !self.wants_data() {
            return;
        }
        for link in self.links.values().filter(|l| !l.upload_accepted()) {
            link.request_upload();
        }
    }

    /// Removes a link, giving back everything it had claimed. Returns false
    /// if there was no such link.
    pub fn detach_link(&mut self, addr: PeerHandle, reason: &str, failed: bool, now: Instant) -> bool {
        let Some(mut link) = self.links.remove(&addr) else {
            return false;
        };
        link.abort_all_requests(self.picker.as_mut());
        if let (Some(p), Some(bf)) = (self.picker.as_mut(), link.bitfield()) {
            p.dec_refcount_bitmap(bf);
        }
        link.disconnect();
        self.policy.connection_closed(&addr, failed, now);
        debug!(hash = %self.hash, peer = %addr, reason, "peer detached");
        self.alerts.emit(AlertKind::PeerDisconnected {
            peer: addr,
            reason: reason.to_owned(),
        });
        true
    }

    fn num_connecting(&self) -> usize {
        self.policy.iter().filter(|p| p.connecting.is_some()).count()
    }

    pub fn wants_more_peers(&self) -> bool {
        !self.paused
            && self.state == TransferState::Downloading
            && self.error.is_none()
            && self.links.len() + self.num_connecting() < self.settings.max_peers
            && self.policy.num_connect_candidates() > 0
    }

    pub fn connect_one_peer(
        &mut self,
        queue: &ConnectionQueue,
        make_callbacks: impl FnOnce(SocketAddr) -> (OnConnect, OnTimeout),
    ) -> Option<SocketAddr> {
        if !self.wants_more_peers() {
            return None;
        }
        self.policy
            .connect_one_peer(queue, self.settings.connect_timeout, make_callbacks)
    }

    pub fn connecting_ticket(&self, addr: &SocketAddr) -> Option<Ticket> {
        self.policy.get(addr).and_then(|p| p.connecting)
    }

    /// The admission deadline of attempt `ticket` passed. Ignored unless
    /// that attempt is still the one in flight for `addr`: the link may
    /// have attached already, or a newer attempt may have started.
    pub fn on_connect_timed_out(&mut self, addr: SocketAddr, ticket: Ticket, now: Instant) -> bool {
        if self.connecting_ticket(&addr) != Some(ticket) {
            trace!(peer = %addr, ticket, "stale connect timeout");
            return false;
        }
        self.on_connect_aborted(addr, true, now);
        true
    }

    /// An outbound attempt ended without a link: it failed, timed out or
    /// the link was refused.
    pub fn on_connect_aborted(&mut self, addr: SocketAddr, failed: bool, now: Instant) {
        self.policy.connection_closed(&addr, failed, now);
    }

    /// Handles one message from a peer. A protocol violation detaches the
    /// link and is returned.
    pub fn on_peer_message(&mut self, addr: PeerHandle, msg: PeerMessage, now: Instant) -> Result<()> {
        match self.handle_peer_message(addr, msg, now) {
            Err(e @ Error::PeerProtocolViolation(_)) => {
                debug!(hash = %self.hash, peer = %addr, "{e}");
                self.detach_link(addr, &e.to_string(), true, now);
                Err(e)
            }
            r => r,
        }
    }

    fn handle_peer_message(&mut self, addr: PeerHandle, msg: PeerMessage, now: Instant) -> Result<()> {
        if !self.links.contains_key(&addr) {
            return Err(Error::PeerNotFound(addr));
        }
        match msg {
            PeerMessage::FileStatus(bf) => self.on_file_status(addr, bf, now)?,
            PeerMessage::HavePiece(piece) => {
                if self.lengths.validate_piece_index(piece).is_none() {
                    return Err(Error::violation(format!("have for invalid piece {piece}")));
                }
                let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
                if link.set_have(piece) {
                    if let Some(p) = self.picker.as_mut() {
                        p.inc_refcount(piece);
                    }
                }
                self.request_blocks(addr);
            }
            PeerMessage::AcceptUpload => {
                let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
                link.on_accept_upload();
                self.request_blocks(addr);
            }
            PeerMessage::QueueRanking(rank) => {
                let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
                trace!(peer = %addr, rank, "queued by peer");
                link.on_queue_ranking(rank);
                link.abort_all_requests(self.picker.as_mut());
            }
            PeerMessage::OutOfParts => {
                let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
                link.on_out_of_parts(self.picker.as_mut());
            }
            PeerMessage::NoFile => {
                self.detach_link(addr, "peer does not share the file", false, now);
                self.policy.remove_peer(&addr);
            }
            PeerMessage::SendingPart { start, data } => self.on_sending_part(addr, start, &data, now)?,
            PeerMessage::RequestParts(req) => self.on_request_parts(addr, req)?,
        }
        Ok(())
    }

    fn on_file_status(&mut self, addr: PeerHandle, mut bf: BF, now: Instant) -> Result<()> {
        let total = self.lengths.total_pieces() as usize;
        if bf.is_empty() {
            bf = BF::repeat(true, total);
        } else if bf.len() < total {
            return Err(Error::violation(format!(
                "file status has {} bits, expected {total}",
                bf.len()
            )));
        }
        bf.truncate(total);

        let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
        let old = link.set_bitfield(bf);
        if let Some(p) = self.picker.as_mut() {
            if let Some(old) = old.as_ref() {
                p.dec_refcount_bitmap(old);
            }
            if let Some(bf) = link.bitfield() {
                p.inc_refcount_bitmap(bf);
            }
        }
        let complete = link.is_complete_source();
        self.policy.set_seed(&addr, complete);
        if complete && self.state == TransferState::Seeding {
            self.detach_link(addr, "both sides are complete", false, now);
            return Ok(());
        }
        self.request_blocks(addr);
        Ok(())
    }

    fn on_sending_part(&mut self, addr: PeerHandle, start: u64, data: &[u8], now: Instant) -> Result<()> {
        let lengths = self.lengths;
        let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
        let received = link.incoming_data(&lengths, start, data, now)?;
        self.counters.fetched_bytes += data.len() as u64;

        let mut written = Vec::new();
        for rb in received {
            let size = rb.data.len() as u64;
            let wanted = !rb.not_wanted
                && self
                    .picker
                    .as_ref()
                    .is_some_and(|p| !p.is_block_downloaded(rb.block));
            let (true, Some(picker)) = (wanted, self.picker.as_mut()) else {
                trace!(peer = %addr, block = %rb.block, "redundant block");
                link.on_redundant(size);
                self.counters.redundant_bytes += size;
                continue;
            };
            let Some(range) = lengths.block_absolute_range(rb.block) else {
                continue;
            };
            picker.mark_as_writing(rb.block);
            link.on_write_started();
            self.disk_jobs.push(DiskJob::Write {
                peer: addr,
                block: rb.block,
                offset: range.start,
                data: rb.data,
            });
            written.push(rb.block);
        }

        // Duplicates nobody sent yet are pointless now.
        for block in written {
            for (other, l) in self.links.iter_mut() {
                if *other != addr {
                    l.drop_unsent(block, self.picker.as_mut());
                }
            }
        }
        self.request_blocks(addr);
        Ok(())
    }

    fn on_request_parts(&mut self, addr: PeerHandle, req: RangeRequest) -> Result<()> {
        if req.hash != self.hash {
            return Err(Error::violation(format!("request for unknown file {}", req.hash)));
        }
        self.counters.requested += 1;
        let piece_length = self.lengths.default_piece_length() as u64;
        for range in req.ranges.iter() {
            if range.is_empty() || range.end > self.lengths.total_length() {
                return Err(Error::violation(format!("bad range {range}")));
            }
            let first = (range.start / piece_length) as u32;
            let last = ((range.end - 1) / piece_length) as u32;
            if let Some(p) = (first..=last).find(|p| !self.have_piece(*p)) {
                return Err(Error::violation(format!("requested piece {p} we don't have")));
            }
        }
        let link = self.links.get_mut(&addr).ok_or(Error::PeerNotFound(addr))?;
        for range in req.ranges {
            link.push_upload_request(range);
        }
        self.counters.accepted += 1;
        self.serve_uploads(addr);
        Ok(())
    }

    fn serve_uploads(&mut self, addr: PeerHandle) {
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        while let Some(range) = link.next_upload(&self.bandwidth.up) {
            self.disk_jobs.push(DiskJob::Read { peer: addr, range });
        }
    }

    fn request_blocks(&mut self, addr: PeerHandle) {
        let ctx = SchedulingContext {
            hash: self.hash,
            upload_only: self.upload_only || self.error.is_some(),
            sequential: self.sequential,
            transfer_download_rate: self.download_rate.bps(),
            num_transfer_peers: self.links.len(),
            download_channel: &self.bandwidth.down,
        };
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        link.request_block(self.picker.as_mut(), &ctx);
        link.send_block_requests(self.picker.as_mut(), &ctx);
    }

    /// Periodic maintenance: rates, request timeouts, refilling queues and
    /// resuming uploads held back by the quota.
    pub fn second_tick(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        self.download_rate.add_snapshot(self.counters.fetched_bytes, now);
        let mut picker = self.picker.as_mut();
        for link in self.links.values_mut() {
            link.tick(now);
            link.abort_expired_requests(picker.as_deref_mut(), now, self.settings.request_timeout);
            link.check_piece_timeout(picker.as_deref_mut(), now, self.settings.piece_timeout);
        }
        let addrs: Vec<_> = self.links.keys().copied().collect();
        for addr in addrs {
            self.request_blocks(addr);
            self.serve_uploads(addr);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        self.paused = true;
        let addrs: Vec<_> = self.links.keys().copied().collect();
        for addr in addrs {
            self.detach_link(addr, "transfer paused", false, now);
        }
        if self.state == TransferState::Checking {
            // restart from scratch when resumed
            self.checking_piece = None;
            self.set_state(TransferState::Queued);
        }
        self.resume_dirty = true;
        self.alerts.emit(AlertKind::Paused);
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.resume_dirty = true;
        self.alerts.emit(AlertKind::Resumed);
    }

    pub fn set_upload_only(&mut self, upload_only: bool) {
        let was = std::mem::replace(&mut self.upload_only, upload_only);
        if upload_only {
            let mut picker = self.picker.as_mut();
            for link in self.links.values_mut() {
                link.abort_all_requests(picker.as_deref_mut());
            }
        } else if was {
            self.request_upload_from_links();
        }
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        self.sequential = sequential;
    }

    pub fn set_piece_priority(&mut self, piece: u32, priority: u8) -> Result<()> {
        let picker = self.picker.as_mut().ok_or(Error::NoPicker)?;
        if !picker.set_piece_priority(piece, priority) {
            return Ok(());
        }
        if self.state == TransferState::Finished && !picker.is_finished() {
            // a filtered piece became wanted again
            self.policy.set_finished(false);
            self.set_state(TransferState::Downloading);
            self.request_upload_from_links();
        }
        self.check_finished();
        Ok(())
    }

    /// Detaches every link ahead of shutdown.
    pub fn shutdown(&mut self, now: Instant) {
        let addrs: Vec<_> = self.links.keys().copied().collect();
        for addr in addrs {
            self.detach_link(addr, "session shutting down", false, now);
        }
    }
}
