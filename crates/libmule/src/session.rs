//! The event loop all transfers live on.
//!
//! Every piece of engine state is owned by one task. Public calls on
//! [`Session`] are posted to it as commands and answered over a
//! oneshot. Disk jobs run on the blocking pool and come back as commands
//! too, as do admission grants and timeouts, so nothing is mutated from
//! outside the loop.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use libmule_core::{
    Id16,
    spawn_utils::{spawn, spawn_blocking, spawn_with_cancel},
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error_span, info, trace, warn};

use crate::{
    alerts::{Alert, AlertKind, SessionAlertBus, TransferAlertBus},
    bandwidth::{BandwidthConfig, BandwidthManager},
    connection_queue::{ConnectionQueue, OnConnect, OnTimeout, Ticket},
    disk::{DiskCompletion, run_job},
    error::{Error, Result},
    message::{PeerMessage, WriterRequest},
    peer_link::{LinkSettings, stats::PeerLinkStats},
    policy::PeerSource,
    resume_data::{ResumeData, ResumeDataStore},
    storage::TransferStorage,
    transfer::{AddTransferParams, Transfer, TransferSettings, TransferStatus},
    type_aliases::PeerTx,
};

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Outbound connection attempts in flight at once. 0 means no limit.
    pub half_open_limit: usize,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub connect_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub request_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub piece_timeout: Duration,
    pub desired_queue_size: usize,
    pub max_busy_blocks: usize,
    pub max_failcount: u32,
    pub max_peers_per_transfer: usize,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub tick_interval: Duration,
    pub download_bps: Option<usize>,
    pub upload_bps: Option<usize>,
    pub resume_folder: Option<PathBuf>,
    pub persist_resume_data: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            half_open_limit: 8,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(60),
            piece_timeout: Duration::from_secs(20),
            desired_queue_size: 4,
            max_busy_blocks: 1,
            max_failcount: 3,
            max_peers_per_transfer: 50,
            tick_interval: Duration::from_secs(1),
            download_bps: None,
            upload_bps: None,
            resume_folder: None,
            persist_resume_data: true,
        }
    }
}

impl SessionOptions {
    fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            link: LinkSettings {
                desired_queue_size: self.desired_queue_size,
                max_busy_blocks: self.max_busy_blocks,
            },
            request_timeout: self.request_timeout,
            piece_timeout: self.piece_timeout,
            connect_timeout: self.connect_timeout,
            max_peers: self.max_peers_per_transfer,
            max_failcount: self.max_failcount,
        }
    }
}

/// Dials peers. Implementations do the handshake and file request for
/// `hash`, then feed whatever the peer sends to `session` and return the
/// channel its writer drains.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(&self, session: Session, hash: Id16, addr: SocketAddr) -> anyhow::Result<PeerTx>;
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    AddTransfer {
        params: AddTransferParams,
        storage: Arc<dyn TransferStorage>,
        reply: Reply<()>,
    },
    RemoveTransfer {
        hash: Id16,
        reply: Reply<()>,
    },
    Pause {
        hash: Id16,
        reply: Reply<()>,
    },
    Resume {
        hash: Id16,
        reply: Reply<()>,
    },
    SetSequential {
        hash: Id16,
        sequential: bool,
        reply: Reply<()>,
    },
    SetUploadOnly {
        hash: Id16,
        upload_only: bool,
        reply: Reply<()>,
    },
    SetPiecePriority {
        hash: Id16,
        piece: u32,
        priority: u8,
        reply: Reply<()>,
    },
    PieceAvailability {
        hash: Id16,
        reply: Reply<Vec<u32>>,
    },
    Status {
        hash: Id16,
        reply: Reply<TransferStatus>,
    },
    PeerStats {
        hash: Id16,
        reply: Reply<Vec<PeerLinkStats>>,
    },
    AddPeer {
        hash: Id16,
        addr: SocketAddr,
        source: PeerSource,
        reply: Reply<bool>,
    },
    IncomingConnection {
        hash: Id16,
        addr: SocketAddr,
        tx: PeerTx,
        reply: Reply<()>,
    },
    PeerMessage {
        hash: Id16,
        addr: SocketAddr,
        msg: PeerMessage,
        reply: Reply<()>,
    },
    PeerDisconnected {
        hash: Id16,
        addr: SocketAddr,
        reason: String,
    },
    /// The admission queue granted a slot.
    Connect {
        hash: Id16,
        addr: SocketAddr,
        ticket: Ticket,
    },
    Connected {
        hash: Id16,
        addr: SocketAddr,
        ticket: Ticket,
        result: anyhow::Result<PeerTx>,
    },
    ConnectTimedOut {
        hash: Id16,
        addr: SocketAddr,
        ticket: Ticket,
    },
    Disk {
        hash: Id16,
        completion: DiskCompletion,
    },
    SaveResumeData {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum ResumeWrite {
    Save(ResumeData, TransferAlertBus),
    Delete(Id16),
    Flush(oneshot::Sender<()>),
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    tx: mpsc::UnboundedSender<SessionCommand>,
    alerts: SessionAlertBus,
    queue: ConnectionQueue,
    bandwidth: Arc<BandwidthManager>,
    resume_store: Option<ResumeDataStore>,
    cancellation_token: CancellationToken,
}

impl Session {
    pub async fn new(opts: SessionOptions, connector: Arc<dyn PeerConnector>) -> anyhow::Result<Self> {
        let resume_store = match opts.resume_folder.clone() {
            Some(folder) => Some(
                ResumeDataStore::new(folder)
                    .await
                    .context("error initializing resume data store")?,
            ),
            None => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let queue = ConnectionQueue::new(opts.half_open_limit);
        let session = Self {
            tx,
            alerts: SessionAlertBus::new(),
            queue: queue.clone(),
            bandwidth: Arc::new(BandwidthManager::new(BandwidthConfig {
                upload_bps: opts.upload_bps,
                download_bps: opts.download_bps,
            })),
            resume_store: resume_store.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        spawn_with_cancel(
            error_span!("connection_queue_timer"),
            cancellation_token.clone(),
            queue.run_timer(cancellation_token.clone()),
        );

        let resume_tx = match resume_store.filter(|_| opts.persist_resume_data) {
            Some(store) => {
                let (resume_tx, resume_rx) = mpsc::unbounded_channel();
                spawn(error_span!("resume_data_writer"), run_resume_writer(store, resume_rx));
                Some(resume_tx)
            }
            None => None,
        };

        let event_loop = SessionLoop {
            tick_interval: opts.tick_interval,
            settings: opts.transfer_settings(),
            transfers: HashMap::new(),
            order: Vec::new(),
            check_queue: VecDeque::new(),
            checking: None,
            connector,
            resume_tx,
            handle: session.clone(),
        };
        spawn_with_cancel(error_span!("session"), cancellation_token, event_loop.run(rx));
        Ok(session)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| Error::SessionDestroyed)?;
        rx.await.map_err(|_| Error::SessionDestroyed)?
    }

    /// Adds a transfer. Resume data is looked up in the resume folder unless
    /// `params` already carries some.
    pub async fn add_transfer(&self, mut params: AddTransferParams, storage: Arc<dyn TransferStorage>) -> Result<()> {
        if params.resume.is_none() {
            if let Some(store) = self.resume_store.as_ref() {
                match store.load(&params.hash).await {
                    Ok(rd) => params.resume = rd,
                    Err(e) => warn!(hash = %params.hash, "ignoring resume data: {e:#}"),
                }
            }
        }
        self.request(|reply| SessionCommand::AddTransfer {
            params,
            storage,
            reply,
        })
        .await
    }

    pub async fn remove_transfer(&self, hash: Id16) -> Result<()> {
        self.request(|reply| SessionCommand::RemoveTransfer { hash, reply })
            .await
    }

    pub async fn pause(&self, hash: Id16) -> Result<()> {
        self.request(|reply| SessionCommand::Pause { hash, reply })
            .await
    }

    pub async fn resume(&self, hash: Id16) -> Result<()> {
        self.request(|reply| SessionCommand::Resume { hash, reply })
            .await
    }

    pub async fn set_sequential_download(&self, hash: Id16, sequential: bool) -> Result<()> {
        self.request(|reply| SessionCommand::SetSequential {
            hash,
            sequential,
            reply,
        })
        .await
    }

    pub async fn set_upload_only(&self, hash: Id16, upload_only: bool) -> Result<()> {
        self.request(|reply| SessionCommand::SetUploadOnly {
            hash,
            upload_only,
            reply,
        })
        .await
    }

    pub async fn set_piece_priority(&self, hash: Id16, piece: u32, priority: u8) -> Result<()> {
        self.request(|reply| SessionCommand::SetPiecePriority {
            hash,
            piece,
            priority,
            reply,
        })
        .await
    }

    /// How many connected peers have each piece.
    pub async fn piece_availability(&self, hash: Id16) -> Result<Vec<u32>> {
        self.request(|reply| SessionCommand::PieceAvailability { hash, reply })
            .await
    }

    pub async fn transfer_status(&self, hash: Id16) -> Result<TransferStatus> {
        self.request(|reply| SessionCommand::Status { hash, reply })
            .await
    }

    pub async fn peer_stats(&self, hash: Id16) -> Result<Vec<PeerLinkStats>> {
        self.request(|reply| SessionCommand::PeerStats { hash, reply })
            .await
    }

    /// Returns false if the peer was already known.
    pub async fn add_peer(&self, hash: Id16, addr: SocketAddr, source: PeerSource) -> Result<bool> {
        self.request(|reply| SessionCommand::AddPeer {
            hash,
            addr,
            source,
            reply,
        })
        .await
    }

    /// Attaches a peer that connected to us and asked for `hash`.
    pub async fn incoming_connection(&self, hash: Id16, addr: SocketAddr, tx: PeerTx) -> Result<()> {
        self.request(|reply| SessionCommand::IncomingConnection {
            hash,
            addr,
            tx,
            reply,
        })
        .await
    }

    /// Delivers one decoded message. An error means the peer was dropped.
    pub async fn peer_message(&self, hash: Id16, addr: SocketAddr, msg: PeerMessage) -> Result<()> {
        self.request(|reply| SessionCommand::PeerMessage {
            hash,
            addr,
            msg,
            reply,
        })
        .await
    }

    pub fn peer_disconnected(&self, hash: Id16, addr: SocketAddr, reason: impl Into<String>) {
        let _ = self.tx.send(SessionCommand::PeerDisconnected {
            hash,
            addr,
            reason: reason.into(),
        });
    }

    pub fn set_half_open_limit(&self, limit: usize) {
        self.queue.set_half_open_limit(limit);
    }

    pub fn connection_queue(&self) -> &ConnectionQueue {
        &self.queue
    }

    pub fn set_download_bps(&self, bps: Option<usize>) {
        self.bandwidth.set_download_bps(bps);
    }

    pub fn set_upload_bps(&self, bps: Option<usize>) {
        self.bandwidth.set_upload_bps(bps);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Writes resume data of every transfer and waits for it to hit disk.
    pub async fn save_resume_data(&self) -> Result<()> {
        self.request(|reply| SessionCommand::SaveResumeData { reply })
            .await
    }

    /// Detaches all peers, aborts pending connection attempts, flushes resume
    /// data and stops the loop.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        self.cancellation_token.cancel();
    }
}

async fn run_resume_writer(store: ResumeDataStore, mut rx: mpsc::UnboundedReceiver<ResumeWrite>) -> anyhow::Result<()> {
    while let Some(w) = rx.recv().await {
        match w {
            ResumeWrite::Save(rd, alerts) => match store.save(&rd).await {
                Ok(()) => alerts.emit(AlertKind::ResumeDataSaved),
                Err(e) => warn!(hash = %rd.hash, "error saving resume data: {e:#}"),
            },
            ResumeWrite::Delete(hash) => {
                if let Err(e) = store.delete(&hash).await {
                    warn!(%hash, "error deleting resume data: {e:#}");
                }
            }
            ResumeWrite::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    Ok(())
}

struct ManagedTransfer {
    transfer: Transfer,
    storage: Arc<dyn TransferStorage>,
}

struct SessionLoop {
    tick_interval: Duration,
    settings: TransferSettings,
    transfers: HashMap<Id16, ManagedTransfer>,
    // Insertion order, which is also the queue position.
    order: Vec<Id16>,
    // Transfers waiting to check their data, one at a time.
    check_queue: VecDeque<Id16>,
    checking: Option<Id16>,
    connector: Arc<dyn PeerConnector>,
    resume_tx: Option<mpsc::UnboundedSender<ResumeWrite>>,
    handle: Session,
}

impl SessionLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(());
                    };
                    if let SessionCommand::Shutdown { reply } = cmd {
                        self.shutdown(reply);
                        return Ok(());
                    }
                    self.on_command(cmd);
                }
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
            self.after_event();
        }
    }

    fn get_mut(&mut self, hash: &Id16) -> Result<&mut Transfer> {
        self.transfers
            .get_mut(hash)
            .map(|m| &mut m.transfer)
            .ok_or(Error::TransferNotFound(*hash))
    }

    fn get(&self, hash: &Id16) -> Result<&Transfer> {
        self.transfers
            .get(hash)
            .map(|m| &m.transfer)
            .ok_or(Error::TransferNotFound(*hash))
    }

    fn on_command(&mut self, cmd: SessionCommand) {
        let now = Instant::now();
        match cmd {
            SessionCommand::AddTransfer {
                params,
                storage,
                reply,
            } => {
                let _ = reply.send(self.add_transfer(params, storage));
            }
            SessionCommand::RemoveTransfer { hash, reply } => {
                let _ = reply.send(self.remove_transfer(hash, now));
            }
            SessionCommand::Pause { hash, reply } => {
                let r = self.get_mut(&hash).map(|t| t.pause(now));
                if r.is_ok() {
                    self.dequeue_check(hash);
                }
                let _ = reply.send(r);
            }
            SessionCommand::Resume { hash, reply } => {
                let _ = reply.send(self.get_mut(&hash).map(|t| t.resume()));
            }
            SessionCommand::SetSequential {
                hash,
                sequential,
                reply,
            } => {
                let _ = reply.send(self.get_mut(&hash).map(|t| t.set_sequential(sequential)));
            }
            SessionCommand::SetUploadOnly {
                hash,
                upload_only,
                reply,
            } => {
                let _ = reply.send(self.get_mut(&hash).map(|t| t.set_upload_only(upload_only)));
            }
            SessionCommand::SetPiecePriority {
                hash,
                piece,
                priority,
                reply,
            } => {
                let _ = reply.send(
                    self.get_mut(&hash)
                        .and_then(|t| t.set_piece_priority(piece, priority)),
                );
            }
            SessionCommand::PieceAvailability { hash, reply } => {
                let _ = reply.send(
                    self.get(&hash)
                        .and_then(|t| t.piece_availability().ok_or(Error::NoPicker)),
                );
            }
            SessionCommand::Status { hash, reply } => {
                let _ = reply.send(self.get(&hash).map(|t| t.status()));
            }
            SessionCommand::PeerStats { hash, reply } => {
                let _ = reply.send(self.get(&hash).map(|t| t.peer_stats()));
            }
            SessionCommand::AddPeer {
                hash,
                addr,
                source,
                reply,
            } => {
                let _ = reply.send(self.get_mut(&hash).map(|t| t.add_peer(addr, source)));
            }
            SessionCommand::IncomingConnection {
                hash,
                addr,
                tx,
                reply,
            } => {
                let r = self.get_mut(&hash).and_then(|t| {
                    t.add_peer(addr, PeerSource::Incoming);
                    t.attach_link(addr, tx.clone(), now)
                });
                if r.is_err() {
                    let _ = tx.send(WriterRequest::Disconnect);
                }
                let _ = reply.send(r);
            }
            SessionCommand::PeerMessage {
                hash,
                addr,
                msg,
                reply,
            } => {
                let _ = reply.send(self.get_mut(&hash).and_then(|t| t.on_peer_message(addr, msg, now)));
            }
            SessionCommand::PeerDisconnected { hash, addr, reason } => {
                if let Ok(t) = self.get_mut(&hash) {
                    t.detach_link(addr, &reason, false, now);
                }
            }
            SessionCommand::Connect { hash, addr, ticket } => self.on_connect_granted(hash, addr, ticket),
            SessionCommand::Connected {
                hash,
                addr,
                ticket,
                result,
            } => self.on_connected(hash, addr, ticket, result, now),
            SessionCommand::ConnectTimedOut { hash, addr, ticket } => {
                if let Ok(t) = self.get_mut(&hash) {
                    if t.on_connect_timed_out(addr, ticket, now) {
                        debug!(transfer = %hash, peer = %addr, ticket, "{}", Error::AdmissionTimeout);
                    }
                }
            }
            SessionCommand::Disk { hash, completion } => match self.get_mut(&hash) {
                Ok(t) => t.on_disk_completion(completion, now),
                Err(_) => trace!(transfer = %hash, "disk completion for removed transfer"),
            },
            SessionCommand::SaveResumeData { reply } => {
                for m in self.transfers.values() {
                    self.save_resume_data(&m.transfer);
                }
                self.flush_resume_data(reply);
            }
            SessionCommand::Shutdown { reply } => self.shutdown(reply),
        }
    }

    fn add_transfer(&mut self, params: AddTransferParams, storage: Arc<dyn TransferStorage>) -> Result<()> {
        let hash = params.hash;
        if self.transfers.contains_key(&hash) {
            return Err(Error::TransferAlreadyExists(hash));
        }
        let transfer = Transfer::new(
            params,
            self.settings,
            self.handle.bandwidth.clone(),
            self.handle.alerts.new_transfer_bus(hash),
            self.order.len(),
        )?;
        info!(transfer = %hash, size = transfer.lengths().total_length(), "added transfer");
        self.transfers.insert(hash, ManagedTransfer { transfer, storage });
        self.order.push(hash);
        Ok(())
    }

    fn remove_transfer(&mut self, hash: Id16, now: Instant) -> Result<()> {
        let mut m = self
            .transfers
            .remove(&hash)
            .ok_or(Error::TransferNotFound(hash))?;
        self.dequeue_check(hash);
        m.transfer.shutdown(now);
        m.transfer.alerts().emit(AlertKind::Removed);
        if let Some(tx) = self.resume_tx.as_ref() {
            let _ = tx.send(ResumeWrite::Delete(hash));
        }
        self.order.retain(|h| *h != hash);
        for (pos, h) in self.order.iter().enumerate() {
            if let Some(m) = self.transfers.get_mut(h) {
                m.transfer.set_queue_position(pos);
            }
        }
        info!(transfer = %hash, "removed transfer");
        Ok(())
    }

    /// Puts a transfer in line for checking its data.
    fn queue_check(&mut self, hash: Id16) {
        if self.checking != Some(hash) && !self.check_queue.contains(&hash) {
            trace!(transfer = %hash, "queued for checking");
            self.check_queue.push_back(hash);
        }
    }

    fn dequeue_check(&mut self, hash: Id16) {
        self.check_queue.retain(|h| *h != hash);
        if self.checking == Some(hash) {
            self.checking = None;
        }
    }

    fn update_check_queue(&mut self) {
        let waiting: Vec<Id16> = self
            .order
            .iter()
            .filter(|h| {
                self.transfers
                    .get(*h)
                    .is_some_and(|m| m.transfer.needs_check())
            })
            .copied()
            .collect();
        for hash in waiting {
            self.queue_check(hash);
        }

        if let Some(hash) = self.checking {
            if self.get(&hash).is_ok_and(|t| t.is_checking()) {
                return;
            }
            self.checking = None;
        }
        while let Some(hash) = self.check_queue.pop_front() {
            if let Some(m) = self.transfers.get_mut(&hash) {
                if m.transfer.needs_check() {
                    m.transfer.start_checking();
                    self.checking = Some(hash);
                    return;
                }
            }
        }
    }

    fn on_connect_granted(&mut self, hash: Id16, addr: SocketAddr, ticket: Ticket) {
        let still_wanted = self
            .get(&hash)
            .is_ok_and(|t| t.connecting_ticket(&addr) == Some(ticket));
        if !still_wanted {
            self.handle.queue.done(ticket);
            return;
        }
        let connector = self.connector.clone();
        let session = self.handle.clone();
        spawn(
            debug_span!("connect", transfer = %hash, peer = %addr, ticket),
            async move {
                let result = connector.connect(session.clone(), hash, addr).await;
                let _ = session.tx.send(SessionCommand::Connected {
                    hash,
                    addr,
                    ticket,
                    result,
                });
                Ok(())
            },
        );
    }

    fn on_connected(&mut self, hash: Id16, addr: SocketAddr, ticket: Ticket, result: anyhow::Result<PeerTx>, now: Instant) {
        self.handle.queue.done(ticket);
        let Ok(t) = self.get_mut(&hash) else {
            if let Ok(tx) = result {
                let _ = tx.send(WriterRequest::Disconnect);
            }
            return;
        };
        if t.connecting_ticket(&addr) != Some(ticket) {
            // timed out or superseded meanwhile
            if let Ok(tx) = result {
                let _ = tx.send(WriterRequest::Disconnect);
            }
            return;
        }
        match result {
            Ok(tx) => {
                if let Err(e) = t.attach_link(addr, tx.clone(), now) {
                    debug!(transfer = %hash, peer = %addr, "not attaching: {e}");
                    let _ = tx.send(WriterRequest::Disconnect);
                    t.on_connect_aborted(addr, false, now);
                }
            }
            Err(e) => {
                debug!(transfer = %hash, peer = %addr, "error connecting: {e:#}");
                t.on_connect_aborted(addr, true, now);
            }
        }
    }

    fn connect_peers(&mut self) {
        for (hash, m) in self.transfers.iter_mut() {
            let hash = *hash;
            while m.transfer.wants_more_peers() {
                let tx = self.handle.tx.clone();
                let started = m.transfer.connect_one_peer(&self.handle.queue, |addr| {
                    let timeout_tx = tx.clone();
                    let on_connect: OnConnect = Box::new(move |ticket: Ticket| {
                        let _ = tx.send(SessionCommand::Connect { hash, addr, ticket });
                    });
                    let on_timeout: OnTimeout = Box::new(move |ticket: Ticket| {
                        let _ = timeout_tx.send(SessionCommand::ConnectTimedOut { hash, addr, ticket });
                    });
                    (on_connect, on_timeout)
                });
                if started.is_none() {
                    break;
                }
            }
        }
    }

    fn spawn_disk_jobs(&mut self) {
        for (hash, m) in self.transfers.iter_mut() {
            for job in m.transfer.take_disk_jobs() {
                let hash = *hash;
                let storage = m.storage.clone();
                let tx = self.handle.tx.clone();
                spawn_blocking(debug_span!("disk", transfer = %hash), move || {
                    let completion = run_job(&*storage, job);
                    let _ = tx.send(SessionCommand::Disk { hash, completion });
                });
            }
        }
    }

    fn save_resume_data(&self, t: &Transfer) {
        if let Some(tx) = self.resume_tx.as_ref() {
            let _ = tx.send(ResumeWrite::Save(t.write_resume_data(), t.alerts().clone()));
        }
    }

    fn flush_resume_data(&self, reply: Reply<()>) {
        let Some(tx) = self.resume_tx.as_ref() else {
            let _ = reply.send(Ok(()));
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(ResumeWrite::Flush(done_tx)).is_err() {
            let _ = reply.send(Err(Error::SessionDestroyed));
            return;
        }
        spawn(debug_span!("flush_resume_data"), async move {
            let r = done_rx.await.map_err(|_| Error::SessionDestroyed);
            let _ = reply.send(r);
            Ok(())
        });
    }

    fn on_tick(&mut self, now: Instant) {
        for m in self.transfers.values_mut() {
            m.transfer.second_tick(now);
        }
    }

    // Housekeeping after every command and tick.
    fn after_event(&mut self) {
        self.update_check_queue();
        self.connect_peers();
        self.spawn_disk_jobs();
        for m in self.transfers.values_mut() {
            if m.transfer.take_resume_dirty() {
                if let Some(tx) = self.resume_tx.as_ref() {
                    let _ = tx.send(ResumeWrite::Save(
                        m.transfer.write_resume_data(),
                        m.transfer.alerts().clone(),
                    ));
                }
            }
        }
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        info!("shutting down");
        let now = Instant::now();
        self.handle.queue.close();
        for m in self.transfers.values_mut() {
            m.transfer.shutdown(now);
        }
        for m in self.transfers.values() {
            self.save_resume_data(&m.transfer);
        }
        match self.resume_tx.as_ref() {
            Some(tx) => {
                let (done_tx, done_rx) = oneshot::channel();
                let _ = tx.send(ResumeWrite::Flush(done_tx));
                spawn(debug_span!("shutdown_flush"), async move {
                    let _ = done_rx.await;
                    let _ = reply.send(());
                    Ok(())
                });
            }
            None => {
                let _ = reply.send(());
            }
        }
    }
}
