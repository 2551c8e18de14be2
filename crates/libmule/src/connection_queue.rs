//! Half-open connection admission control.
//!
//! Callers enqueue connection attempts; the queue grants at most
//! `half_open_limit` of them at a time by calling `on_connect`, and gives
//! each granted attempt a deadline. The caller reports completion with
//! [`ConnectionQueue::done`]. Attempts that neither complete nor get
//! cancelled before their deadline are expired through `on_timeout`.
//!
//! Callbacks are never invoked while the internal lock is held, so they may
//! call back into the queue.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub type Ticket = u64;
pub type OnConnect = Box<dyn FnOnce(Ticket) + Send + 'static>;
pub type OnTimeout = Box<dyn FnOnce(Ticket) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConnectPriority {
    /// Queued at the back. Aborted by [`ConnectionQueue::close`].
    #[default]
    Normal = 0,
    /// Queued at the front. Aborted by [`ConnectionQueue::close`].
    High = 1,
    /// Queued at the front and survives [`ConnectionQueue::close`].
    Critical = 2,
}

struct Entry {
    ticket: Ticket,
    priority: ConnectPriority,
    timeout: Duration,
    on_connect: Option<OnConnect>,
    on_timeout: Option<OnTimeout>,
    connecting: bool,
    // None while queued, which sorts as "never expires".
    expires: Option<Instant>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("ticket", &self.ticket)
            .field("priority", &self.priority)
            .field("connecting", &self.connecting)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Entry>,
    next_ticket: Ticket,
    num_connecting: usize,
    half_open_limit: usize,
    aborted: bool,
    timer: Option<Instant>,
}

impl Inner {
    fn nearest_expiry(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|e| e.connecting)
            .filter_map(|e| e.expires)
            .min()
    }

    // Returns true if the armed deadline moved.
    fn rearm(&mut self) -> bool {
        let next = self.nearest_expiry();
        let changed = next != self.timer;
        self.timer = next;
        changed
    }
}

#[derive(Clone)]
pub struct ConnectionQueue {
    inner: Arc<Mutex<Inner>>,
    timer_changed: Arc<Notify>,
}

impl std::fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock();
        f.debug_struct("ConnectionQueue")
            .field("size", &g.queue.len())
            .field("num_connecting", &g.num_connecting)
            .field("half_open_limit", &g.half_open_limit)
            .finish()
    }
}

impl ConnectionQueue {
    /// A limit of 0 means unlimited.
    pub fn new(half_open_limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                next_ticket: 0,
                num_connecting: 0,
                half_open_limit,
                aborted: false,
                timer: None,
            })),
            timer_changed: Arc::new(Notify::new()),
        }
    }

    /// Queues a connection attempt and returns its ticket, the same value
    /// `on_connect` later receives.
    ///
    /// Once the queue is closed, attempts below [`ConnectPriority::Critical`]
    /// are refused by calling `on_timeout` right away.
    pub fn enqueue(
        &self,
        on_connect: OnConnect,
        on_timeout: OnTimeout,
        timeout: Duration,
        priority: ConnectPriority,
    ) -> Ticket {
        let ticket = {
            let mut g = self.inner.lock();
            let ticket = g.next_ticket;
            g.next_ticket += 1;

            if g.aborted && priority < ConnectPriority::Critical {
                drop(g);
                debug!(ticket, "queue is closed, refusing connection attempt");
                on_timeout(ticket);
                return ticket;
            }

            let entry = Entry {
                ticket,
                priority,
                timeout,
                on_connect: Some(on_connect),
                on_timeout: Some(on_timeout),
                connecting: false,
                expires: None,
            };
            match priority {
                ConnectPriority::Normal => g.queue.push_back(entry),
                ConnectPriority::High | ConnectPriority::Critical => g.queue.push_front(entry),
            }
            ticket
        };
        trace!(ticket, ?priority, "enqueued connection attempt");
        self.try_connect();
        ticket
    }

    /// Reports a finished (or cancelled) attempt, freeing its half-open slot.
    /// Unknown tickets are ignored.
    pub fn done(&self, ticket: Ticket) {
        {
            let mut g = self.inner.lock();
            let Some(pos) = g.queue.iter().position(|e| e.ticket == ticket) else {
                trace!(ticket, "done() for unknown ticket");
                return;
            };
            if let Some(e) = g.queue.remove(pos) {
                if e.connecting {
                    g.num_connecting -= 1;
                }
            }
            if g.rearm() {
                self.timer_changed.notify_one();
            }
        }
        self.try_connect();
    }

    /// Expires every granted attempt whose deadline is at or before `now`.
    pub fn on_timer(&self, now: Instant) {
        let expired = {
            let mut g = self.inner.lock();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < g.queue.len() {
                let is_expired = {
                    let e = &g.queue[i];
                    e.connecting && e.expires.is_some_and(|exp| exp <= now)
                };
                if !is_expired {
                    i += 1;
                    continue;
                }
                if let Some(mut e) = g.queue.remove(i) {
                    g.num_connecting -= 1;
                    debug!(ticket = e.ticket, "connection attempt timed out");
                    if let Some(cb) = e.on_timeout.take() {
                        expired.push((e.ticket, cb));
                    }
                }
            }
            if g.rearm() {
                self.timer_changed.notify_one();
            }
            expired
        };
        for (ticket, cb) in expired {
            cb(ticket);
        }
        self.try_connect();
    }

    /// Aborts everything below [`ConnectPriority::Critical`] and refuses
    /// further such attempts. Critical attempts stay queued.
    pub fn close(&self) {
        let aborted = {
            let mut g = self.inner.lock();
            g.aborted = true;
            let mut aborted = Vec::new();
            let mut kept = VecDeque::with_capacity(g.queue.len());
            let mut num_connecting = g.num_connecting;
            for mut e in g.queue.drain(..) {
                if e.priority == ConnectPriority::Critical {
                    kept.push_back(e);
                    continue;
                }
                if e.connecting {
                    num_connecting -= 1;
                }
                if let Some(cb) = e.on_timeout.take() {
                    aborted.push((e.ticket, cb));
                }
            }
            g.queue = kept;
            g.num_connecting = num_connecting;
            if g.rearm() {
                self.timer_changed.notify_one();
            }
            aborted
        };
        debug!(aborted = aborted.len(), "connection queue closed");
        for (ticket, cb) in aborted {
            cb(ticket);
        }
        self.try_connect();
    }

    pub fn set_half_open_limit(&self, limit: usize) {
        self.inner.lock().half_open_limit = limit;
        self.try_connect();
    }

    pub fn half_open_limit(&self) -> usize {
        self.inner.lock().half_open_limit
    }

    pub fn num_connecting(&self) -> usize {
        self.inner.lock().num_connecting
    }

    /// Queued plus granted attempts.
    pub fn size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().aborted
    }

    /// The deadline the timer is currently armed for.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.inner.lock().timer
    }

    fn try_connect(&self) {
        let granted = {
            let mut g = self.inner.lock();
            let now = Instant::now();
            let limit = g.half_open_limit;
            let mut num_connecting = g.num_connecting;
            let mut granted = Vec::new();
            for e in g.queue.iter_mut() {
                if limit != 0 && num_connecting >= limit {
                    break;
                }
                if e.connecting {
                    continue;
                }
                e.connecting = true;
                e.expires = Some(now + e.timeout);
                num_connecting += 1;
                if let Some(cb) = e.on_connect.take() {
                    granted.push((e.ticket, cb));
                }
            }
            g.num_connecting = num_connecting;
            if g.rearm() {
                self.timer_changed.notify_one();
            }
            granted
        };
        for (ticket, cb) in granted {
            trace!(ticket, "granted connection attempt");
            cb(ticket);
        }
    }

    /// Drives [`Self::on_timer`] from the armed deadline until cancelled.
    pub async fn run_timer(self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        loop {
            let deadline = self.next_expiry();
            let sleep = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                    None => futures::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancellation_token.cancelled() => return Ok(()),
                _ = self.timer_changed.notified() => continue,
                _ = sleep => self.on_timer(Instant::now()),
            }
        }
    }
}
