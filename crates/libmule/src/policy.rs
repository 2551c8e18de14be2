//! Known peers of a transfer and the choice of whom to dial next.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, trace};

use crate::{
    connection_queue::{ConnectPriority, ConnectionQueue, OnConnect, OnTimeout, Ticket},
    type_aliases::PeerHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    Server,
    SourceExchange,
    Incoming,
    Resume,
}

#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    /// The live link, if any.
    pub connection: Option<PeerHandle>,
    /// Set while an outgoing attempt holds an admission ticket.
    pub connecting: Option<Ticket>,
    pub failcount: u32,
    pub last_connected: Option<Instant>,
    pub seed: bool,
    pub banned: bool,
}

impl KnownPeer {
    fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            connection: None,
            connecting: None,
            failcount: 0,
            last_connected: None,
            seed: false,
            banned: false,
        }
    }
}

#[derive(Debug)]
pub struct PeerPolicy {
    peers: BTreeMap<SocketAddr, KnownPeer>,
    max_failcount: u32,
    finished: bool,
    num_connect_candidates: usize,
}

impl PeerPolicy {
    pub fn new(max_failcount: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            max_failcount,
            finished: false,
            num_connect_candidates: 0,
        }
    }

    /// A peer worth dialing: not connected or connecting, not failed too
    /// often, has a usable port, and isn't a seed once we are finished.
    pub fn is_connect_candidate(&self, p: &KnownPeer) -> bool {
        p.connection.is_none()
            && p.connecting.is_none()
            && p.failcount < self.max_failcount
            && p.addr.port() != 0
            && !p.banned
            && !(self.finished && p.seed)
    }

    pub fn recalculate_connect_candidates(&mut self) {
        self.num_connect_candidates = self
            .peers
            .values()
            .filter(|p| self.is_connect_candidate(p))
            .count();
    }

    pub fn set_finished(&mut self, finished: bool) {
        if self.finished != finished {
            self.finished = finished;
            self.recalculate_connect_candidates();
        }
    }

    pub fn num_connect_candidates(&self) -> usize {
        self.num_connect_candidates
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&KnownPeer> {
        self.peers.get(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownPeer> {
        self.peers.values()
    }

    /// Returns false if the peer was already known.
    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) -> bool {
        if self.peers.contains_key(&addr) {
            return false;
        }
        trace!(%addr, ?source, "new peer");
        self.peers.insert(addr, KnownPeer::new(addr, source));
        self.recalculate_connect_candidates();
        true
    }

    pub fn remove_peer(&mut self, addr: &SocketAddr) -> Option<KnownPeer> {
        let p = self.peers.remove(addr);
        self.recalculate_connect_candidates();
        p
    }

    pub fn ban(&mut self, addr: &SocketAddr) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.banned = true;
        }
        self.recalculate_connect_candidates();
    }

    pub fn set_seed(&mut self, addr: &SocketAddr, seed: bool) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.seed = seed;
        }
        self.recalculate_connect_candidates();
    }

    /// A link got attached, whether we dialed it or it dialed us.
    pub fn set_connection(&mut self, addr: SocketAddr, handle: PeerHandle) {
        let p = self
            .peers
            .entry(addr)
            .or_insert_with(|| KnownPeer::new(addr, PeerSource::Incoming));
        p.connection = Some(handle);
        p.connecting = None;
        self.recalculate_connect_candidates();
    }

    /// A link went away or an attempt failed. Peers that failed
    /// `max_failcount` times are forgotten.
    pub fn connection_closed(&mut self, addr: &SocketAddr, failed: bool, now: Instant) {
        let Some(p) = self.peers.get_mut(addr) else {
            return;
        };
        p.connection = None;
        p.connecting = None;
        p.last_connected = Some(now);
        if failed {
            p.failcount += 1;
            if p.failcount >= self.max_failcount {
                debug!(%addr, failcount = p.failcount, "forgetting peer");
                self.peers.remove(addr);
            }
        }
        self.recalculate_connect_candidates();
    }

    /// The candidate tried least recently. Never tried peers go first.
    pub fn find_connect_candidate(&self) -> Option<SocketAddr> {
        self.peers
            .values()
            .filter(|p| self.is_connect_candidate(p))
            .min_by_key(|p| (p.last_connected, p.addr))
            .map(|p| p.addr)
    }

    /// Hands the best candidate to the admission queue.
    pub fn connect_one_peer(
        &mut self,
        queue: &ConnectionQueue,
        timeout: Duration,
        make_callbacks: impl FnOnce(SocketAddr) -> (OnConnect, OnTimeout),
    ) -> Option<SocketAddr> {
        let addr = self.find_connect_candidate()?;
        let (on_connect, on_timeout) = make_callbacks(addr);
        // Reserve the candidate before enqueueing: the grant may fire synchronously.
        if let Some(p) = self.peers.get_mut(&addr) {
            p.connecting = Some(Ticket::MAX);
        }
        let ticket = queue.enqueue(on_connect, on_timeout, timeout, ConnectPriority::Normal);
        if let Some(p) = self.peers.get_mut(&addr) {
            if p.connecting.is_some() {
                p.connecting = Some(ticket);
            }
        }
        self.recalculate_connect_candidates();
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, n), 4662))
    }

    #[test]
    fn test_candidates() {
        let mut p = PeerPolicy::new(3);
        assert!(p.add_peer(addr(1), PeerSource::Server));
        assert!(!p.add_peer(addr(1), PeerSource::Server));
        p.add_peer(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 0)), PeerSource::Server);
        p.add_peer(addr(3), PeerSource::SourceExchange);
        assert_eq!(p.num_connect_candidates(), 2);

        p.set_connection(addr(1), addr(1));
        assert_eq!(p.num_connect_candidates(), 1);

        p.set_seed(&addr(3), true);
        p.set_finished(true);
        assert_eq!(p.num_connect_candidates(), 0);
        assert_eq!(p.find_connect_candidate(), None);
    }

    #[test]
    fn test_failcount() {
        let mut p = PeerPolicy::new(2);
        p.add_peer(addr(1), PeerSource::Server);
        let now = Instant::now();
        p.connection_closed(&addr(1), true, now);
        assert_eq!(p.get(&addr(1)).unwrap().failcount, 1);
        assert_eq!(p.num_connect_candidates(), 1);
        p.connection_closed(&addr(1), true, now);
        assert!(p.get(&addr(1)).is_none());
        assert_eq!(p.num_connect_candidates(), 0);
    }

    #[test]
    fn test_oldest_tried_first() {
        let mut p = PeerPolicy::new(3);
        let now = Instant::now();
        for i in 1..=3 {
            p.add_peer(addr(i), PeerSource::Server);
        }
        p.connection_closed(&addr(1), false, now + Duration::from_secs(2));
        p.connection_closed(&addr(2), false, now + Duration::from_secs(1));
        assert_eq!(p.find_connect_candidate(), Some(addr(3)));
        p.ban(&addr(3));
        assert_eq!(p.find_connect_candidate(), Some(addr(2)));
    }

    #[test]
    fn test_connect_one_peer() {
        let q = ConnectionQueue::new(1);
        let granted = Arc::new(AtomicUsize::new(0));
        let mut p = PeerPolicy::new(3);
        p.add_peer(addr(1), PeerSource::Server);
        p.add_peer(addr(2), PeerSource::Server);

        let g = granted.clone();
        let dialed = p.connect_one_peer(&q, Duration::from_secs(5), move |_| {
            let on_connect: OnConnect = Box::new(move |_: Ticket| {
                g.fetch_add(1, Ordering::SeqCst);
            });
            let on_timeout: OnTimeout = Box::new(|_: Ticket| {});
            (on_connect, on_timeout)
        });
        assert_eq!(dialed, Some(addr(1)));
        assert_eq!(granted.load(Ordering::SeqCst), 1);
        assert_eq!(p.get(&addr(1)).unwrap().connecting, Some(0));
        assert_eq!(p.num_connect_candidates(), 1);
    }
}
