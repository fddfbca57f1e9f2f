//! Active peer tracking.
//!
//! Each registered peer carries per-kind idleness flags, an exponentially
//! smoothed throughput estimate per data kind and a smoothed round trip
//! time. The registry hands out snapshot lists of idle peers (fastest
//! first) and a median RTT over the currently connected set, which feeds
//! the QoS estimator.

use crate::error::{SyncError, SyncResult};
use crate::{
    MAX_BLOCK_FETCH, MAX_HEADER_FETCH, MAX_LACKING_HASHES, MAX_RECEIPT_FETCH, MAX_STATE_FETCH,
    QOS_TUNING_PEERS, RTT_MAX_ESTIMATE, RTT_MIN_ESTIMATE, THROUGHPUT_IMPACT,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use pyrite_types::{BlockNumber, Hash256, TotalDifficulty};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Opaque peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create an identifier from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The kinds of data a peer can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Block headers.
    Headers,
    /// Block bodies (transactions and uncles).
    Bodies,
    /// Transaction receipts.
    Receipts,
    /// State trie nodes.
    States,
}

/// Outbound request surface of a fully capable peer.
///
/// Implementations enqueue the request and surface the reply through the
/// synchronizer's `deliver_*` methods; sending itself must not block.
pub trait PeerTransport: Send + Sync {
    /// The peer's advertised head block and total difficulty.
    fn head(&self) -> (Hash256, TotalDifficulty);

    /// Request `amount` headers starting at the block with the given hash,
    /// skipping `skip` headers between each.
    fn request_headers_by_hash(&self, origin: Hash256, amount: usize, skip: u64, reverse: bool);

    /// Request `amount` headers starting at the given height, skipping
    /// `skip` headers between each.
    fn request_headers_by_number(&self, origin: BlockNumber, amount: usize, skip: u64, reverse: bool);

    /// Request the bodies of the given blocks.
    fn request_bodies(&self, hashes: Vec<Hash256>);

    /// Request the receipts of the given blocks.
    fn request_receipts(&self, hashes: Vec<Hash256>);

    /// Request raw state trie nodes by hash.
    fn request_node_data(&self, hashes: Vec<Hash256>);
}

/// Outbound request surface of a header-only (light) peer.
pub trait LightPeerTransport: Send + Sync {
    /// The peer's advertised head block and total difficulty.
    fn head(&self) -> (Hash256, TotalDifficulty);

    /// Request `amount` headers starting at the block with the given hash.
    fn request_headers_by_hash(&self, origin: Hash256, amount: usize, skip: u64, reverse: bool);

    /// Request `amount` headers starting at the given height.
    fn request_headers_by_number(&self, origin: BlockNumber, amount: usize, skip: u64, reverse: bool);
}

/// Adapter presenting a light peer as a regular one. Content requests must
/// never be scheduled against it; issuing one is a scheduling bug.
pub struct LightPeerAdapter<T: LightPeerTransport>(pub T);

impl<T: LightPeerTransport> PeerTransport for LightPeerAdapter<T> {
    fn head(&self) -> (Hash256, TotalDifficulty) {
        self.0.head()
    }

    fn request_headers_by_hash(&self, origin: Hash256, amount: usize, skip: u64, reverse: bool) {
        self.0.request_headers_by_hash(origin, amount, skip, reverse)
    }

    fn request_headers_by_number(&self, origin: BlockNumber, amount: usize, skip: u64, reverse: bool) {
        self.0.request_headers_by_number(origin, amount, skip, reverse)
    }

    fn request_bodies(&self, _hashes: Vec<Hash256>) {
        panic!("body retrieval scheduled against a light peer")
    }

    fn request_receipts(&self, _hashes: Vec<Hash256>) {
        panic!("receipt retrieval scheduled against a light peer")
    }

    fn request_node_data(&self, _hashes: Vec<Hash256>) {
        panic!("state retrieval scheduled against a light peer")
    }
}

/// Returned when a fetch is assigned to a peer that is already serving a
/// request of the same kind. This is a scheduler invariant violation, not a
/// network condition.
#[derive(Debug)]
pub struct AlreadyFetching;

/// Smoothed per-peer measurements, guarded by a single lock.
#[derive(Debug, Clone)]
struct Rates {
    header_throughput: f64,
    block_throughput: f64,
    receipt_throughput: f64,
    state_throughput: f64,
    rtt: Duration,
    header_started: Instant,
    block_started: Instant,
    receipt_started: Instant,
    state_started: Instant,
}

impl Rates {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            header_throughput: 0.0,
            block_throughput: 0.0,
            receipt_throughput: 0.0,
            state_throughput: 0.0,
            rtt: Duration::ZERO,
            header_started: now,
            block_started: now,
            receipt_started: now,
            state_started: now,
        }
    }

    fn throughput(&self, kind: DataKind) -> f64 {
        match kind {
            DataKind::Headers => self.header_throughput,
            DataKind::Bodies => self.block_throughput,
            DataKind::Receipts => self.receipt_throughput,
            DataKind::States => self.state_throughput,
        }
    }

    fn throughput_mut(&mut self, kind: DataKind) -> &mut f64 {
        match kind {
            DataKind::Headers => &mut self.header_throughput,
            DataKind::Bodies => &mut self.block_throughput,
            DataKind::Receipts => &mut self.receipt_throughput,
            DataKind::States => &mut self.state_throughput,
        }
    }

    fn started_mut(&mut self, kind: DataKind) -> &mut Instant {
        match kind {
            DataKind::Headers => &mut self.header_started,
            DataKind::Bodies => &mut self.block_started,
            DataKind::Receipts => &mut self.receipt_started,
            DataKind::States => &mut self.state_started,
        }
    }
}

/// A registered peer and the live measurements attached to it.
pub struct SyncPeer {
    id: PeerId,
    version: u32,
    transport: Arc<dyn PeerTransport>,
    header_busy: AtomicBool,
    block_busy: AtomicBool,
    receipt_busy: AtomicBool,
    state_busy: AtomicBool,
    rates: Mutex<Rates>,
    lacking: Mutex<HashSet<Hash256>>,
}

impl SyncPeer {
    /// Create a peer record around a transport.
    pub fn new(id: PeerId, version: u32, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id,
            version,
            transport,
            header_busy: AtomicBool::new(false),
            block_busy: AtomicBool::new(false),
            receipt_busy: AtomicBool::new(false),
            state_busy: AtomicBool::new(false),
            rates: Mutex::new(Rates::new()),
            lacking: Mutex::new(HashSet::new()),
        }
    }

    /// Peer identifier.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Advertised protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// The peer's advertised head block and total difficulty.
    pub fn head(&self) -> (Hash256, TotalDifficulty) {
        self.transport.head()
    }

    fn busy_flag(&self, kind: DataKind) -> &AtomicBool {
        match kind {
            DataKind::Headers => &self.header_busy,
            DataKind::Bodies => &self.block_busy,
            DataKind::Receipts => &self.receipt_busy,
            DataKind::States => &self.state_busy,
        }
    }

    /// Whether the peer can currently accept a request of this kind.
    pub fn is_idle(&self, kind: DataKind) -> bool {
        !self.busy_flag(kind).load(Ordering::Acquire)
    }

    fn begin(&self, kind: DataKind) -> Result<(), AlreadyFetching> {
        if self
            .busy_flag(kind)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AlreadyFetching);
        }
        *self.rates.lock().started_mut(kind) = Instant::now();
        Ok(())
    }

    /// Send a batch header request starting at `from`.
    pub fn fetch_headers(&self, from: BlockNumber, amount: usize) -> Result<(), AlreadyFetching> {
        self.begin(DataKind::Headers)?;
        self.transport.request_headers_by_number(from, amount, 0, false);
        Ok(())
    }

    /// Send a body request for the given blocks.
    pub fn fetch_bodies(&self, hashes: Vec<Hash256>) -> Result<(), AlreadyFetching> {
        self.begin(DataKind::Bodies)?;
        self.transport.request_bodies(hashes);
        Ok(())
    }

    /// Send a receipt request for the given blocks.
    pub fn fetch_receipts(&self, hashes: Vec<Hash256>) -> Result<(), AlreadyFetching> {
        self.begin(DataKind::Receipts)?;
        self.transport.request_receipts(hashes);
        Ok(())
    }

    /// Send a state trie node request.
    pub fn fetch_node_data(&self, hashes: Vec<Hash256>) -> Result<(), AlreadyFetching> {
        self.begin(DataKind::States)?;
        self.transport.request_node_data(hashes);
        Ok(())
    }

    /// Mark the peer idle for `kind` again, folding the measured delivery
    /// rate of `delivered` items into its throughput estimate. A delivery of
    /// nothing resets the throughput so the peer is retried at minimal
    /// capacity.
    pub fn set_idle(&self, kind: DataKind, delivered: usize) {
        {
            let mut rates = self.rates.lock();
            if delivered == 0 {
                *rates.throughput_mut(kind) = 0.0;
            } else {
                let elapsed = rates.started_mut(kind).elapsed() + Duration::from_nanos(1);
                let measured = delivered as f64 / elapsed.as_secs_f64();
                let updated =
                    (1.0 - THROUGHPUT_IMPACT) * rates.throughput(kind) + THROUGHPUT_IMPACT * measured;
                *rates.throughput_mut(kind) = updated;
                rates.rtt = rates.rtt.mul_f64(1.0 - THROUGHPUT_IMPACT)
                    + elapsed.mul_f64(THROUGHPUT_IMPACT);
                trace!(
                    peer = %self.id,
                    ?kind,
                    throughput = updated,
                    rtt_ms = rates.rtt.as_millis() as u64,
                    "Peer measurements updated"
                );
            }
        }
        self.busy_flag(kind).store(false, Ordering::Release);
    }

    /// Number of items of `kind` worth requesting from this peer so the
    /// reply lands within the target round trip time.
    pub fn capacity(&self, kind: DataKind, target_rtt: Duration) -> usize {
        let limit = match kind {
            DataKind::Headers => MAX_HEADER_FETCH,
            DataKind::Bodies => MAX_BLOCK_FETCH,
            DataKind::Receipts => MAX_RECEIPT_FETCH,
            DataKind::States => MAX_STATE_FETCH,
        };
        let throughput = self.rates.lock().throughput(kind);
        let ideal = throughput * target_rtt.as_secs_f64();
        ((ideal.max(1.0) + 1.0).min(limit as f64)) as usize
    }

    /// Smoothed request round trip time for this peer.
    pub fn rtt(&self) -> Duration {
        self.rates.lock().rtt
    }

    /// Remember that the peer does not have the given item, so it is not
    /// reserved to it again.
    pub fn mark_lacking(&self, hash: Hash256) {
        let mut lacking = self.lacking.lock();
        while lacking.len() >= MAX_LACKING_HASHES {
            let evict = lacking.iter().next().copied();
            match evict {
                Some(old) => {
                    lacking.remove(&old);
                }
                None => break,
            }
        }
        lacking.insert(hash);
    }

    /// Whether the peer previously failed to deliver this item.
    pub fn lacks(&self, hash: &Hash256) -> bool {
        self.lacking.lock().contains(hash)
    }

    /// Reset measurements and idleness for a fresh sync session.
    fn reset(&self) {
        *self.rates.lock() = Rates::new();
        self.lacking.lock().clear();
        self.header_busy.store(false, Ordering::Release);
        self.block_busy.store(false, Ordering::Release);
        self.receipt_busy.store(false, Ordering::Release);
        self.state_busy.store(false, Ordering::Release);
    }

    fn seed_throughput(&self, other: &Rates) {
        let mut rates = self.rates.lock();
        rates.header_throughput = other.header_throughput;
        rates.block_throughput = other.block_throughput;
        rates.receipt_throughput = other.receipt_throughput;
        rates.state_throughput = other.state_throughput;
    }
}

/// Callback used to drop a misbehaving peer from the network layer.
pub type PeerDropFn = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Directory of peers available for synchronization.
pub struct PeerRegistry {
    peers: DashMap<PeerId, Arc<SyncPeer>>,
    drop_feed: broadcast::Sender<PeerId>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (drop_feed, _) = broadcast::channel(64);
        Self {
            peers: DashMap::new(),
            drop_feed,
        }
    }

    /// Register a peer. New peers start from the average throughput of the
    /// existing set so they are neither starved nor flooded while their own
    /// measurements accumulate.
    pub fn register(&self, peer: Arc<SyncPeer>) -> SyncResult<()> {
        if self.peers.contains_key(peer.id()) {
            return Err(SyncError::DuplicatePeer(peer.id().to_string()));
        }
        let count = self.peers.len();
        if count > 0 {
            let mut average = Rates::new();
            for entry in self.peers.iter() {
                let rates = entry.value().rates.lock().clone();
                average.header_throughput += rates.header_throughput;
                average.block_throughput += rates.block_throughput;
                average.receipt_throughput += rates.receipt_throughput;
                average.state_throughput += rates.state_throughput;
            }
            average.header_throughput /= count as f64;
            average.block_throughput /= count as f64;
            average.receipt_throughput /= count as f64;
            average.state_throughput /= count as f64;
            peer.seed_throughput(&average);
        }
        debug!(peer = %peer.id(), version = peer.version(), "Registering sync peer");
        self.peers.insert(peer.id().clone(), peer);
        Ok(())
    }

    /// Remove a peer, returning its record. Interested parties (the state
    /// sync controller) are notified through the drop feed.
    pub fn unregister(&self, id: &PeerId) -> SyncResult<Arc<SyncPeer>> {
        let (_, peer) = self
            .peers
            .remove(id)
            .ok_or_else(|| SyncError::UnknownPeer(id.to_string()))?;
        let _ = self.drop_feed.send(id.clone());
        debug!(peer = %id, "Unregistered sync peer");
        Ok(peer)
    }

    /// Look up a peer by identifier.
    pub fn peer(&self, id: &PeerId) -> Option<Arc<SyncPeer>> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Reset the measurements of every registered peer for a new session.
    pub fn reset(&self) {
        for entry in self.peers.iter() {
            entry.value().reset();
        }
    }

    /// Subscribe to unregistration events.
    pub fn subscribe_drops(&self) -> broadcast::Receiver<PeerId> {
        self.drop_feed.subscribe()
    }

    fn idle_peers(&self, kind: DataKind) -> (Vec<Arc<SyncPeer>>, usize) {
        let total = self.peers.len();
        let mut idle: Vec<Arc<SyncPeer>> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_idle(kind))
            .map(|entry| entry.value().clone())
            .collect();
        idle.sort_by(|a, b| {
            let ta = a.rates.lock().throughput(kind);
            let tb = b.rates.lock().throughput(kind);
            tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
        });
        (idle, total)
    }

    /// Peers currently idle for header retrieval, fastest first, together
    /// with the total peer count.
    pub fn header_idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.idle_peers(DataKind::Headers)
    }

    /// Peers currently idle for body retrieval, fastest first.
    pub fn body_idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.idle_peers(DataKind::Bodies)
    }

    /// Peers currently idle for receipt retrieval, fastest first.
    pub fn receipt_idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.idle_peers(DataKind::Receipts)
    }

    /// Peers currently idle for state retrieval, fastest first.
    pub fn state_idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.idle_peers(DataKind::States)
    }

    /// Median round trip time over the best tracked peers, clamped into the
    /// sane estimation window.
    pub fn median_rtt(&self) -> Duration {
        let mut rtts: Vec<Duration> = self
            .peers
            .iter()
            .map(|entry| entry.value().rtt())
            .collect();
        rtts.sort();
        let median = if rtts.is_empty() {
            RTT_MAX_ESTIMATE
        } else if rtts.len() >= QOS_TUNING_PEERS {
            rtts[QOS_TUNING_PEERS / 2]
        } else {
            rtts[rtts.len() / 2]
        };
        median.clamp(RTT_MIN_ESTIMATE, RTT_MAX_ESTIMATE)
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    impl PeerTransport for NullTransport {
        fn head(&self) -> (Hash256, TotalDifficulty) {
            (Hash256::ZERO, 0)
        }
        fn request_headers_by_hash(&self, _: Hash256, _: usize, _: u64, _: bool) {}
        fn request_headers_by_number(&self, _: BlockNumber, _: usize, _: u64, _: bool) {}
        fn request_bodies(&self, _: Vec<Hash256>) {}
        fn request_receipts(&self, _: Vec<Hash256>) {}
        fn request_node_data(&self, _: Vec<Hash256>) {}
    }

    fn peer(id: &str) -> Arc<SyncPeer> {
        Arc::new(SyncPeer::new(PeerId::from(id), 1, Arc::new(NullTransport)))
    }

    #[test]
    fn test_register_and_unregister_are_inverse() {
        let registry = PeerRegistry::new();
        registry.register(peer("a")).unwrap();
        assert_eq!(registry.len(), 1);

        registry.unregister(&PeerId::from("a")).unwrap();
        assert!(registry.is_empty());
        assert!(registry.peer(&PeerId::from("a")).is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = PeerRegistry::new();
        registry.register(peer("a")).unwrap();
        assert!(matches!(
            registry.register(peer("a")),
            Err(SyncError::DuplicatePeer(_))
        ));
    }

    #[test]
    fn test_unknown_unregister_rejected() {
        let registry = PeerRegistry::new();
        assert!(matches!(
            registry.unregister(&PeerId::from("ghost")),
            Err(SyncError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_busy_peers_leave_idle_list() {
        let registry = PeerRegistry::new();
        let p = peer("a");
        registry.register(p.clone()).unwrap();

        let (idle, total) = registry.body_idle_peers();
        assert_eq!((idle.len(), total), (1, 1));

        p.fetch_bodies(vec![Hash256::ZERO]).unwrap();
        let (idle, total) = registry.body_idle_peers();
        assert_eq!((idle.len(), total), (0, 1));

        // A second assignment of the same kind is a scheduling bug.
        assert!(p.fetch_bodies(vec![Hash256::ZERO]).is_err());

        p.set_idle(DataKind::Bodies, 4);
        assert_eq!(registry.body_idle_peers().0.len(), 1);
    }

    #[test]
    fn test_zero_delivery_resets_throughput() {
        let p = peer("a");
        p.fetch_bodies(vec![Hash256::ZERO]).unwrap();
        p.set_idle(DataKind::Bodies, 50);
        assert!(p.capacity(DataKind::Bodies, Duration::from_secs(10)) > 2);

        p.fetch_bodies(vec![Hash256::ZERO]).unwrap();
        p.set_idle(DataKind::Bodies, 0);
        assert_eq!(p.capacity(DataKind::Bodies, Duration::from_secs(10)), 2);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let p = peer("a");
        p.fetch_bodies(vec![Hash256::ZERO]).unwrap();
        p.set_idle(DataKind::Bodies, 1_000_000);
        assert_eq!(
            p.capacity(DataKind::Bodies, Duration::from_secs(60)),
            MAX_BLOCK_FETCH
        );
        assert!(p.capacity(DataKind::Headers, Duration::from_secs(60)) <= MAX_HEADER_FETCH);
    }

    #[test]
    fn test_lacking_is_bounded() {
        let p = peer("a");
        for i in 0..(MAX_LACKING_HASHES + 10) {
            p.mark_lacking(pyrite_types::hash_bytes(&i.to_be_bytes()));
        }
        assert!(p.lacking.lock().len() <= MAX_LACKING_HASHES);
    }

    #[test]
    fn test_median_rtt_clamped_without_peers() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.median_rtt(), RTT_MAX_ESTIMATE);

        registry.register(peer("a")).unwrap();
        assert_eq!(registry.median_rtt(), RTT_MIN_ESTIMATE);
    }

    #[test]
    fn test_drop_feed_announces_unregistration() {
        let registry = PeerRegistry::new();
        let mut drops = registry.subscribe_drops();
        registry.register(peer("a")).unwrap();
        registry.unregister(&PeerId::from("a")).unwrap();
        assert_eq!(drops.try_recv().unwrap(), PeerId::from("a"));
    }
}
