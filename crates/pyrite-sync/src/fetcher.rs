//! Generic download loop.
//!
//! One long-running [`fetch_parts`] loop drives each data kind. The loop
//! reacts to deliveries, wake signals from the header pipeline and a
//! periodic tick; on every pass it expires stale reservations, hands new
//! reservations to idle peers and detects both completion and the
//! nobody-can-serve-this dead end.

use crate::error::{Stage, SyncError, SyncResult};
use crate::peers::{DataKind, PeerDropFn, PeerId, PeerRegistry, SyncPeer};
use crate::qos::QosEstimator;
use crate::scheduler::{FetchRequest, Scheduler};
use crate::MAX_HEADER_FETCH;
use pyrite_types::{Header, Receipt, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Non-blocking wake signal.
///
/// Producers bump `generation` when new tasks may be available and set the
/// sticky `finished` bit when no further tasks will ever arrive; coalesced
/// generations are harmless because the consumer re-reads queue state on
/// every pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wake {
    /// Bumped on every task-availability signal.
    pub generation: u64,
    /// Set once the producing stage has terminated.
    pub finished: bool,
}

/// An inbound batch of headers from one peer.
#[derive(Debug)]
pub struct HeaderPack {
    /// Delivering peer.
    pub peer: PeerId,
    /// The delivered headers.
    pub headers: Vec<Header>,
}

/// An inbound batch of block bodies from one peer.
#[derive(Debug)]
pub struct BodyPack {
    /// Delivering peer.
    pub peer: PeerId,
    /// Per-block transaction lists.
    pub transactions: Vec<Vec<Transaction>>,
    /// Per-block uncle lists.
    pub uncles: Vec<Vec<Header>>,
}

/// An inbound batch of receipts from one peer.
#[derive(Debug)]
pub struct ReceiptPack {
    /// Delivering peer.
    pub peer: PeerId,
    /// Per-block receipt lists.
    pub receipts: Vec<Vec<Receipt>>,
}

/// An inbound batch of state trie nodes from one peer.
#[derive(Debug)]
pub struct StatePack {
    /// Delivering peer.
    pub peer: PeerId,
    /// Raw node payloads.
    pub nodes: Vec<Vec<u8>>,
}

/// The seams [`fetch_parts`] needs to drive one data kind.
pub(crate) trait DownloadKind: Send + Sync {
    /// Delivery batch type for this kind.
    type Pack: Send;

    /// Reservation type handed from `reserve` to `fetch`.
    type Request: Send;

    /// Display label for logging.
    fn label(&self) -> &'static str;

    /// Stage reported when cancellation is observed here.
    fn stage(&self) -> Stage;

    /// The peer a pack came from.
    fn pack_peer(pack: &Self::Pack) -> &PeerId;

    /// Number of items in a pack.
    fn pack_items(pack: &Self::Pack) -> usize;

    /// Hand a delivery to the scheduler, returning the accepted item count.
    fn deliver(&self, peer: &Arc<SyncPeer>, pack: Self::Pack) -> (usize, Option<SyncError>);

    /// Evict reservations that outlived the current TTL.
    fn expire(&self) -> Vec<(PeerId, usize)>;

    /// Items still awaiting reservation.
    fn pending(&self) -> usize;

    /// Whether any reservation is outstanding.
    fn in_flight(&self) -> bool;

    /// Whether reservations should pause for memory backpressure.
    fn should_throttle(&self) -> bool;

    /// Reserve up to `count` items for a peer. The boolean reports result
    /// progress achieved without fetching (see scheduler).
    fn reserve(&self, peer: &Arc<SyncPeer>, count: usize) -> (Option<Self::Request>, bool);

    /// Item count and starting height of a reservation, for logging.
    fn request_info(request: &Self::Request) -> (usize, u64);

    /// This peer's current batch size target.
    fn capacity(&self, peer: &Arc<SyncPeer>) -> usize;

    /// Issue the network request for a reservation.
    fn fetch(
        &self,
        peer: &Arc<SyncPeer>,
        request: Self::Request,
    ) -> Result<(), crate::peers::AlreadyFetching>;

    /// Mark a peer idle again after a delivery of `delivered` items.
    fn set_idle(&self, peer: &Arc<SyncPeer>, delivered: usize);

    /// Snapshot of idle peers plus the total peer count for this kind.
    fn idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize);
}

/// Drive one data kind until its queue drains after the header stream
/// finished, a fatal error surfaces, or the session is cancelled.
pub(crate) async fn fetch_parts<K: DownloadKind>(
    kind: &K,
    delivery: &mut mpsc::Receiver<K::Pack>,
    wake: &mut watch::Receiver<Wake>,
    cancel: &CancellationToken,
    registry: &PeerRegistry,
    drop_peer: &PeerDropFn,
) -> SyncResult<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut finished = false;
    let mut wake_open = true;

    loop {
        let mut update = false;

        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled(kind.stage())),

            pack = delivery.recv() => {
                let Some(pack) = pack else {
                    return Err(SyncError::Cancelled(kind.stage()));
                };
                // A dropped peer may still have data in flight; its packs
                // are ignored entirely.
                if let Some(peer) = registry.peer(K::pack_peer(&pack)) {
                    let items = K::pack_items(&pack);
                    let (accepted, err) = kind.deliver(&peer, pack);
                    if matches!(err, Some(SyncError::InvalidChain)) {
                        return Err(SyncError::InvalidChain);
                    }
                    // A stale delivery must not reset idleness: the expiry
                    // path already settled this peer.
                    if !matches!(err, Some(SyncError::StaleDelivery)) {
                        kind.set_idle(&peer, accepted);
                    }
                    match err {
                        None if items == 0 => {
                            trace!(peer = %peer.id(), kind = kind.label(), "Requested data not delivered")
                        }
                        None => {
                            trace!(peer = %peer.id(), kind = kind.label(), accepted, "Delivered new batch of data")
                        }
                        Some(err) => {
                            trace!(peer = %peer.id(), kind = kind.label(), %err, "Failed to deliver retrieved data")
                        }
                    }
                }
                update = true;
            }

            changed = wake.changed(), if wake_open => {
                match changed {
                    Ok(()) => {
                        if wake.borrow_and_update().finished {
                            finished = true;
                        }
                    }
                    Err(_) => wake_open = false,
                }
                update = true;
            }

            _ = ticker.tick() => update = true,
        }

        if !update {
            continue;
        }
        // Short circuit if we lost all our peers.
        if registry.is_empty() {
            return Err(SyncError::NoPeers);
        }
        // Expire overdue reservations. Peers with a couple of late items
        // merely had their capacity overestimated and restart from minimal
        // throughput; peers failing wholesale get dropped.
        for (id, fails) in kind.expire() {
            if let Some(peer) = registry.peer(&id) {
                if fails <= 2 {
                    trace!(peer = %id, kind = kind.label(), "Data delivery timed out");
                    kind.set_idle(&peer, 0);
                } else {
                    debug!(peer = %id, kind = kind.label(), "Stalling delivery, dropping");
                    drop_peer(&id);
                }
            }
        }
        if kind.pending() == 0 {
            if !kind.in_flight() && finished {
                debug!(kind = kind.label(), "Data fetching completed");
                return Ok(());
            }
            continue;
        }
        // Hand reservations to idle peers until throttled or starved.
        let (idles, total) = kind.idle_peers();
        let idle_count = idles.len();
        let mut progressed = false;
        let mut throttled = false;
        let mut running = kind.in_flight();

        for peer in idles {
            if kind.should_throttle() {
                throttled = true;
                break;
            }
            if kind.pending() == 0 {
                break;
            }
            let (request, progress) = kind.reserve(&peer, kind.capacity(&peer));
            if progress {
                progressed = true;
            }
            let Some(request) = request else { continue };
            let (count, from) = K::request_info(&request);
            trace!(
                peer = %peer.id(),
                kind = kind.label(),
                count,
                from,
                "Requesting new batch of data"
            );
            if kind.fetch(&peer, request).is_err() {
                // A double reservation means the scheduler handed one block
                // to two peers; the queues can no longer be trusted.
                panic!("{}: {} fetch assignment failed", peer.id(), kind.label());
            }
            running = true;
        }
        // Every idle peer was offered work and none could take any: the
        // remaining items are unserviceable by the current peer set.
        if !progressed && !throttled && !running && idle_count == total && kind.pending() > 0 {
            return Err(SyncError::PeersUnavailable);
        }
    }
}

// ----------------------------------------------------------------------
// Kind bindings
// ----------------------------------------------------------------------

/// Skeleton fill retrieval seams.
pub(crate) struct HeaderFillKind {
    pub scheduler: Arc<Scheduler>,
    pub peers: Arc<PeerRegistry>,
    pub qos: Arc<QosEstimator>,
    pub processor: mpsc::Sender<Vec<Header>>,
}

impl DownloadKind for HeaderFillKind {
    type Pack = HeaderPack;
    type Request = u64;

    fn label(&self) -> &'static str {
        "headers"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderFetch
    }

    fn pack_peer(pack: &HeaderPack) -> &PeerId {
        &pack.peer
    }

    fn pack_items(pack: &HeaderPack) -> usize {
        pack.headers.len()
    }

    fn deliver(&self, peer: &Arc<SyncPeer>, pack: HeaderPack) -> (usize, Option<SyncError>) {
        self.scheduler
            .deliver_headers(peer, pack.headers, &self.processor)
    }

    fn expire(&self) -> Vec<(PeerId, usize)> {
        self.scheduler.expire_headers(self.qos.request_ttl())
    }

    fn pending(&self) -> usize {
        self.scheduler.pending_headers()
    }

    fn in_flight(&self) -> bool {
        self.scheduler.in_flight_headers()
    }

    fn should_throttle(&self) -> bool {
        false
    }

    fn reserve(&self, peer: &Arc<SyncPeer>, _count: usize) -> (Option<u64>, bool) {
        (self.scheduler.reserve_headers(peer), false)
    }

    fn request_info(request: &u64) -> (usize, u64) {
        (MAX_HEADER_FETCH, *request)
    }

    fn capacity(&self, peer: &Arc<SyncPeer>) -> usize {
        peer.capacity(DataKind::Headers, self.qos.request_rtt())
    }

    fn fetch(
        &self,
        peer: &Arc<SyncPeer>,
        from: u64,
    ) -> Result<(), crate::peers::AlreadyFetching> {
        peer.fetch_headers(from, MAX_HEADER_FETCH)
    }

    fn set_idle(&self, peer: &Arc<SyncPeer>, delivered: usize) {
        peer.set_idle(DataKind::Headers, delivered)
    }

    fn idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.peers.header_idle_peers()
    }
}

/// Block body retrieval seams.
pub(crate) struct BodiesKind {
    pub scheduler: Arc<Scheduler>,
    pub peers: Arc<PeerRegistry>,
    pub qos: Arc<QosEstimator>,
}

impl DownloadKind for BodiesKind {
    type Pack = BodyPack;
    type Request = FetchRequest;

    fn label(&self) -> &'static str {
        "bodies"
    }

    fn stage(&self) -> Stage {
        Stage::BodyFetch
    }

    fn pack_peer(pack: &BodyPack) -> &PeerId {
        &pack.peer
    }

    fn pack_items(pack: &BodyPack) -> usize {
        pack.transactions.len()
    }

    fn deliver(&self, peer: &Arc<SyncPeer>, pack: BodyPack) -> (usize, Option<SyncError>) {
        self.scheduler
            .deliver_bodies(peer, pack.transactions, pack.uncles)
    }

    fn expire(&self) -> Vec<(PeerId, usize)> {
        self.scheduler.expire_bodies(self.qos.request_ttl())
    }

    fn pending(&self) -> usize {
        self.scheduler.pending_blocks()
    }

    fn in_flight(&self) -> bool {
        self.scheduler.in_flight_blocks()
    }

    fn should_throttle(&self) -> bool {
        self.scheduler.should_throttle_blocks()
    }

    fn reserve(&self, peer: &Arc<SyncPeer>, count: usize) -> (Option<FetchRequest>, bool) {
        self.scheduler.reserve_bodies(peer, count)
    }

    fn request_info(request: &FetchRequest) -> (usize, u64) {
        (
            request.headers.len(),
            request.headers.first().map(|h| h.number).unwrap_or_default(),
        )
    }

    fn capacity(&self, peer: &Arc<SyncPeer>) -> usize {
        peer.capacity(DataKind::Bodies, self.qos.request_rtt())
    }

    fn fetch(
        &self,
        peer: &Arc<SyncPeer>,
        request: FetchRequest,
    ) -> Result<(), crate::peers::AlreadyFetching> {
        let hashes = request.headers.iter().map(|h| h.hash()).collect();
        peer.fetch_bodies(hashes)
    }

    fn set_idle(&self, peer: &Arc<SyncPeer>, delivered: usize) {
        peer.set_idle(DataKind::Bodies, delivered)
    }

    fn idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.peers.body_idle_peers()
    }
}

/// Receipt retrieval seams.
pub(crate) struct ReceiptsKind {
    pub scheduler: Arc<Scheduler>,
    pub peers: Arc<PeerRegistry>,
    pub qos: Arc<QosEstimator>,
}

impl DownloadKind for ReceiptsKind {
    type Pack = ReceiptPack;
    type Request = FetchRequest;

    fn label(&self) -> &'static str {
        "receipts"
    }

    fn stage(&self) -> Stage {
        Stage::ReceiptFetch
    }

    fn pack_peer(pack: &ReceiptPack) -> &PeerId {
        &pack.peer
    }

    fn pack_items(pack: &ReceiptPack) -> usize {
        pack.receipts.len()
    }

    fn deliver(&self, peer: &Arc<SyncPeer>, pack: ReceiptPack) -> (usize, Option<SyncError>) {
        self.scheduler.deliver_receipts(peer, pack.receipts)
    }

    fn expire(&self) -> Vec<(PeerId, usize)> {
        self.scheduler.expire_receipts(self.qos.request_ttl())
    }

    fn pending(&self) -> usize {
        self.scheduler.pending_receipts()
    }

    fn in_flight(&self) -> bool {
        self.scheduler.in_flight_receipts()
    }

    fn should_throttle(&self) -> bool {
        self.scheduler.should_throttle_receipts()
    }

    fn reserve(&self, peer: &Arc<SyncPeer>, count: usize) -> (Option<FetchRequest>, bool) {
        self.scheduler.reserve_receipts(peer, count)
    }

    fn request_info(request: &FetchRequest) -> (usize, u64) {
        (
            request.headers.len(),
            request.headers.first().map(|h| h.number).unwrap_or_default(),
        )
    }

    fn capacity(&self, peer: &Arc<SyncPeer>) -> usize {
        peer.capacity(DataKind::Receipts, self.qos.request_rtt())
    }

    fn fetch(
        &self,
        peer: &Arc<SyncPeer>,
        request: FetchRequest,
    ) -> Result<(), crate::peers::AlreadyFetching> {
        let hashes = request.headers.iter().map(|h| h.hash()).collect();
        peer.fetch_receipts(hashes)
    }

    fn set_idle(&self, peer: &Arc<SyncPeer>, delivered: usize) {
        peer.set_idle(DataKind::Receipts, delivered)
    }

    fn idle_peers(&self) -> (Vec<Arc<SyncPeer>>, usize) {
        self.peers.receipt_idle_peers()
    }
}
