//! Download task scheduling.
//!
//! The scheduler owns the work queues for every data kind: skeleton header
//! segments waiting to be filled, block bodies and receipts waiting to be
//! fetched, and the ordered result cache the content processors drain. All
//! queue state lives behind one lock; completed results are handed out
//! strictly in ascending block order with no gaps.

use crate::error::SyncError;
use crate::fetcher::Wake;
use crate::peers::{PeerId, SyncPeer};
use crate::{SyncMode, MAX_HEADER_FETCH, RESULT_CACHE_LIMIT};
use parking_lot::Mutex;
use pyrite_types::{receipt_root, transaction_root, uncle_root, Header, Receipt, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// One fully fetched block, as handed to the content processors.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// The verified header.
    pub header: Header,
    /// The block's transactions.
    pub transactions: Vec<Transaction>,
    /// The block's uncle headers.
    pub uncles: Vec<Header>,
    /// The block's receipts; only populated in fast mode below the pivot.
    pub receipts: Vec<Receipt>,
}

/// A content reservation held by a single peer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// The peer the reservation is bound to.
    pub peer: PeerId,
    /// Headers whose content is being fetched, ascending.
    pub headers: Vec<Header>,
    /// Issue time, used for expiry.
    pub time: Instant,
}

/// A skeleton segment reservation held by a single peer.
#[derive(Debug, Clone)]
pub struct HeaderRequest {
    /// First header of the segment being filled.
    pub from: u64,
    /// Issue time, used for expiry.
    pub time: Instant,
}

/// Result slot bookkeeping.
struct ResultEntry {
    body_done: bool,
    receipt_done: bool,
    receipt_needed: bool,
    result: FetchResult,
}

impl ResultEntry {
    fn new(header: Header, receipt_needed: bool) -> Self {
        Self {
            body_done: false,
            receipt_done: false,
            receipt_needed,
            result: FetchResult {
                header,
                transactions: Vec::new(),
                uncles: Vec::new(),
                receipts: Vec::new(),
            },
        }
    }

    fn complete(&self) -> bool {
        self.body_done && (self.receipt_done || !self.receipt_needed)
    }
}

/// The two content queues sharing the reservation logic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ContentKind {
    Bodies,
    Receipts,
}

#[derive(Default)]
struct Inner {
    mode: SyncMode,
    pivot: u64,
    closed: bool,

    // Skeleton fill state.
    skeleton_pool: HashMap<u64, Header>,
    skeleton_queue: BTreeSet<u64>,
    skeleton_miss: HashMap<u64, HashSet<PeerId>>,
    header_pend: HashMap<PeerId, HeaderRequest>,
    header_results: Vec<Option<Header>>,
    header_offset: u64,
    header_proced: usize,
    header_cont: Option<watch::Sender<Wake>>,

    // Content retrieval state.
    block_tasks: BTreeMap<u64, Header>,
    block_pend: HashMap<PeerId, FetchRequest>,
    receipt_tasks: BTreeMap<u64, Header>,
    receipt_pend: HashMap<PeerId, FetchRequest>,
    last_scheduled: Option<(u64, pyrite_types::Hash256)>,

    // Ordered results.
    result_cache: BTreeMap<u64, ResultEntry>,
    result_offset: u64,
}

impl Inner {
    fn tasks(&mut self, kind: ContentKind) -> &mut BTreeMap<u64, Header> {
        match kind {
            ContentKind::Bodies => &mut self.block_tasks,
            ContentKind::Receipts => &mut self.receipt_tasks,
        }
    }

    fn pend(&mut self, kind: ContentKind) -> &mut HashMap<PeerId, FetchRequest> {
        match kind {
            ContentKind::Bodies => &mut self.block_pend,
            ContentKind::Receipts => &mut self.receipt_pend,
        }
    }

    fn ready_results(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.result_offset;
        while let Some(entry) = self.result_cache.get(&cursor) {
            if !entry.complete() {
                break;
            }
            count += 1;
            cursor += 1;
        }
        count
    }

    fn signal_skeleton_done_if_drained(&self) {
        if self.skeleton_pool.is_empty() {
            if let Some(cont) = &self.header_cont {
                cont.send_modify(|wake| wake.finished = true);
            }
        }
    }
}

/// Central download queue manager.
pub struct Scheduler {
    inner: Mutex<Inner>,
    results_ready: Notify,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            results_ready: Notify::new(),
        })
    }

    /// Drop all queued state. Called before every session so nothing can
    /// leak over from an earlier, possibly cancelled, run.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
    }

    /// Configure the queues for a new session starting at `offset`.
    pub fn prepare(&self, offset: u64, mode: SyncMode, pivot: u64) {
        let mut inner = self.inner.lock();
        if inner.result_offset < offset {
            inner.result_offset = offset;
        }
        inner.mode = mode;
        inner.pivot = pivot;
    }

    /// The session's fast-sync pivot height.
    pub fn fast_sync_pivot(&self) -> u64 {
        self.inner.lock().pivot
    }

    /// Enter the terminal state: wake all waiters, refuse new reservations.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some(cont) = &inner.header_cont {
                cont.send_modify(|wake| wake.finished = true);
            }
        }
        self.results_ready.notify_waiters();
    }

    /// Whether the scheduler has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // ------------------------------------------------------------------
    // Skeleton filling
    // ------------------------------------------------------------------

    /// Seed the header queue with skeleton segments. Each entry of
    /// `skeleton` is the last header of a `MAX_HEADER_FETCH`-sized segment,
    /// the first of which starts at `from`.
    pub fn schedule_skeleton(&self, from: u64, skeleton: &[Header], cont: watch::Sender<Wake>) {
        let mut inner = self.inner.lock();
        assert!(
            inner.header_results.is_empty(),
            "skeleton assembly already in progress"
        );
        inner.header_offset = from;
        inner.header_proced = 0;
        inner.header_results = vec![None; skeleton.len() * MAX_HEADER_FETCH];
        inner.skeleton_pool.clear();
        inner.skeleton_queue.clear();
        inner.skeleton_miss.clear();
        for (i, header) in skeleton.iter().enumerate() {
            let index = from + (i * MAX_HEADER_FETCH) as u64;
            inner.skeleton_pool.insert(index, header.clone());
            inner.skeleton_queue.insert(index);
        }
        cont.send_modify(|wake| wake.generation += 1);
        inner.header_cont = Some(cont);
        debug!(from, segments = skeleton.len(), "Scheduled skeleton fill");
    }

    /// Drain the assembled headers once filling has terminated, returning
    /// the contiguous filled prefix and how many of those were already
    /// forwarded to the header processor.
    pub fn retrieve_headers(&self) -> (Vec<Header>, usize) {
        let mut inner = self.inner.lock();
        let results = mem::take(&mut inner.header_results);
        let proced = inner.header_proced;
        inner.header_proced = 0;
        inner.header_cont = None;
        inner.skeleton_pool.clear();
        inner.skeleton_queue.clear();
        inner.skeleton_miss.clear();
        inner.header_pend.clear();

        let mut filled = Vec::new();
        for slot in results {
            match slot {
                Some(header) => filled.push(header),
                None => break,
            }
        }
        (filled, proced)
    }

    /// Reserve the next skeleton segment for a peer, skipping segments the
    /// peer already failed to fill. Returns the segment's starting height.
    pub fn reserve_headers(&self, peer: &Arc<SyncPeer>) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.header_pend.contains_key(peer.id()) {
            return None;
        }
        let mut chosen = None;
        let mut skipped = Vec::new();
        loop {
            let next = inner.skeleton_queue.iter().next().copied();
            let Some(from) = next else { break };
            inner.skeleton_queue.remove(&from);
            let missed = inner
                .skeleton_miss
                .get(&from)
                .map_or(false, |miss| miss.contains(peer.id()));
            if missed {
                skipped.push(from);
                continue;
            }
            chosen = Some(from);
            break;
        }
        for from in skipped {
            inner.skeleton_queue.insert(from);
        }
        let from = chosen?;
        inner.header_pend.insert(
            peer.id().clone(),
            HeaderRequest {
                from,
                time: Instant::now(),
            },
        );
        Some(from)
    }

    /// Match a batch of fill headers against the peer's reserved segment.
    ///
    /// A segment is accepted only when it is exactly `MAX_HEADER_FETCH`
    /// headers long, starts at the reserved height, chains internally and
    /// ends in the skeleton header anchoring the segment. Accepted headers
    /// that extend the contiguous prefix are forwarded to the header
    /// processor immediately.
    pub fn deliver_headers(
        &self,
        peer: &Arc<SyncPeer>,
        headers: Vec<Header>,
        processor: &mpsc::Sender<Vec<Header>>,
    ) -> (usize, Option<SyncError>) {
        let mut inner = self.inner.lock();
        let Some(request) = inner.header_pend.remove(peer.id()) else {
            return (0, Some(SyncError::StaleDelivery));
        };
        let from = request.from;

        let target = inner.skeleton_pool.get(&from).map(|anchor| anchor.hash());
        let mut accepted = headers.len() == MAX_HEADER_FETCH && target.is_some();
        if accepted && headers[0].number != from {
            trace!(peer = %peer.id(), from, got = headers[0].number, "Fill segment starts off target");
            accepted = false;
        }
        if accepted && Some(headers[headers.len() - 1].hash()) != target {
            trace!(peer = %peer.id(), from, "Fill segment does not end in skeleton anchor");
            accepted = false;
        }
        if accepted {
            for (i, pair) in headers.windows(2).enumerate() {
                let want = from + 1 + i as u64;
                if pair[1].number != want || pair[0].hash() != pair[1].parent_hash {
                    trace!(peer = %peer.id(), index = i, "Fill segment broke chain ordering");
                    accepted = false;
                    break;
                }
            }
        }
        if !accepted {
            inner
                .skeleton_miss
                .entry(from)
                .or_default()
                .insert(peer.id().clone());
            inner.skeleton_queue.insert(from);
            return (0, Some(SyncError::BadPeer));
        }

        let offset = (from - inner.header_offset) as usize;
        for (i, header) in headers.iter().enumerate() {
            inner.header_results[offset + i] = Some(header.clone());
        }
        inner.skeleton_pool.remove(&from);

        let mut process = Vec::new();
        while inner.header_proced + process.len() < inner.header_results.len() {
            match &inner.header_results[inner.header_proced + process.len()] {
                Some(header) => process.push(header.clone()),
                None => break,
            }
        }
        if !process.is_empty() {
            let count = process.len();
            if processor.try_send(process).is_ok() {
                inner.header_proced += count;
            }
        }
        inner.signal_skeleton_done_if_drained();
        (headers.len(), None)
    }

    /// Expire skeleton reservations older than `ttl`, returning segments to
    /// the pending queue.
    pub fn expire_headers(&self, ttl: Duration) -> Vec<(PeerId, usize)> {
        let mut inner = self.inner.lock();
        let expired: Vec<PeerId> = inner
            .header_pend
            .iter()
            .filter(|(_, request)| request.time.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        let mut fails = Vec::new();
        for id in expired {
            if let Some(request) = inner.header_pend.remove(&id) {
                inner.skeleton_queue.insert(request.from);
                fails.push((id, 1));
            }
        }
        fails
    }

    /// Return a skeleton reservation to the pending queue.
    pub fn cancel_headers(&self, request: HeaderRequest) {
        let mut inner = self.inner.lock();
        inner.skeleton_queue.insert(request.from);
    }

    /// Number of skeleton segments waiting to be filled.
    pub fn pending_headers(&self) -> usize {
        self.inner.lock().skeleton_queue.len()
    }

    /// Whether any skeleton segment is reserved right now.
    pub fn in_flight_headers(&self) -> bool {
        !self.inner.lock().header_pend.is_empty()
    }

    // ------------------------------------------------------------------
    // Body and receipt scheduling
    // ------------------------------------------------------------------

    /// Enqueue verified headers for content retrieval. `from` is the height
    /// the chunk is expected to start at; the number of accepted headers is
    /// returned, and a short count flags the delivering peer as stale.
    pub fn schedule(&self, headers: &[Header], from: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut expected = from;
        let mut inserted = 0;
        for header in headers {
            let hash = header.hash();
            if header.number != expected {
                debug!(number = header.number, expected, "Header broke chain ordering");
                break;
            }
            if let Some((_, last_hash)) = inner.last_scheduled {
                if header.parent_hash != last_hash {
                    debug!(number = header.number, "Header broke chain ancestry");
                    break;
                }
            }
            if inner.block_tasks.contains_key(&header.number) {
                warn!(number = header.number, "Header already scheduled");
                continue;
            }
            inner.block_tasks.insert(header.number, header.clone());
            if inner.mode == SyncMode::Fast && header.number <= inner.pivot {
                inner.receipt_tasks.insert(header.number, header.clone());
            }
            inner.last_scheduled = Some((header.number, hash));
            expected += 1;
            inserted += 1;
        }
        inserted
    }

    fn reserve_content(
        &self,
        kind: ContentKind,
        peer: &Arc<SyncPeer>,
        count: usize,
    ) -> (Option<FetchRequest>, bool) {
        let (request, progress) = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.pend(kind).contains_key(peer.id()) {
                return (None, false);
            }
            let window_end = inner.result_offset + RESULT_CACHE_LIMIT as u64;
            let mut send = Vec::new();
            let mut skip = Vec::new();
            let mut progress = false;
            while send.len() < count {
                let next = inner
                    .tasks(kind)
                    .first_key_value()
                    .map(|(number, _)| *number);
                let Some(number) = next else { break };
                if number >= window_end {
                    break;
                }
                let Some(header) = inner.tasks(kind).remove(&number) else {
                    break;
                };
                let hash = header.hash();
                if !inner.result_cache.contains_key(&number) {
                    let receipt_needed = inner.mode == SyncMode::Fast && number <= inner.pivot;
                    inner
                        .result_cache
                        .insert(number, ResultEntry::new(header.clone(), receipt_needed));
                }
                let noop = match kind {
                    ContentKind::Bodies => header.has_empty_body(),
                    ContentKind::Receipts => header.receipt_root == receipt_root(&[]),
                };
                if noop {
                    if let Some(entry) = inner.result_cache.get_mut(&number) {
                        match kind {
                            ContentKind::Bodies => entry.body_done = true,
                            ContentKind::Receipts => entry.receipt_done = true,
                        }
                    }
                    progress = true;
                    continue;
                }
                if peer.lacks(&hash) {
                    skip.push((number, header));
                } else {
                    send.push(header);
                }
            }
            for (number, header) in skip {
                inner.tasks(kind).insert(number, header);
            }
            let request = if send.is_empty() {
                None
            } else {
                let request = FetchRequest {
                    peer: peer.id().clone(),
                    headers: send,
                    time: Instant::now(),
                };
                inner.pend(kind).insert(peer.id().clone(), request.clone());
                Some(request)
            };
            (request, progress)
        };
        if progress {
            // Empty blocks completed without a network trip; the processor
            // may be waiting on exactly those.
            self.results_ready.notify_waiters();
        }
        (request, progress)
    }

    /// Reserve the next run of block bodies for a peer, bounded by `count`.
    /// The boolean reports whether the result cache progressed (empty-body
    /// blocks complete immediately); a `None` request together with
    /// `false` means the peer cannot serve anything pending.
    pub fn reserve_bodies(&self, peer: &Arc<SyncPeer>, count: usize) -> (Option<FetchRequest>, bool) {
        self.reserve_content(ContentKind::Bodies, peer, count)
    }

    /// Reserve the next run of receipts for a peer, bounded by `count`.
    pub fn reserve_receipts(&self, peer: &Arc<SyncPeer>, count: usize) -> (Option<FetchRequest>, bool) {
        self.reserve_content(ContentKind::Receipts, peer, count)
    }

    /// Match delivered bodies against the peer's reservation, in order. The
    /// first body failing root validation aborts acceptance with
    /// `InvalidChain`; a completely empty delivery marks every reserved
    /// block as lacking on this peer.
    pub fn deliver_bodies(
        &self,
        peer: &Arc<SyncPeer>,
        mut transactions: Vec<Vec<Transaction>>,
        mut uncles: Vec<Vec<Header>>,
    ) -> (usize, Option<SyncError>) {
        let (accepted, failure) = {
            let mut inner = self.inner.lock();
            let Some(request) = inner.block_pend.remove(peer.id()) else {
                return (0, Some(SyncError::StaleDelivery));
            };
            let results = transactions.len().min(uncles.len());
            if results == 0 {
                for header in &request.headers {
                    peer.mark_lacking(header.hash());
                }
            }
            let mut accepted = 0;
            let mut failure = None;
            for (i, header) in request.headers.iter().enumerate() {
                if i >= results {
                    break;
                }
                if transaction_root(&transactions[i]) != header.tx_root
                    || uncle_root(&uncles[i]) != header.uncle_root
                {
                    failure = Some(SyncError::InvalidChain);
                    break;
                }
                if let Some(entry) = inner.result_cache.get_mut(&header.number) {
                    entry.result.transactions = mem::take(&mut transactions[i]);
                    entry.result.uncles = mem::take(&mut uncles[i]);
                    entry.body_done = true;
                }
                accepted += 1;
            }
            for header in request.headers.into_iter().skip(accepted) {
                inner.block_tasks.insert(header.number, header);
            }
            (accepted, failure)
        };
        if accepted > 0 {
            self.results_ready.notify_waiters();
        }
        (accepted, failure)
    }

    /// Match delivered receipts against the peer's reservation, in order.
    pub fn deliver_receipts(
        &self,
        peer: &Arc<SyncPeer>,
        mut receipts: Vec<Vec<Receipt>>,
    ) -> (usize, Option<SyncError>) {
        let (accepted, failure) = {
            let mut inner = self.inner.lock();
            let Some(request) = inner.receipt_pend.remove(peer.id()) else {
                return (0, Some(SyncError::StaleDelivery));
            };
            let results = receipts.len();
            if results == 0 {
                for header in &request.headers {
                    peer.mark_lacking(header.hash());
                }
            }
            let mut accepted = 0;
            let mut failure = None;
            for (i, header) in request.headers.iter().enumerate() {
                if i >= results {
                    break;
                }
                if receipt_root(&receipts[i]) != header.receipt_root {
                    failure = Some(SyncError::InvalidChain);
                    break;
                }
                if let Some(entry) = inner.result_cache.get_mut(&header.number) {
                    entry.result.receipts = mem::take(&mut receipts[i]);
                    entry.receipt_done = true;
                }
                accepted += 1;
            }
            for header in request.headers.into_iter().skip(accepted) {
                inner.receipt_tasks.insert(header.number, header);
            }
            (accepted, failure)
        };
        if accepted > 0 {
            self.results_ready.notify_waiters();
        }
        (accepted, failure)
    }

    fn expire_content(&self, kind: ContentKind, ttl: Duration) -> Vec<(PeerId, usize)> {
        let mut inner = self.inner.lock();
        let expired: Vec<PeerId> = inner
            .pend(kind)
            .iter()
            .filter(|(_, request)| request.time.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        let mut fails = Vec::new();
        for id in expired {
            if let Some(request) = inner.pend(kind).remove(&id) {
                let count = request.headers.len();
                for header in request.headers {
                    inner.tasks(kind).insert(header.number, header);
                }
                fails.push((id, count));
            }
        }
        fails
    }

    /// Expire body reservations older than `ttl`, returning the per-peer
    /// count of items that timed out.
    pub fn expire_bodies(&self, ttl: Duration) -> Vec<(PeerId, usize)> {
        self.expire_content(ContentKind::Bodies, ttl)
    }

    /// Expire receipt reservations older than `ttl`.
    pub fn expire_receipts(&self, ttl: Duration) -> Vec<(PeerId, usize)> {
        self.expire_content(ContentKind::Receipts, ttl)
    }

    /// Return a body reservation to the pending queue.
    pub fn cancel_bodies(&self, request: FetchRequest) {
        let mut inner = self.inner.lock();
        inner.block_pend.remove(&request.peer);
        for header in request.headers {
            inner.block_tasks.insert(header.number, header);
        }
    }

    /// Return a receipt reservation to the pending queue.
    pub fn cancel_receipts(&self, request: FetchRequest) {
        let mut inner = self.inner.lock();
        inner.receipt_pend.remove(&request.peer);
        for header in request.headers {
            inner.receipt_tasks.insert(header.number, header);
        }
    }

    /// Return every reservation held by a dropped peer to the pending
    /// queues.
    pub fn revoke(&self, id: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(request) = inner.block_pend.remove(id) {
            for header in request.headers {
                inner.block_tasks.insert(header.number, header);
            }
        }
        if let Some(request) = inner.receipt_pend.remove(id) {
            for header in request.headers {
                inner.receipt_tasks.insert(header.number, header);
            }
        }
        if let Some(request) = inner.header_pend.remove(id) {
            inner.skeleton_queue.insert(request.from);
        }
    }

    /// Number of blocks whose bodies still need fetching.
    pub fn pending_blocks(&self) -> usize {
        self.inner.lock().block_tasks.len()
    }

    /// Number of blocks whose receipts still need fetching.
    pub fn pending_receipts(&self) -> usize {
        self.inner.lock().receipt_tasks.len()
    }

    /// Whether any body reservation is outstanding.
    pub fn in_flight_blocks(&self) -> bool {
        !self.inner.lock().block_pend.is_empty()
    }

    /// Whether any receipt reservation is outstanding.
    pub fn in_flight_receipts(&self) -> bool {
        !self.inner.lock().receipt_pend.is_empty()
    }

    fn should_throttle(&self) -> bool {
        self.inner.lock().result_cache.len() >= RESULT_CACHE_LIMIT
    }

    /// Whether body reservations should pause until the processor drains
    /// the result cache.
    pub fn should_throttle_blocks(&self) -> bool {
        self.should_throttle()
    }

    /// Whether receipt reservations should pause until the processor drains
    /// the result cache.
    pub fn should_throttle_receipts(&self) -> bool {
        self.should_throttle()
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Wait until a contiguous run of completed results starting at the
    /// next expected block is available and drain it. Returns an empty
    /// vector once the scheduler is closed and nothing is left.
    pub async fn wait_results(&self) -> Vec<FetchResult> {
        loop {
            let notified = self.results_ready.notified();
            {
                let mut inner = self.inner.lock();
                let ready = inner.ready_results();
                if ready > 0 {
                    // `ready_results` already proved the run is complete.
                    let mut results = Vec::with_capacity(ready);
                    for _ in 0..ready {
                        let number = inner.result_offset;
                        match inner.result_cache.remove(&number) {
                            Some(entry) => {
                                results.push(entry.result);
                                inner.result_offset += 1;
                            }
                            None => break,
                        }
                    }
                    return results;
                }
                if inner.closed {
                    return Vec::new();
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::{PeerTransport, SyncPeer};
    use pyrite_types::{BlockNumber, Hash256, TotalDifficulty};

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
        Arc::new(SyncPeer::new(
            PeerId::from(id),
            1,
            Arc::new(NullTransport),
        ))
    }

    /// Build a linked chain of `n` headers after genesis; blocks at odd
    /// heights carry one transaction so their bodies must be fetched.
    fn chain(n: u64) -> Vec<Header> {
        let mut headers = Vec::new();
        let mut parent = Header::default().hash();
        for number in 1..=n {
            let mut header = Header {
                parent_hash: parent,
                number,
                time: number,
                ..Header::default()
            };
            if number % 2 == 1 {
                let tx = Transaction::new(number.to_be_bytes().to_vec());
                header.tx_root = transaction_root(&[tx]);
            }
            parent = header.hash();
            headers.push(header);
        }
        headers
    }

    fn body_for(header: &Header) -> Vec<Transaction> {
        if header.number % 2 == 1 {
            vec![Transaction::new(header.number.to_be_bytes().to_vec())]
        } else {
            Vec::new()
        }
    }

    #[test]
    fn test_schedule_accepts_contiguous_chunks() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        let headers = chain(8);

        assert_eq!(scheduler.schedule(&headers[..4], 1), 4);
        assert_eq!(scheduler.schedule(&headers[4..], 5), 4);
        assert_eq!(scheduler.pending_blocks(), 8);
        assert_eq!(scheduler.pending_receipts(), 0);
    }

    #[test]
    fn test_schedule_rejects_gapped_chunks() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        let headers = chain(8);

        // Skipping a header breaks both numbering and ancestry.
        let mut gapped = headers[..2].to_vec();
        gapped.push(headers[3].clone());
        assert_eq!(scheduler.schedule(&gapped, 1), 2);
    }

    #[test]
    fn test_fast_mode_schedules_receipts_below_pivot() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Fast, 5);
        let headers = chain(8);

        assert_eq!(scheduler.schedule(&headers, 1), 8);
        assert_eq!(scheduler.pending_blocks(), 8);
        assert_eq!(scheduler.pending_receipts(), 5);
    }

    #[test]
    fn test_reserve_and_deliver_bodies() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        let headers = chain(4);
        scheduler.schedule(&headers, 1);

        let p = peer("a");
        let (request, progress) = scheduler.reserve_bodies(&p, 16);
        let request = request.expect("non-empty blocks need fetching");
        // Blocks 2 and 4 are empty, completed by reservation alone.
        assert!(progress);
        assert_eq!(request.headers.len(), 2);

        let txs: Vec<_> = request.headers.iter().map(body_for).collect();
        let uncles = vec![Vec::new(); 2];
        let (accepted, err) = scheduler.deliver_bodies(&p, txs, uncles);
        assert_eq!(accepted, 2);
        assert!(err.is_none());
    }

    #[test]
    fn test_second_reservation_blocked_while_pending() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        scheduler.schedule(&chain(4), 1);

        let p = peer("a");
        let (first, _) = scheduler.reserve_bodies(&p, 1);
        assert!(first.is_some());
        let (second, progress) = scheduler.reserve_bodies(&p, 1);
        assert!(second.is_none());
        assert!(!progress);
    }

    #[test]
    fn test_deliver_bad_body_is_invalid_chain() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        scheduler.schedule(&chain(2), 1);

        let p = peer("a");
        let (request, _) = scheduler.reserve_bodies(&p, 16);
        let request = request.unwrap();

        let bogus = vec![vec![Transaction::new(vec![0xde, 0xad])]];
        let (accepted, err) = scheduler.deliver_bodies(&p, bogus, vec![Vec::new()]);
        assert_eq!(accepted, 0);
        assert_eq!(err, Some(SyncError::InvalidChain));
        // The failed reservation went back to pending.
        assert_eq!(scheduler.pending_blocks(), request.headers.len());
    }

    #[test]
    fn test_unrequested_delivery_is_stale() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        let p = peer("a");
        let (_, err) = scheduler.deliver_bodies(&p, vec![], vec![]);
        assert_eq!(err, Some(SyncError::StaleDelivery));
    }

    #[test]
    fn test_empty_delivery_marks_lacking() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        scheduler.schedule(&chain(2), 1);

        let p = peer("a");
        let (request, _) = scheduler.reserve_bodies(&p, 16);
        let request = request.unwrap();
        let (accepted, err) = scheduler.deliver_bodies(&p, vec![], vec![]);
        assert_eq!(accepted, 0);
        assert!(err.is_none());
        for header in &request.headers {
            assert!(p.lacks(&header.hash()));
        }
        // The peer that lacks everything can no longer reserve those blocks.
        let (again, progress) = scheduler.reserve_bodies(&p, 16);
        assert!(again.is_none());
        assert!(!progress);
    }

    #[test]
    fn test_expiry_returns_tasks_to_pending() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        scheduler.schedule(&chain(2), 1);

        let p = peer("a");
        let (request, _) = scheduler.reserve_bodies(&p, 16);
        let reserved = request.unwrap().headers.len();
        assert_eq!(scheduler.pending_blocks(), 2 - reserved);

        let fails = scheduler.expire_bodies(Duration::ZERO);
        assert_eq!(fails, vec![(PeerId::from("a"), reserved)]);
        assert_eq!(scheduler.pending_blocks(), 2);
        assert!(!scheduler.in_flight_blocks());
    }

    #[test]
    fn test_revoke_restores_all_kinds() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Fast, 4);
        scheduler.schedule(&chain(4), 1);

        let p = peer("a");
        scheduler.reserve_bodies(&p, 16).0.unwrap();
        scheduler.reserve_receipts(&p, 16).0.unwrap();

        scheduler.revoke(p.id());
        assert!(!scheduler.in_flight_blocks());
        assert!(!scheduler.in_flight_receipts());
    }

    #[test]
    fn test_skeleton_fill_accept_and_finish() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Light, 0);
        let headers = chain(MAX_HEADER_FETCH as u64);
        let anchor = headers[MAX_HEADER_FETCH - 1].clone();

        let (cont_tx, cont_rx) = watch::channel(Wake::default());
        scheduler.schedule_skeleton(1, &[anchor], cont_tx);
        assert_eq!(scheduler.pending_headers(), 1);

        let p = peer("a");
        let from = scheduler.reserve_headers(&p).unwrap();
        assert_eq!(from, 1);

        let (proc_tx, mut proc_rx) = mpsc::channel(1);
        let (accepted, err) = scheduler.deliver_headers(&p, headers.clone(), &proc_tx);
        assert_eq!(accepted, MAX_HEADER_FETCH);
        assert!(err.is_none());
        assert!(cont_rx.borrow().finished);

        let forwarded = proc_rx.try_recv().unwrap();
        assert_eq!(forwarded.len(), MAX_HEADER_FETCH);

        let (filled, proced) = scheduler.retrieve_headers();
        assert_eq!(filled.len(), MAX_HEADER_FETCH);
        assert_eq!(proced, MAX_HEADER_FETCH);
    }

    #[test]
    fn test_skeleton_fill_rejects_mismatch_and_tracks_miss() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Light, 0);
        let headers = chain(MAX_HEADER_FETCH as u64);
        let anchor = headers[MAX_HEADER_FETCH - 1].clone();

        let (cont_tx, _cont_rx) = watch::channel(Wake::default());
        scheduler.schedule_skeleton(1, &[anchor], cont_tx);

        let p = peer("a");
        scheduler.reserve_headers(&p).unwrap();

        // Too short: cannot map onto the skeleton.
        let (proc_tx, _proc_rx) = mpsc::channel(1);
        let (accepted, err) = scheduler.deliver_headers(&p, headers[..10].to_vec(), &proc_tx);
        assert_eq!(accepted, 0);
        assert_eq!(err, Some(SyncError::BadPeer));

        // The segment is pending again, but never again for this peer.
        assert_eq!(scheduler.pending_headers(), 1);
        assert!(scheduler.reserve_headers(&p).is_none());

        let other = peer("b");
        assert_eq!(scheduler.reserve_headers(&other), Some(1));
    }

    #[tokio::test]
    async fn test_wait_results_orders_and_closes() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        let headers = chain(4);
        scheduler.schedule(&headers, 1);

        let p = peer("a");
        let (request, _) = scheduler.reserve_bodies(&p, 16);
        let request = request.unwrap();
        let txs: Vec<_> = request.headers.iter().map(body_for).collect();
        let uncle_lists = vec![Vec::new(); txs.len()];
        scheduler.deliver_bodies(&p, txs, uncle_lists);

        let results = scheduler.wait_results().await;
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.header.number, 1 + i as u64);
        }

        scheduler.close();
        assert!(scheduler.wait_results().await.is_empty());
    }

    #[tokio::test]
    async fn test_wait_results_blocks_on_gap() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Full, 0);
        let headers = chain(3);
        scheduler.schedule(&headers, 1);

        let p = peer("a");
        // Reserve only block 1 (odd, non-empty) and never deliver it; the
        // empty block 2 completes, but nothing is contiguous from 1.
        let (request, _) = scheduler.reserve_bodies(&p, 1);
        assert!(request.is_some());

        tokio::select! {
            _ = scheduler.wait_results() => panic!("results must stay gapped"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    #[test]
    fn test_reset_clears_queues() {
        let scheduler = Scheduler::new();
        scheduler.prepare(1, SyncMode::Fast, 4);
        scheduler.schedule(&chain(4), 1);
        assert!(scheduler.pending_blocks() > 0);

        scheduler.reset();
        assert_eq!(scheduler.pending_blocks(), 0);
        assert_eq!(scheduler.pending_receipts(), 0);
        assert!(!scheduler.is_closed());
    }
}
