//! State trie synchronization.
//!
//! A restartable traversal of the state trie rooted at a block's state
//! root. The process-wide controller accepts new roots (preempting the
//! in-flight traversal) and feeds the active one with node deliveries,
//! request timeouts and peer drops. Nodes are verified by hash before
//! their children are queued, so untrusted peers can only ever slow the
//! walk down.

use crate::chain::StateDb;
use crate::error::{Stage, SyncError, SyncResult};
use crate::fetcher::StatePack;
use crate::peers::{DataKind, PeerId, SyncPeer};
use crate::sync::Synchronizer;
use parking_lot::Mutex;
use pyrite_types::{hash_bytes, Hash256, StateNode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Hash-addressed traversal of one state trie.
pub(crate) struct TrieSync {
    db: Arc<dyn StateDb>,
    queue: VecDeque<Hash256>,
    queued: HashSet<Hash256>,
    fetching: HashSet<Hash256>,
    processed: u64,
}

impl TrieSync {
    /// Start a traversal at `root`. A root already present locally yields
    /// an immediately complete sync.
    pub(crate) fn new(root: Hash256, db: Arc<dyn StateDb>) -> Self {
        let mut sync = Self {
            db,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            fetching: HashSet::new(),
            processed: 0,
        };
        if !root.is_zero() && !sync.db.contains(&root) {
            sync.queue.push_back(root);
            sync.queued.insert(root);
        }
        sync
    }

    /// Nodes still wanted, including ones currently requested.
    pub(crate) fn pending(&self) -> usize {
        self.queue.len() + self.fetching.len()
    }

    /// Nodes committed so far by this traversal.
    pub(crate) fn processed(&self) -> u64 {
        self.processed
    }

    /// Take up to `max` node hashes to request, marking them in flight.
    pub(crate) fn missing(&mut self, max: usize) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        while hashes.len() < max {
            let Some(hash) = self.queue.pop_front() else { break };
            self.fetching.insert(hash);
            hashes.push(hash);
        }
        hashes
    }

    /// Return unanswered requests to the queue.
    pub(crate) fn requeue(&mut self, hashes: &[Hash256]) {
        for hash in hashes {
            if self.fetching.remove(hash) {
                self.queue.push_front(*hash);
            }
        }
    }

    /// Fold delivered node payloads into the traversal. Payloads whose
    /// hash was never requested, or which fail to decode, are ignored; the
    /// count of accepted nodes is returned.
    pub(crate) fn process(&mut self, nodes: Vec<Vec<u8>>) -> usize {
        let mut delivered = 0;
        for data in nodes {
            let hash = hash_bytes(&data);
            if !self.fetching.remove(&hash) {
                trace!(%hash, "Unrequested state node");
                continue;
            }
            let Some(node) = StateNode::decode(&data) else {
                // Hash matched raw bytes but the encoding is garbage; put
                // the request back rather than corrupting the database.
                self.fetching.insert(hash);
                continue;
            };
            self.queued.remove(&hash);
            for child in node.children {
                if !self.db.contains(&child) && self.queued.insert(child) {
                    self.queue.push_back(child);
                }
            }
            self.db.insert(hash, data);
            self.processed += 1;
            delivered += 1;
        }
        delivered
    }
}

struct StateReq {
    peer: Arc<SyncPeer>,
    hashes: Vec<Hash256>,
    deadline: Instant,
    dropped: bool,
    response: Option<Vec<Vec<u8>>>,
}

/// Shared core of one state sync attempt.
pub(crate) struct StateSyncJob {
    root: Hash256,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
    outcome: Mutex<Option<SyncResult<()>>>,
}

impl StateSyncJob {
    fn complete(&self, result: SyncResult<()>) {
        {
            let mut outcome = self.outcome.lock();
            if outcome.is_none() {
                *outcome = Some(result);
            }
        }
        let _ = self.done_tx.send(true);
    }
}

/// Handle to a state sync attempt.
#[derive(Clone)]
pub struct StateSync {
    job: Arc<StateSyncJob>,
    done_rx: watch::Receiver<bool>,
}

impl StateSync {
    pub(crate) fn new(root: Hash256) -> (Self, Arc<StateSyncJob>) {
        let (done_tx, done_rx) = watch::channel(false);
        let job = Arc::new(StateSyncJob {
            root,
            cancel: CancellationToken::new(),
            done_tx,
            outcome: Mutex::new(None),
        });
        (
            Self {
                job: job.clone(),
                done_rx,
            },
            job,
        )
    }

    /// The root this sync is walking toward.
    pub fn root(&self) -> Hash256 {
        self.job.root
    }

    /// Abort the traversal. Idempotent.
    pub fn cancel(&self) {
        self.job.cancel.cancel();
    }

    /// The result so far, if the traversal has terminated.
    pub fn outcome(&self) -> Option<SyncResult<()>> {
        self.job.outcome.lock().clone()
    }

    /// Wait for the traversal to terminate.
    pub async fn wait(&self) -> SyncResult<()> {
        let mut done = self.done_rx.clone();
        loop {
            if *done.borrow_and_update() {
                break;
            }
            if done.changed().await.is_err() {
                break;
            }
        }
        self.outcome()
            .unwrap_or(Err(SyncError::Cancelled(Stage::StateFetch)))
    }
}

impl Synchronizer {
    /// Begin (or retarget) state retrieval at the given root. The returned
    /// handle resolves when the traversal completes, fails or is
    /// preempted.
    pub(crate) async fn sync_state(&self, root: Hash256) -> StateSync {
        let (handle, job) = StateSync::new(root);
        tokio::select! {
            sent = self.state_start_tx.send(job.clone()) => {
                if sent.is_err() {
                    job.complete(Err(SyncError::Cancelled(Stage::StateFetch)));
                }
            }
            _ = self.quit.cancelled() => {
                job.complete(Err(SyncError::Cancelled(Stage::StateFetch)));
            }
        }
        handle
    }

    /// Process-wide controller owning the node-data channel. Runs one
    /// traversal at a time; a newly requested root preempts the current
    /// one. Node deliveries arriving while no traversal runs are dropped.
    pub(crate) async fn state_fetcher(
        self: Arc<Self>,
        mut start_rx: mpsc::Receiver<Arc<StateSyncJob>>,
        mut state_rx: mpsc::Receiver<StatePack>,
    ) {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,

                job = start_rx.recv() => {
                    let Some(job) = job else { return };
                    let mut next = Some(job);
                    while let Some(job) = next.take() {
                        next = self.run_state_sync(job, &mut start_rx, &mut state_rx).await;
                    }
                }

                pack = state_rx.recv() => {
                    if let Some(pack) = pack {
                        trace!(peer = %pack.peer, items = pack.nodes.len(), "State data with no sync running");
                    }
                }
            }
        }
    }

    /// Drive one traversal to completion, failure or preemption. Returns
    /// the preempting job, if any.
    async fn run_state_sync(
        &self,
        job: Arc<StateSyncJob>,
        start_rx: &mut mpsc::Receiver<Arc<StateSyncJob>>,
        state_rx: &mut mpsc::Receiver<StatePack>,
    ) -> Option<Arc<StateSyncJob>> {
        debug!(root = %job.root, "State sync started");

        let mut trie = TrieSync::new(job.root, self.state_db.clone());
        let base_processed = self.stats.read().state_processed;
        let mut active: HashMap<PeerId, StateReq> = HashMap::new();
        let mut finished: VecDeque<StateReq> = VecDeque::new();
        let mut drops = self.peers.subscribe_drops();
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut preempted: Option<Arc<StateSyncJob>> = None;
        let result = loop {
            // Fold finished requests into the traversal before anything
            // else; completion may hinge on them.
            while let Some(mut req) = finished.pop_front() {
                let delivered = match req.response.take() {
                    Some(nodes) => trie.process(nodes),
                    None => 0,
                };
                trie.requeue(&req.hashes);
                req.peer.set_idle(DataKind::States, delivered);
            }
            {
                let mut stats = self.stats.write();
                stats.state_processed = base_processed + trie.processed();
                stats.state_pending = trie.pending() as u64;
            }
            if trie.pending() == 0 {
                break Ok(());
            }

            // Hand new requests to idle peers.
            let (idles, _) = self.peers.state_idle_peers();
            for peer in idles {
                let capacity = peer.capacity(DataKind::States, self.qos.request_rtt());
                let hashes = trie.missing(capacity);
                if hashes.is_empty() {
                    break;
                }
                if peer.fetch_node_data(hashes.clone()).is_err() {
                    trie.requeue(&hashes);
                    continue;
                }
                let req = StateReq {
                    peer: peer.clone(),
                    hashes,
                    deadline: Instant::now() + self.qos.request_ttl(),
                    dropped: false,
                    response: None,
                };
                // A peer can in principle reconnect fast enough to be
                // assigned again while an older request lingers; the older
                // request must surface as finished, never vanish.
                if let Some(mut old) = active.remove(peer.id()) {
                    warn!(peer = %peer.id(), "Busy peer assigned new state fetch");
                    old.dropped = true;
                    finished.push_back(old);
                }
                active.insert(peer.id().clone(), req);
            }

            tokio::select! {
                _ = job.cancel.cancelled() => {
                    break Err(SyncError::Cancelled(Stage::StateFetch));
                }

                _ = self.quit.cancelled() => {
                    break Err(SyncError::Cancelled(Stage::StateFetch));
                }

                next = start_rx.recv() => {
                    preempted = next;
                    break Err(SyncError::Cancelled(Stage::StateFetch));
                }

                pack = state_rx.recv() => {
                    let Some(pack) = pack else {
                        break Err(SyncError::Cancelled(Stage::StateFetch));
                    };
                    match active.remove(&pack.peer) {
                        Some(mut req) => {
                            req.response = Some(pack.nodes);
                            finished.push_back(req);
                        }
                        None => {
                            debug!(peer = %pack.peer, items = pack.nodes.len(), "Unrequested node data");
                        }
                    }
                }

                drop = drops.recv() => {
                    if let Ok(peer_id) = drop {
                        if let Some(mut req) = active.remove(&peer_id) {
                            req.dropped = true;
                            finished.push_back(req);
                        }
                    }
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    let expired: Vec<PeerId> = active
                        .iter()
                        .filter(|(_, req)| req.deadline <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in expired {
                        if let Some(req) = active.remove(&id) {
                            trace!(peer = %id, "State request timed out");
                            finished.push_back(req);
                        }
                    }
                }
            }
        };

        // Unwind outstanding requests so their peers are available to the
        // next traversal.
        for (_, req) in active.drain() {
            trie.requeue(&req.hashes);
            req.peer.set_idle(DataKind::States, 0);
        }
        {
            let mut stats = self.stats.write();
            stats.state_processed = base_processed + trie.processed();
            stats.state_pending = trie.pending() as u64;
        }

        match &result {
            Ok(()) => debug!(root = %job.root, processed = trie.processed(), "State sync completed"),
            Err(err) => debug!(root = %job.root, %err, "State sync terminated"),
        }
        job.complete(result);
        preempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct MemoryStateDb {
        nodes: RwLock<StdHashMap<Hash256, Vec<u8>>>,
    }

    impl StateDb for MemoryStateDb {
        fn contains(&self, hash: &Hash256) -> bool {
            self.nodes.read().contains_key(hash)
        }
        fn insert(&self, hash: Hash256, data: Vec<u8>) {
            self.nodes.write().insert(hash, data);
        }
    }

    /// Two leaves under one root.
    fn small_trie() -> (Hash256, StdHashMap<Hash256, Vec<u8>>) {
        let left = StateNode {
            children: vec![],
            payload: vec![1],
        };
        let right = StateNode {
            children: vec![],
            payload: vec![2],
        };
        let root = StateNode {
            children: vec![left.hash(), right.hash()],
            payload: vec![0],
        };
        let mut nodes = StdHashMap::new();
        let root_hash = root.hash();
        nodes.insert(left.hash(), left.encode());
        nodes.insert(right.hash(), right.encode());
        nodes.insert(root_hash, root.encode());
        (root_hash, nodes)
    }

    #[test]
    fn test_trie_sync_walks_children() {
        let (root, nodes) = small_trie();
        let db = Arc::new(MemoryStateDb::default());
        let mut sync = TrieSync::new(root, db.clone());

        assert_eq!(sync.pending(), 1);
        let wanted = sync.missing(16);
        assert_eq!(wanted, vec![root]);

        let delivered = sync.process(vec![nodes[&root].clone()]);
        assert_eq!(delivered, 1);
        assert_eq!(sync.pending(), 2);

        let wanted = sync.missing(16);
        let payloads: Vec<Vec<u8>> = wanted.iter().map(|h| nodes[h].clone()).collect();
        assert_eq!(sync.process(payloads), 2);
        assert_eq!(sync.pending(), 0);
        assert_eq!(sync.processed(), 3);
        assert!(db.contains(&root));
    }

    #[test]
    fn test_trie_sync_ignores_unrequested_nodes() {
        let (root, nodes) = small_trie();
        let db = Arc::new(MemoryStateDb::default());
        let mut sync = TrieSync::new(root, db);

        // Nothing requested yet, so nothing may be accepted.
        assert_eq!(sync.process(vec![nodes[&root].clone()]), 0);
        assert_eq!(sync.pending(), 1);
    }

    #[test]
    fn test_trie_sync_rejects_corrupt_payload() {
        let (root, _) = small_trie();
        let db = Arc::new(MemoryStateDb::default());
        let mut sync = TrieSync::new(root, db);

        sync.missing(1);
        // Garbage bytes hash to something never requested.
        assert_eq!(sync.process(vec![vec![0xff; 8]]), 0);
        // The root request stays in flight and can be requeued.
        sync.requeue(&[root]);
        assert_eq!(sync.missing(1), vec![root]);
    }

    #[test]
    fn test_trie_sync_complete_when_root_local() {
        let (root, nodes) = small_trie();
        let db = Arc::new(MemoryStateDb::default());
        db.insert(root, nodes[&root].clone());

        let sync = TrieSync::new(root, db);
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn test_trie_sync_skips_known_children() {
        let (root, nodes) = small_trie();
        let db = Arc::new(MemoryStateDb::default());
        // One leaf is already present; only the other should be queued.
        let known_leaf = *StateNode::decode(&nodes[&root])
            .unwrap()
            .children
            .first()
            .unwrap();
        db.insert(known_leaf, nodes[&known_leaf].clone());

        let mut sync = TrieSync::new(root, db);
        sync.missing(1);
        sync.process(vec![nodes[&root].clone()]);
        assert_eq!(sync.pending(), 1);
    }
}
