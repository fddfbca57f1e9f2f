//! Test harness for synchronization tests.
//!
//! Provides a deterministic in-memory chain store, a chain-data builder
//! (with fork support), and scripted peers that serve chain data back
//! through the synchronizer's delivery methods after a configurable delay.

use parking_lot::{Mutex, RwLock};
use pyrite_sync::{
    ChainStore, ImportFailure, LightPeerTransport, PeerDropFn, PeerId, PeerTransport, StateDb,
    SyncConfig, Synchronizer, MAX_HEADER_FETCH,
};
use pyrite_types::{
    receipt_root, transaction_root, uncle_root, Block, BlockNumber, Hash256, Header, Receipt,
    StateNode, TotalDifficulty, Transaction,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Install a test-writer tracing subscriber. Safe to call from every test;
/// only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ----------------------------------------------------------------------
// Chain data builder
// ----------------------------------------------------------------------

/// One fully materialized block of a scripted chain.
#[derive(Clone)]
pub struct BlockData {
    /// The block header.
    pub header: Header,
    /// Transactions committed to by the header.
    pub transactions: Vec<Transaction>,
    /// Uncle headers committed to by the header.
    pub uncles: Vec<Header>,
    /// Receipts committed to by the header.
    pub receipts: Vec<Receipt>,
    /// Total difficulty up to and including this block.
    pub td: TotalDifficulty,
}

/// A scripted chain peers can serve from.
pub struct ChainData {
    /// The shared genesis header.
    pub genesis: Header,
    /// Blocks 1..=len, in order.
    pub blocks: Vec<BlockData>,
    by_hash: HashMap<Hash256, u64>,
    state_nodes: HashMap<Hash256, Vec<u8>>,
}

impl ChainData {
    /// Build a chain of `len` blocks on top of a default genesis. Every
    /// third block is empty; the rest carry one transaction and one
    /// receipt.
    pub fn build(len: u64) -> Arc<Self> {
        Self::extend(Header::default(), Vec::new(), 0, len, b"main")
    }

    /// Build a chain sharing `base`'s blocks up to `at` and diverging
    /// afterwards, reaching `len` blocks in total.
    pub fn fork(base: &ChainData, at: u64, len: u64) -> Arc<Self> {
        let shared: Vec<BlockData> = base.blocks[..at as usize].to_vec();
        Self::extend(base.genesis.clone(), shared, at, len, b"fork")
    }

    fn extend(
        genesis: Header,
        mut blocks: Vec<BlockData>,
        from: u64,
        len: u64,
        tag: &[u8],
    ) -> Arc<Self> {
        let mut parent = blocks
            .last()
            .map(|block| block.header.hash())
            .unwrap_or_else(|| genesis.hash());
        let mut td = blocks.last().map(|block| block.td).unwrap_or_default();

        for number in (from + 1)..=len {
            let transactions = if number % 3 == 0 {
                Vec::new()
            } else {
                let mut data = tag.to_vec();
                data.extend_from_slice(&number.to_be_bytes());
                vec![Transaction::new(data)]
            };
            let receipts: Vec<Receipt> = transactions
                .iter()
                .map(|tx| {
                    let mut data = b"receipt".to_vec();
                    data.extend_from_slice(&tx.data);
                    Receipt::new(data)
                })
                .collect();
            let mut payload = tag.to_vec();
            payload.extend_from_slice(&number.to_be_bytes());
            let state_node = StateNode {
                children: Vec::new(),
                payload,
            };

            let header = Header {
                parent_hash: parent,
                number,
                state_root: state_node.hash(),
                tx_root: transaction_root(&transactions),
                uncle_root: uncle_root(&[]),
                receipt_root: receipt_root(&receipts),
                difficulty: 100,
                time: number,
                extra: tag.to_vec(),
            };
            parent = header.hash();
            td += header.difficulty as TotalDifficulty;
            blocks.push(BlockData {
                header,
                transactions,
                uncles: Vec::new(),
                receipts,
                td,
            });
        }

        let mut by_hash = HashMap::new();
        let mut state_nodes = HashMap::new();
        for block in &blocks {
            by_hash.insert(block.header.hash(), block.header.number);
            let node = StateNode {
                children: Vec::new(),
                payload: {
                    let mut payload = block.header.extra.clone();
                    payload.extend_from_slice(&block.header.number.to_be_bytes());
                    payload
                },
            };
            state_nodes.insert(node.hash(), node.encode());
        }
        Arc::new(Self {
            genesis,
            blocks,
            by_hash,
            state_nodes,
        })
    }

    /// Chain length in blocks (excluding genesis).
    pub fn len(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Whether the chain holds no blocks beyond genesis.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Header at a height, genesis included.
    pub fn header_at(&self, number: u64) -> Option<Header> {
        if number == 0 {
            return Some(self.genesis.clone());
        }
        self.blocks
            .get(number as usize - 1)
            .map(|block| block.header.clone())
    }

    /// Block at a height.
    pub fn block_at(&self, number: u64) -> Option<&BlockData> {
        if number == 0 {
            return None;
        }
        self.blocks.get(number as usize - 1)
    }

    /// Height of the block with the given hash.
    pub fn number_of(&self, hash: &Hash256) -> Option<u64> {
        if *hash == self.genesis.hash() {
            return Some(0);
        }
        self.by_hash.get(hash).copied()
    }

    /// Total difficulty up to a height.
    pub fn td_at(&self, number: u64) -> TotalDifficulty {
        if number == 0 {
            return self.genesis.difficulty as TotalDifficulty;
        }
        self.blocks[number as usize - 1].td
    }

    /// Advertised head of a peer claiming the chain up to `height`.
    pub fn head(&self, height: u64) -> (Hash256, TotalDifficulty) {
        let hash = self
            .header_at(height)
            .map(|header| header.hash())
            .unwrap_or_else(|| self.genesis.hash());
        (hash, self.td_at(height))
    }

    /// Raw state node payload by hash.
    pub fn state_node(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.state_nodes.get(hash).cloned()
    }
}

// ----------------------------------------------------------------------
// In-memory chain store
// ----------------------------------------------------------------------

struct ChainInner {
    headers: HashMap<Hash256, Header>,
    canonical: BTreeMap<u64, Hash256>,
    tds: HashMap<Hash256, TotalDifficulty>,
    blocks: HashSet<Hash256>,
    receipts: HashSet<Hash256>,
    states: HashSet<Hash256>,
    header_head: (u64, Hash256),
    block_head: (u64, Hash256),
    fast_head: (u64, Hash256),
}

/// An in-memory chain store doubling as the state node database.
pub struct TestChain {
    inner: RwLock<ChainInner>,
    state_nodes: RwLock<HashMap<Hash256, Vec<u8>>>,
    /// Every `fast_sync_commit_head` call, in order.
    pub commit_heads: Mutex<Vec<Hash256>>,
    /// Injected header-insert failure: inserting this height fails.
    pub fail_header_insert_at: Mutex<Option<u64>>,
}

impl TestChain {
    /// Create a chain store holding only the genesis block.
    pub fn new(genesis: Header) -> Arc<Self> {
        let hash = genesis.hash();
        let mut headers = HashMap::new();
        headers.insert(hash, genesis.clone());
        let mut canonical = BTreeMap::new();
        canonical.insert(0, hash);
        let mut tds = HashMap::new();
        tds.insert(hash, genesis.difficulty as TotalDifficulty);
        let mut present = HashSet::new();
        present.insert(hash);

        Arc::new(Self {
            inner: RwLock::new(ChainInner {
                headers,
                canonical,
                tds,
                blocks: present.clone(),
                receipts: HashSet::new(),
                states: present,
                header_head: (0, hash),
                block_head: (0, hash),
                fast_head: (0, hash),
            }),
            state_nodes: RwLock::new(HashMap::new()),
            commit_heads: Mutex::new(Vec::new()),
            fail_header_insert_at: Mutex::new(None),
        })
    }

    /// Preload the local chain with `data` up to `upto`; `full` also marks
    /// bodies and state as present (a fully synced prefix).
    pub fn preload(&self, data: &ChainData, upto: u64, full: bool) {
        let mut inner = self.inner.write();
        for number in 1..=upto {
            let block = data.block_at(number).expect("preload within chain");
            let hash = block.header.hash();
            inner.headers.insert(hash, block.header.clone());
            inner.canonical.insert(number, hash);
            inner.tds.insert(hash, block.td);
            inner.header_head = (number, hash);
            if full {
                inner.blocks.insert(hash);
                inner.states.insert(hash);
                inner.block_head = (number, hash);
                inner.fast_head = (number, hash);
            }
        }
    }

    /// Canonical hash at a height.
    pub fn canonical_hash(&self, number: u64) -> Option<Hash256> {
        self.inner.read().canonical.get(&number).copied()
    }

    /// Height of the header chain head.
    pub fn header_head(&self) -> u64 {
        self.inner.read().header_head.0
    }

    /// Whether the block was imported together with its receipts.
    pub fn has_receipts(&self, hash: &Hash256) -> bool {
        self.inner.read().receipts.contains(hash)
    }
}

impl ChainStore for TestChain {
    fn current_header(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.header_head.1].clone()
    }

    fn current_block(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.block_head.1].clone()
    }

    fn current_fast_block(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.fast_head.1].clone()
    }

    fn has_header(&self, hash: &Hash256, number: BlockNumber) -> bool {
        self.inner
            .read()
            .headers
            .get(hash)
            .map(|header| header.number == number)
            .unwrap_or(false)
    }

    fn has_block_and_state(&self, hash: &Hash256) -> bool {
        let inner = self.inner.read();
        inner.blocks.contains(hash) && inner.states.contains(hash)
    }

    fn header_by_hash(&self, hash: &Hash256) -> Option<Header> {
        self.inner.read().headers.get(hash).cloned()
    }

    fn td_by_hash(&self, hash: &Hash256) -> Option<TotalDifficulty> {
        self.inner.read().tds.get(hash).copied()
    }

    fn insert_header_chain(
        &self,
        headers: &[Header],
        _verify_frequency: usize,
    ) -> Result<(), ImportFailure> {
        let fail_at = *self.fail_header_insert_at.lock();
        let mut inner = self.inner.write();
        for (i, header) in headers.iter().enumerate() {
            if fail_at == Some(header.number) {
                return Err(ImportFailure::new(i, "injected header failure"));
            }
            let parent_td = match inner.tds.get(&header.parent_hash) {
                Some(td) => *td,
                None => return Err(ImportFailure::new(i, "unknown parent")),
            };
            let hash = header.hash();
            inner.headers.insert(hash, header.clone());
            inner.canonical.insert(header.number, hash);
            inner.tds.insert(hash, parent_td + header.difficulty as TotalDifficulty);
            if header.number > inner.header_head.0 {
                inner.header_head = (header.number, hash);
            }
        }
        Ok(())
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ImportFailure> {
        let mut inner = self.inner.write();
        for (i, block) in blocks.iter().enumerate() {
            let header = &block.header;
            let parent_td = match inner.tds.get(&header.parent_hash) {
                Some(td) => *td,
                None => return Err(ImportFailure::new(i, "unknown parent")),
            };
            if !inner.states.contains(&header.parent_hash) {
                return Err(ImportFailure::new(i, "parent state missing"));
            }
            let hash = header.hash();
            inner.headers.insert(hash, header.clone());
            inner.canonical.insert(header.number, hash);
            inner.tds.insert(hash, parent_td + header.difficulty as TotalDifficulty);
            inner.blocks.insert(hash);
            inner.states.insert(hash);
            if header.number > inner.header_head.0 {
                inner.header_head = (header.number, hash);
            }
            if header.number > inner.block_head.0 {
                inner.block_head = (header.number, hash);
            }
            if header.number > inner.fast_head.0 {
                inner.fast_head = (header.number, hash);
            }
        }
        Ok(())
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<(), ImportFailure> {
        if blocks.len() != receipts.len() {
            return Err(ImportFailure::new(0, "block and receipt counts differ"));
        }
        let mut inner = self.inner.write();
        for (i, block) in blocks.iter().enumerate() {
            let hash = block.hash();
            if !inner.headers.contains_key(&hash) {
                return Err(ImportFailure::new(i, "receipt import without header"));
            }
            inner.blocks.insert(hash);
            inner.receipts.insert(hash);
            if block.number() > inner.fast_head.0 {
                inner.fast_head = (block.number(), hash);
            }
        }
        Ok(())
    }

    fn fast_sync_commit_head(&self, hash: Hash256) -> Result<(), ImportFailure> {
        let mut inner = self.inner.write();
        let Some(header) = inner.headers.get(&hash).cloned() else {
            return Err(ImportFailure::new(0, "unknown head"));
        };
        if !self.state_nodes.read().contains_key(&header.state_root) {
            return Err(ImportFailure::new(0, "state root not synced"));
        }
        inner.states.insert(hash);
        inner.block_head = (header.number, hash);
        drop(inner);
        self.commit_heads.lock().push(hash);
        Ok(())
    }

    fn rollback(&self, hashes: &[Hash256]) {
        let mut inner = self.inner.write();
        let mut lowest = u64::MAX;
        for hash in hashes {
            if let Some(header) = inner.headers.remove(hash) {
                lowest = lowest.min(header.number);
                inner.canonical.remove(&header.number);
                inner.tds.remove(hash);
                inner.blocks.remove(hash);
                inner.receipts.remove(hash);
                inner.states.remove(hash);
            }
        }
        if lowest == u64::MAX {
            return;
        }
        let head = lowest.saturating_sub(1);
        let head_hash = inner.canonical.get(&head).copied();
        if let Some(hash) = head_hash {
            if inner.header_head.0 >= lowest {
                inner.header_head = (head, hash);
            }
            if inner.block_head.0 >= lowest {
                inner.block_head = (head, hash);
            }
            if inner.fast_head.0 >= lowest {
                inner.fast_head = (head, hash);
            }
        }
    }
}

impl StateDb for TestChain {
    fn contains(&self, hash: &Hash256) -> bool {
        self.state_nodes.read().contains_key(hash)
    }

    fn insert(&self, hash: Hash256, data: Vec<u8>) {
        self.state_nodes.write().insert(hash, data);
    }
}

// ----------------------------------------------------------------------
// Scripted peers
// ----------------------------------------------------------------------

/// Request counters of one scripted peer.
#[derive(Default)]
pub struct PeerCounters {
    /// Header requests issued to the peer.
    pub header_requests: AtomicUsize,
    /// Body requests issued to the peer.
    pub body_requests: AtomicUsize,
    /// Receipt requests issued to the peer.
    pub receipt_requests: AtomicUsize,
    /// State node requests issued to the peer.
    pub node_requests: AtomicUsize,
}

/// Behaviour knobs of a scripted peer.
#[derive(Clone)]
pub struct PeerOptions {
    /// Height the peer claims as its head; defaults to its full chain.
    pub claimed_height: Option<u64>,
    /// Highest block the peer actually serves; defaults to its full chain.
    pub serve_upto: Option<u64>,
    /// Never answer skeleton header requests (master stall scenario).
    pub mute_skeleton: bool,
    /// Simulated network latency.
    pub delay: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            claimed_height: None,
            serve_upto: None,
            mute_skeleton: false,
            delay: Duration::from_millis(1),
        }
    }
}

/// Handle to a registered scripted peer.
pub struct PeerHandle {
    /// The peer's identifier.
    pub id: PeerId,
    /// Its request counters.
    pub counters: Arc<PeerCounters>,
}

struct TestPeer {
    id: PeerId,
    sync: Weak<Synchronizer>,
    data: Arc<ChainData>,
    options: PeerOptions,
    counters: Arc<PeerCounters>,
}

impl TestPeer {
    fn serve_upto(&self) -> u64 {
        self.options.serve_upto.unwrap_or_else(|| self.data.len())
    }

    fn headers_from(&self, from: u64, amount: usize, skip: u64) -> Vec<Header> {
        let mut headers = Vec::new();
        let mut number = from;
        let upto = self.serve_upto();
        while headers.len() < amount && number <= upto {
            match self.data.header_at(number) {
                Some(header) => headers.push(header),
                None => break,
            }
            number += skip + 1;
        }
        headers
    }

    fn deliver_headers_later(&self, headers: Vec<Header>) {
        let sync = self.sync.clone();
        let id = self.id.clone();
        let delay = self.options.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sync) = sync.upgrade() {
                let _ = sync.deliver_headers(&id, headers).await;
            }
        });
    }
}

impl PeerTransport for TestPeer {
    fn head(&self) -> (Hash256, TotalDifficulty) {
        let height = self.options.claimed_height.unwrap_or_else(|| self.data.len());
        self.data.head(height)
    }

    fn request_headers_by_hash(&self, origin: Hash256, amount: usize, skip: u64, _reverse: bool) {
        self.counters.header_requests.fetch_add(1, Ordering::SeqCst);
        let headers = match self.data.number_of(&origin) {
            Some(number) => self.headers_from(number, amount, skip),
            None => Vec::new(),
        };
        self.deliver_headers_later(headers);
    }

    fn request_headers_by_number(&self, origin: BlockNumber, amount: usize, skip: u64, _reverse: bool) {
        self.counters.header_requests.fetch_add(1, Ordering::SeqCst);
        if self.options.mute_skeleton && skip as usize == MAX_HEADER_FETCH - 1 {
            return;
        }
        let headers = self.headers_from(origin, amount, skip);
        self.deliver_headers_later(headers);
    }

    fn request_bodies(&self, hashes: Vec<Hash256>) {
        self.counters.body_requests.fetch_add(1, Ordering::SeqCst);
        let mut transactions = Vec::new();
        let mut uncles = Vec::new();
        for hash in &hashes {
            if let Some(number) = self.data.number_of(hash) {
                if let Some(block) = self.data.block_at(number) {
                    transactions.push(block.transactions.clone());
                    uncles.push(block.uncles.clone());
                }
            }
        }
        let sync = self.sync.clone();
        let id = self.id.clone();
        let delay = self.options.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sync) = sync.upgrade() {
                let _ = sync.deliver_bodies(&id, transactions, uncles).await;
            }
        });
    }

    fn request_receipts(&self, hashes: Vec<Hash256>) {
        self.counters.receipt_requests.fetch_add(1, Ordering::SeqCst);
        let mut receipts = Vec::new();
        for hash in &hashes {
            if let Some(number) = self.data.number_of(hash) {
                if let Some(block) = self.data.block_at(number) {
                    receipts.push(block.receipts.clone());
                }
            }
        }
        let sync = self.sync.clone();
        let id = self.id.clone();
        let delay = self.options.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sync) = sync.upgrade() {
                let _ = sync.deliver_receipts(&id, receipts).await;
            }
        });
    }

    fn request_node_data(&self, hashes: Vec<Hash256>) {
        self.counters.node_requests.fetch_add(1, Ordering::SeqCst);
        let mut nodes = Vec::new();
        for hash in &hashes {
            if let Some(data) = self.data.state_node(hash) {
                nodes.push(data);
            }
        }
        let sync = self.sync.clone();
        let id = self.id.clone();
        let delay = self.options.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sync) = sync.upgrade() {
                let _ = sync.deliver_node_data(&id, nodes).await;
            }
        });
    }
}

/// A scripted peer that only answers header requests.
struct LightTestPeer(TestPeer);

impl LightPeerTransport for LightTestPeer {
    fn head(&self) -> (Hash256, TotalDifficulty) {
        PeerTransport::head(&self.0)
    }

    fn request_headers_by_hash(&self, origin: Hash256, amount: usize, skip: u64, reverse: bool) {
        PeerTransport::request_headers_by_hash(&self.0, origin, amount, skip, reverse)
    }

    fn request_headers_by_number(&self, origin: BlockNumber, amount: usize, skip: u64, reverse: bool) {
        PeerTransport::request_headers_by_number(&self.0, origin, amount, skip, reverse)
    }
}

// ----------------------------------------------------------------------
// Environment
// ----------------------------------------------------------------------

/// A synchronizer wired to an in-memory chain and scripted peers.
pub struct TestEnv {
    /// The synchronizer under test.
    pub sync: Arc<Synchronizer>,
    /// Its chain store and state database.
    pub chain: Arc<TestChain>,
    /// Peers reported to the drop callback, in order.
    pub dropped: Arc<Mutex<Vec<PeerId>>>,
}

impl TestEnv {
    /// Create an environment around the given genesis with default
    /// configuration.
    pub fn new(genesis: Header) -> Self {
        Self::with_config(genesis, SyncConfig::default())
    }

    /// Create an environment with a custom configuration.
    pub fn with_config(genesis: Header, config: SyncConfig) -> Self {
        let chain = TestChain::new(genesis);
        let dropped: Arc<Mutex<Vec<PeerId>>> = Arc::new(Mutex::new(Vec::new()));
        let holder: Arc<OnceLock<Weak<Synchronizer>>> = Arc::new(OnceLock::new());

        let drop_peer: PeerDropFn = {
            let dropped = dropped.clone();
            let holder = holder.clone();
            Arc::new(move |id: &PeerId| {
                dropped.lock().push(id.clone());
                if let Some(sync) = holder.get().and_then(|weak| weak.upgrade()) {
                    let _ = sync.unregister_peer(id);
                }
            })
        };

        let sync = Synchronizer::new(chain.clone(), chain.clone(), drop_peer, config);
        let _ = holder.set(Arc::downgrade(&sync));

        Self {
            sync,
            chain,
            dropped,
        }
    }

    /// Register a scripted peer serving `data`.
    pub fn add_peer(&self, id: &str, data: Arc<ChainData>, options: PeerOptions) -> PeerHandle {
        let counters = Arc::new(PeerCounters::default());
        let peer = TestPeer {
            id: PeerId::from(id),
            sync: Arc::downgrade(&self.sync),
            data,
            options,
            counters: counters.clone(),
        };
        self.sync
            .register_peer(PeerId::from(id), 1, Arc::new(peer))
            .expect("peer registration");
        PeerHandle {
            id: PeerId::from(id),
            counters,
        }
    }

    /// Register a scripted header-only peer serving `data`.
    pub fn add_light_peer(&self, id: &str, data: Arc<ChainData>, options: PeerOptions) -> PeerHandle {
        let counters = Arc::new(PeerCounters::default());
        let peer = LightTestPeer(TestPeer {
            id: PeerId::from(id),
            sync: Arc::downgrade(&self.sync),
            data,
            options,
            counters: counters.clone(),
        });
        self.sync
            .register_light_peer(PeerId::from(id), 1, peer)
            .expect("peer registration");
        PeerHandle {
            id: PeerId::from(id),
            counters,
        }
    }
}
