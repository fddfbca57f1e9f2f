//! Synchronizer façade and session orchestration.
//!
//! A single [`Synchronizer`] outlives any number of sync sessions. Each
//! `start` call drives one session: probe the master peer's head, locate
//! the common ancestor, then run the header pipeline, the content fetch
//! loops and the mode-specific content processor concurrently until the
//! first error wins or everything completes. Deliveries from the network
//! layer are routed into the live session through bounded channels.

use crate::chain::{ChainStore, StateDb};
use crate::error::{Stage, SyncError, SyncResult};
use crate::fetcher::{
    fetch_parts, BodiesKind, BodyPack, HeaderPack, ReceiptPack, ReceiptsKind, StatePack, Wake,
};
use crate::peers::{
    LightPeerAdapter, LightPeerTransport, PeerDropFn, PeerId, PeerRegistry, PeerTransport, SyncPeer,
};
use crate::qos::QosEstimator;
use crate::scheduler::Scheduler;
use crate::state::StateSyncJob;
use crate::{FS_CRITICAL_TRIALS, FS_MIN_FULL_BLOCKS, FS_PIVOT_INTERVAL};
use parking_lot::{Mutex, RwLock};
use pyrite_types::{Hash256, Header, Receipt, TotalDifficulty, Transaction};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Synchronization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Download and execute every block.
    #[default]
    Full,
    /// Download receipts up to a pivot block, the state trie at the pivot,
    /// and execute only the blocks above it.
    Fast,
    /// Download and verify headers only.
    Light,
}

/// Lifecycle notifications emitted by the synchronizer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync session started.
    Started,
    /// A sync session completed successfully.
    Completed,
    /// A sync session failed.
    Failed(SyncError),
}

/// Externally visible synchronization boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncProgress {
    /// Block the current (or last) session started from.
    pub starting_block: u64,
    /// Block the chain is currently at, per the active mode.
    pub current_block: u64,
    /// Highest block advertised by the master peer.
    pub highest_block: u64,
    /// State trie nodes downloaded so far.
    pub pulled_states: u64,
    /// State trie nodes known to exist, downloaded or pending.
    pub known_states: u64,
}

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lowest peer protocol version accepted for syncing.
    pub min_protocol_version: u32,
    /// Randomization window for picking the fast-sync pivot.
    pub pivot_interval: u64,
    /// Number of blocks below the advertised head that are always fully
    /// executed.
    pub min_full_blocks: u64,
    /// Pivot failures tolerated before fast sync degrades to full sync.
    pub critical_trials: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_protocol_version: 1,
            pivot_interval: FS_PIVOT_INTERVAL,
            min_full_blocks: FS_MIN_FULL_BLOCKS,
            critical_trials: FS_CRITICAL_TRIALS,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SyncStats {
    pub origin: u64,
    pub height: u64,
    pub state_processed: u64,
    pub state_pending: u64,
}

/// Per-session context shared by the worker tasks.
pub(crate) struct Session {
    pub mode: SyncMode,
    pub master: Arc<SyncPeer>,
    pub td: TotalDifficulty,
    pub cancel: CancellationToken,
    pub header_proc_tx: mpsc::Sender<Vec<Header>>,
    pub body_wake: watch::Sender<Wake>,
    pub receipt_wake: watch::Sender<Wake>,
}

/// Delivery endpoints of the live session.
struct SessionChannels {
    cancel: CancellationToken,
    master: PeerId,
    header_tx: mpsc::Sender<HeaderPack>,
    body_tx: mpsc::Sender<BodyPack>,
    receipt_tx: mpsc::Sender<ReceiptPack>,
}

/// The block synchronizer.
pub struct Synchronizer {
    pub(crate) config: SyncConfig,
    pub(crate) chain: Arc<dyn ChainStore>,
    pub(crate) state_db: Arc<dyn StateDb>,
    pub(crate) peers: Arc<PeerRegistry>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) qos: Arc<QosEstimator>,
    pub(crate) drop_peer: PeerDropFn,
    pub(crate) quit: CancellationToken,
    pub(crate) stats: RwLock<SyncStats>,
    pub(crate) pivot_lock: Mutex<Option<Header>>,
    pub(crate) pivot_fails: AtomicU32,
    pub(crate) state_start_tx: mpsc::Sender<Arc<StateSyncJob>>,
    state_tx: mpsc::Sender<StatePack>,
    mode: RwLock<SyncMode>,
    synchronising: AtomicBool,
    notified: AtomicBool,
    session: Mutex<Option<SessionChannels>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Synchronizer {
    /// Create a synchronizer and spawn its process-wide workers (QoS tuner
    /// and state fetch controller). Must be called within a tokio runtime.
    pub fn new(
        chain: Arc<dyn ChainStore>,
        state_db: Arc<dyn StateDb>,
        drop_peer: PeerDropFn,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (state_start_tx, state_start_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(16);

        let sync = Arc::new(Self {
            config,
            chain,
            state_db,
            peers: Arc::new(PeerRegistry::new()),
            scheduler: Scheduler::new(),
            qos: Arc::new(QosEstimator::new()),
            drop_peer,
            quit: CancellationToken::new(),
            stats: RwLock::new(SyncStats::default()),
            pivot_lock: Mutex::new(None),
            pivot_fails: AtomicU32::new(0),
            state_start_tx,
            state_tx,
            mode: RwLock::new(SyncMode::default()),
            synchronising: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            session: Mutex::new(None),
            events,
        });

        tokio::spawn(
            sync.qos
                .clone()
                .tuner(sync.peers.clone(), sync.quit.clone()),
        );
        tokio::spawn(sync.clone().state_fetcher(state_start_rx, state_rx));
        sync
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Whether a session is currently running.
    pub fn syncing(&self) -> bool {
        self.synchronising.load(Ordering::SeqCst)
    }

    /// Number of consecutive pivot failures in the critical section.
    pub fn pivot_failures(&self) -> u32 {
        self.pivot_fails.load(Ordering::SeqCst)
    }

    /// The pinned pivot header, if a failed session ever locked one in.
    pub fn locked_pivot(&self) -> Option<Header> {
        self.pivot_lock.lock().clone()
    }

    /// Current synchronization boundaries and state download counters.
    pub fn progress(&self) -> SyncProgress {
        let stats = self.stats.read();
        let current = match *self.mode.read() {
            SyncMode::Full => self.chain.current_block().number,
            SyncMode::Fast => self.chain.current_fast_block().number,
            SyncMode::Light => self.chain.current_header().number,
        };
        SyncProgress {
            starting_block: stats.origin,
            current_block: current,
            highest_block: stats.height,
            pulled_states: stats.state_processed,
            known_states: stats.state_processed + stats.state_pending,
        }
    }

    // ------------------------------------------------------------------
    // Peer management
    // ------------------------------------------------------------------

    /// Register a fully capable peer as a block source.
    pub fn register_peer(
        &self,
        id: PeerId,
        version: u32,
        peer: Arc<dyn PeerTransport>,
    ) -> SyncResult<()> {
        trace!(peer = %id, "Registering sync peer");
        let record = Arc::new(SyncPeer::new(id.clone(), version, peer));
        if let Err(err) = self.peers.register(record) {
            warn!(peer = %id, %err, "Failed to register sync peer");
            return Err(err);
        }
        self.qos.reduce_confidence(self.peers.len());
        Ok(())
    }

    /// Register a header-only peer, wrapping it so it appears as a regular
    /// one.
    pub fn register_light_peer<T: LightPeerTransport + 'static>(
        &self,
        id: PeerId,
        version: u32,
        peer: T,
    ) -> SyncResult<()> {
        self.register_peer(id, version, Arc::new(LightPeerAdapter(peer)))
    }

    /// Remove a peer, revoking any reservations it holds. Unregistering
    /// the session's master peer cancels the session.
    pub fn unregister_peer(&self, id: &PeerId) -> SyncResult<()> {
        trace!(peer = %id, "Unregistering sync peer");
        if let Err(err) = self.peers.unregister(id) {
            warn!(peer = %id, %err, "Failed to unregister sync peer");
            return Err(err);
        }
        self.scheduler.revoke(id);

        let was_master = {
            let session = self.session.lock();
            session
                .as_ref()
                .map(|channels| channels.master == *id)
                .unwrap_or(false)
        };
        if was_master {
            self.cancel();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Try to bring the local chain up to the given peer's advertised
    /// head. Peer-fault failures report the master peer to the drop
    /// callback; transient conditions are left for the caller to retry.
    pub async fn start(
        self: &Arc<Self>,
        id: &PeerId,
        head: Hash256,
        td: TotalDifficulty,
        mode: SyncMode,
    ) -> SyncResult<()> {
        let result = self.synchronise(id, head, td, mode).await;
        match &result {
            Ok(()) => {}
            Err(SyncError::Busy) => {}
            Err(err) if err.is_peer_fault() => {
                warn!(peer = %id, %err, "Synchronisation failed, dropping peer");
                (self.drop_peer)(id);
            }
            Err(err) => {
                warn!(%err, "Synchronisation failed, retrying");
            }
        }
        result
    }

    /// Abort the current session, if any. Idempotent and safe to call from
    /// any task.
    pub fn cancel(&self) {
        let session = self.session.lock();
        if let Some(channels) = session.as_ref() {
            channels.cancel.cancel();
        }
    }

    /// Abort forever: stops the process-wide workers and the current
    /// session. The synchronizer cannot be restarted afterwards.
    pub fn terminate(&self) {
        self.quit.cancel();
        self.cancel();
    }

    // ------------------------------------------------------------------
    // Deliveries
    // ------------------------------------------------------------------

    /// Inject a batch of headers received from a remote peer.
    pub async fn deliver_headers(&self, id: &PeerId, headers: Vec<Header>) -> SyncResult<()> {
        let (tx, cancel) = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(channels) => (channels.header_tx.clone(), channels.cancel.clone()),
                None => return Err(SyncError::NoSyncActive),
            }
        };
        let pack = HeaderPack {
            peer: id.clone(),
            headers,
        };
        tokio::select! {
            sent = tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = cancel.cancelled() => Err(SyncError::NoSyncActive),
        }
    }

    /// Inject a batch of block bodies received from a remote peer.
    pub async fn deliver_bodies(
        &self,
        id: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<Header>>,
    ) -> SyncResult<()> {
        let (tx, cancel) = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(channels) => (channels.body_tx.clone(), channels.cancel.clone()),
                None => return Err(SyncError::NoSyncActive),
            }
        };
        let pack = BodyPack {
            peer: id.clone(),
            transactions,
            uncles,
        };
        tokio::select! {
            sent = tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = cancel.cancelled() => Err(SyncError::NoSyncActive),
        }
    }

    /// Inject a batch of receipts received from a remote peer.
    pub async fn deliver_receipts(
        &self,
        id: &PeerId,
        receipts: Vec<Vec<Receipt>>,
    ) -> SyncResult<()> {
        let (tx, cancel) = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(channels) => (channels.receipt_tx.clone(), channels.cancel.clone()),
                None => return Err(SyncError::NoSyncActive),
            }
        };
        let pack = ReceiptPack {
            peer: id.clone(),
            receipts,
        };
        tokio::select! {
            sent = tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = cancel.cancelled() => Err(SyncError::NoSyncActive),
        }
    }

    /// Inject a batch of state trie nodes received from a remote peer.
    pub async fn deliver_node_data(&self, id: &PeerId, nodes: Vec<Vec<u8>>) -> SyncResult<()> {
        let cancel = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(channels) => channels.cancel.clone(),
                None => return Err(SyncError::NoSyncActive),
            }
        };
        let pack = StatePack {
            peer: id.clone(),
            nodes,
        };
        tokio::select! {
            sent = self.state_tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = cancel.cancelled() => Err(SyncError::NoSyncActive),
        }
    }

    // ------------------------------------------------------------------
    // Session driving
    // ------------------------------------------------------------------

    async fn synchronise(
        self: &Arc<Self>,
        id: &PeerId,
        head: Hash256,
        td: TotalDifficulty,
        mode: SyncMode,
    ) -> SyncResult<()> {
        // Only one session may ever run at a time.
        if self
            .synchronising
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        let result = self.run_session(id, head, td, mode).await;

        // No matter what, the cancel flag must not stay open.
        {
            let mut session = self.session.lock();
            if let Some(channels) = session.take() {
                channels.cancel.cancel();
            }
        }
        self.synchronising.store(false, Ordering::SeqCst);
        result
    }

    async fn run_session(
        self: &Arc<Self>,
        id: &PeerId,
        head: Hash256,
        td: TotalDifficulty,
        requested_mode: SyncMode,
    ) -> SyncResult<()> {
        if self
            .notified
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Block synchronisation started");
        }
        // Clear any internal leftover state from earlier runs.
        self.scheduler.reset();
        self.peers.reset();

        let cancel = CancellationToken::new();
        let (header_tx, header_rx) = mpsc::channel(1);
        let (body_tx, body_rx) = mpsc::channel(1);
        let (receipt_tx, receipt_rx) = mpsc::channel(1);
        *self.session.lock() = Some(SessionChannels {
            cancel: cancel.clone(),
            master: id.clone(),
            header_tx,
            body_tx,
            receipt_tx,
        });

        // Too many failures around the pivot mean the critical section
        // cannot be trusted; fall back to full validation.
        let mut mode = requested_mode;
        if mode == SyncMode::Fast
            && self.pivot_fails.load(Ordering::SeqCst) >= self.config.critical_trials
        {
            mode = SyncMode::Full;
        }
        *self.mode.write() = mode;

        let Some(master) = self.peers.peer(id) else {
            return Err(SyncError::UnknownPeer(id.to_string()));
        };

        let _ = self.events.send(SyncEvent::Started);
        let result = self
            .sync_with_peer(master, head, td, mode, cancel, header_rx, body_rx, receipt_rx)
            .await;

        // A failure in the critical section burns one pivot trial.
        if result.is_err() && mode == SyncMode::Fast && self.pivot_lock.lock().is_some() {
            self.pivot_fails.fetch_add(1, Ordering::SeqCst);
        }
        match &result {
            Ok(()) => {
                let _ = self.events.send(SyncEvent::Completed);
            }
            Err(err) => {
                let _ = self.events.send(SyncEvent::Failed(err.clone()));
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_with_peer(
        self: &Arc<Self>,
        master: Arc<SyncPeer>,
        head: Hash256,
        td: TotalDifficulty,
        mode: SyncMode,
        cancel: CancellationToken,
        mut header_rx: mpsc::Receiver<HeaderPack>,
        mut body_rx: mpsc::Receiver<BodyPack>,
        mut receipt_rx: mpsc::Receiver<ReceiptPack>,
    ) -> SyncResult<()> {
        if master.version() < self.config.min_protocol_version {
            return Err(SyncError::ProtocolTooOld {
                got: master.version(),
                min: self.config.min_protocol_version,
            });
        }
        debug!(
            peer = %master.id(),
            version = master.version(),
            head = %head,
            td,
            ?mode,
            "Synchronising with the network"
        );
        let sync_started = Instant::now();

        let (body_wake_tx, mut body_wake_rx) = watch::channel(Wake::default());
        let (receipt_wake_tx, mut receipt_wake_rx) = watch::channel(Wake::default());
        let (proc_tx, mut proc_rx) = mpsc::channel::<Vec<Header>>(1);

        let session = Arc::new(Session {
            mode,
            master: master.clone(),
            td,
            cancel: cancel.clone(),
            header_proc_tx: proc_tx,
            body_wake: body_wake_tx,
            receipt_wake: receipt_wake_tx,
        });

        // Establish the sync boundaries against the master peer.
        let latest = self.fetch_height(&session, &mut header_rx).await?;
        let height = latest.number;

        let mut origin = self.find_ancestor(&session, &mut header_rx, height).await?;
        {
            let mut stats = self.stats.write();
            if stats.height <= origin || stats.origin > origin {
                stats.origin = origin;
            }
            stats.height = height;
        }

        let mut pivot = 0u64;
        match mode {
            SyncMode::Full => {}
            SyncMode::Light => pivot = height,
            SyncMode::Fast => {
                let locked = self.pivot_lock.lock().clone();
                match locked {
                    // Pivot locked in from an earlier attempt: it must not
                    // drift between retries.
                    Some(locked) => pivot = locked.number,
                    None => {
                        let offset = rand::thread_rng().gen_range(0..self.config.pivot_interval);
                        if height > self.config.min_full_blocks + offset {
                            pivot = height - self.config.min_full_blocks - offset;
                        }
                    }
                }
                // State retrieval needs the pivot content; rewind the origin
                // below it if the ancestor already passed it.
                if pivot < origin {
                    origin = pivot.saturating_sub(1);
                }
                debug!(pivot, "Fast syncing until pivot block");
            }
        }
        self.scheduler.prepare(origin + 1, mode, pivot);

        let mut workers: JoinSet<SyncResult<()>> = JoinSet::new();
        {
            let sync = self.clone();
            let session = session.clone();
            workers.spawn(async move {
                sync.fetch_headers(&session, &mut header_rx, origin + 1).await
            });
        }
        {
            let sync = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let kind = BodiesKind {
                    scheduler: sync.scheduler.clone(),
                    peers: sync.peers.clone(),
                    qos: sync.qos.clone(),
                };
                fetch_parts(
                    &kind,
                    &mut body_rx,
                    &mut body_wake_rx,
                    &cancel,
                    &sync.peers,
                    &sync.drop_peer,
                )
                .await
            });
        }
        {
            let sync = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let kind = ReceiptsKind {
                    scheduler: sync.scheduler.clone(),
                    peers: sync.peers.clone(),
                    qos: sync.qos.clone(),
                };
                fetch_parts(
                    &kind,
                    &mut receipt_rx,
                    &mut receipt_wake_rx,
                    &cancel,
                    &sync.peers,
                    &sync.drop_peer,
                )
                .await
            });
        }
        {
            let sync = self.clone();
            let session = session.clone();
            workers.spawn(async move {
                sync.process_headers(&session, &mut proc_rx, origin + 1).await
            });
        }
        match mode {
            SyncMode::Full => {
                let sync = self.clone();
                workers.spawn(async move { sync.process_full_sync_content().await });
            }
            SyncMode::Fast => {
                let sync = self.clone();
                let latest = latest.clone();
                let cancel = cancel.clone();
                workers.spawn(async move { sync.process_fast_sync_content(&latest, &cancel).await });
            }
            SyncMode::Light => {}
        }

        // First error wins; once all workers but one have finished, close
        // the scheduler so the content processor can drain and terminate.
        let total = workers.len();
        let mut finished = 0;
        let mut first_err: Option<SyncError> = None;
        while finished < total {
            if finished == total - 1 {
                self.scheduler.close();
            }
            let Some(joined) = workers.join_next().await else {
                break;
            };
            finished += 1;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_err = Some(err);
                    break;
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                    first_err = Some(SyncError::Cancelled(Stage::ContentProcessing));
                    break;
                }
            }
        }
        self.scheduler.close();
        cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(join_err) = joined {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
            }
        }
        debug!(
            elapsed_ms = sync_started.elapsed().as_millis() as u64,
            "Synchronisation terminated"
        );

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
