//! # pyrite-sync
//!
//! Fast block synchronization for the Pyrite blockchain.
//!
//! This crate provides:
//! - Concurrent header, body, receipt and state trie retrieval from a pool
//!   of untrusted peers
//! - Full, fast (receipts-plus-pivot-state) and light (headers only)
//!   synchronization modes
//! - Skeleton-based header integrity so any peer can fill in headers safely
//! - Adaptive per-peer traffic shaping from measured round trip times
//!
//! The engine is handed a [`ChainStore`] and a [`StateDb`]; it never owns
//! chain data itself. Inbound network payloads are injected through the
//! [`Synchronizer`]'s `deliver_*` methods.

mod chain;
mod content;
mod error;
mod fetcher;
mod headers;
mod peers;
mod qos;
mod scheduler;
mod state;
mod sync;

pub use chain::{ChainStore, ImportFailure, StateDb};
pub use error::{Stage, SyncError, SyncResult};
pub use peers::{
    DataKind, LightPeerAdapter, LightPeerTransport, PeerDropFn, PeerId, PeerRegistry,
    PeerTransport, SyncPeer,
};
pub use qos::QosEstimator;
pub use scheduler::{FetchRequest, FetchResult, HeaderRequest, Scheduler};
pub use state::StateSync;
pub use sync::{SyncConfig, SyncEvent, SyncMode, SyncProgress, Synchronizer};

use std::time::Duration;

/// Number of headers requested in one batch.
pub const MAX_HEADER_FETCH: usize = 192;

/// Number of skeleton anchor headers requested in one batch.
pub const MAX_SKELETON_SIZE: usize = 128;

/// Largest body request issued to a single peer.
pub const MAX_BLOCK_FETCH: usize = 128;

/// Largest receipt request issued to a single peer.
pub const MAX_RECEIPT_FETCH: usize = 256;

/// Largest state trie node request issued to a single peer.
pub const MAX_STATE_FETCH: usize = 384;

/// How far behind the local head a common ancestor may be accepted,
/// bounding chain rewrite attacks.
pub const MAX_FORK_ANCESTRY: u64 = 90_000;

/// Randomization window below `head - FS_MIN_FULL_BLOCKS` from which the
/// fast-sync pivot is picked.
pub const FS_PIVOT_INTERVAL: u64 = 64;

/// Number of blocks below the advertised head that are always fully
/// executed, even in fast mode.
pub const FS_MIN_FULL_BLOCKS: u64 = 64;

/// Verify one header out of this many during bulk header insertion.
pub const FS_HEADER_CHECK_FREQUENCY: usize = 100;

/// Upper bound on the rollback list of headers not yet confirmed by
/// content downloads.
pub const FS_HEADER_SAFETY_NET: usize = 2048;

/// Headers this close below the pivot are always verified.
pub const FS_HEADER_FORCE_VERIFY: usize = 24;

/// Pivot failures tolerated before fast sync degrades to full sync.
pub const FS_CRITICAL_TRIALS: u32 = 10;

/// Largest header chunk handed to the chain store in one call.
pub const MAX_HEADERS_PROCESS: usize = 2048;

/// Content backlog at which the header processor stalls scheduling.
pub const MAX_QUEUED_HEADERS: usize = 32 * 1024;

/// Largest result batch handed to the chain store in one call.
pub const MAX_RESULTS_PROCESS: usize = 2048;

/// Completed-but-undelivered results held in memory before reservations
/// throttle.
pub const RESULT_CACHE_LIMIT: usize = 8192;

/// Per-peer bound on remembered unobtainable items.
pub const MAX_LACKING_HASHES: usize = 4096;

/// Smoothing factor folding a measured delivery rate into a peer's
/// throughput estimate.
pub const THROUGHPUT_IMPACT: f64 = 0.1;

/// Smoothing factor folding the peer-median RTT into the global estimate.
pub const QOS_TUNING_IMPACT: f64 = 0.25;

/// Peer count above which new registrations no longer reduce RTT
/// confidence.
pub const QOS_CONFIDENCE_CAP: usize = 10;

/// Number of best peers the median RTT is computed over.
pub const QOS_TUNING_PEERS: usize = 5;

/// Floor for the RTT confidence factor.
pub const RTT_MIN_CONFIDENCE: f64 = 0.1;

/// Ceiling for the RTT estimate; also its pessimistic starting value.
pub const RTT_MAX_ESTIMATE: Duration = Duration::from_secs(20);

/// Floor for the per-peer median RTT.
pub const RTT_MIN_ESTIMATE: Duration = Duration::from_secs(2);

/// Request TTL as a multiple of the RTT estimate (before confidence
/// scaling).
pub const TTL_SCALING: u32 = 3;

/// Hard ceiling on the request TTL.
pub const TTL_LIMIT: Duration = Duration::from_secs(60);
