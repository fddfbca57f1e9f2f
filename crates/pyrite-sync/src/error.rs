//! Sync error types.

use std::fmt;
use thiserror::Error;

/// The pipeline stage a worker was executing when it observed cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Header retrieval (height probe, ancestor search, skeleton fill).
    HeaderFetch,
    /// Block body retrieval.
    BodyFetch,
    /// Receipt retrieval.
    ReceiptFetch,
    /// Header verification and scheduling.
    HeaderProcessing,
    /// Block or receipt import.
    ContentProcessing,
    /// State trie node retrieval.
    StateFetch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::HeaderFetch => "header fetch",
            Stage::BodyFetch => "body fetch",
            Stage::ReceiptFetch => "receipt fetch",
            Stage::HeaderProcessing => "header processing",
            Stage::ContentProcessing => "content processing",
            Stage::StateFetch => "state fetch",
        };
        write!(f, "{}", name)
    }
}

/// Sync errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A synchronization session is already running.
    #[error("synchronization busy")]
    Busy,

    /// The requested peer is not registered.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// A peer with this identifier is already registered.
    #[error("peer already registered: {0}")]
    DuplicatePeer(String),

    /// The peer misbehaved in a way that warrants dropping it.
    #[error("action from bad peer ignored")]
    BadPeer,

    /// The peer advertised data it never delivered.
    #[error("peer is stalling")]
    StallingPeer,

    /// The peer answered a head probe with an empty header set.
    #[error("empty header set by peer")]
    EmptyHeaderSet,

    /// No connected peer can serve the remaining work.
    #[error("no peers available, sync paused")]
    PeersUnavailable,

    /// The peer speaks a protocol version below the supported floor.
    #[error("peer protocol version {got} below required {min}")]
    ProtocolTooOld {
        /// Version advertised by the peer.
        got: u32,
        /// Minimum version this node accepts.
        min: u32,
    },

    /// The located common ancestor lies below the allowed fork window.
    #[error("retrieved ancestor is invalid")]
    InvalidAncestor,

    /// Delivered data does not form a valid chain extension.
    #[error("retrieved hash chain is invalid")]
    InvalidChain,

    /// A request to the master peer timed out.
    #[error("timeout awaiting peer response")]
    Timeout,

    /// Every peer disconnected mid-session.
    #[error("no peers to keep download active")]
    NoPeers,

    /// A delivery arrived while no session (or no matching request) exists.
    #[error("no sync active")]
    NoSyncActive,

    /// A delivery matched a reservation that already expired.
    #[error("peer delivered stale data")]
    StaleDelivery,

    /// The session was cancelled while the given stage was in progress.
    #[error("{0} canceled (requested)")]
    Cancelled(Stage),
}

impl SyncError {
    /// Whether this error, returned from a sync attempt, is the master
    /// peer's fault and should lead to the peer being dropped.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout
                | SyncError::BadPeer
                | SyncError::StallingPeer
                | SyncError::EmptyHeaderSet
                | SyncError::PeersUnavailable
                | SyncError::ProtocolTooOld { .. }
                | SyncError::InvalidAncestor
                | SyncError::InvalidChain
        )
    }

    /// Whether this error only reports an observed cancellation.
    pub fn is_cancel(&self) -> bool {
        matches!(self, SyncError::Cancelled(_))
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_fault_classification() {
        assert!(SyncError::Timeout.is_peer_fault());
        assert!(SyncError::StallingPeer.is_peer_fault());
        assert!(SyncError::InvalidChain.is_peer_fault());
        assert!(SyncError::ProtocolTooOld { got: 1, min: 2 }.is_peer_fault());

        assert!(!SyncError::Busy.is_peer_fault());
        assert!(!SyncError::NoPeers.is_peer_fault());
        assert!(!SyncError::Cancelled(Stage::BodyFetch).is_peer_fault());
    }

    #[test]
    fn test_cancel_classification() {
        assert!(SyncError::Cancelled(Stage::StateFetch).is_cancel());
        assert!(!SyncError::Timeout.is_cancel());
    }

    #[test]
    fn test_display_includes_stage() {
        let err = SyncError::Cancelled(Stage::ReceiptFetch);
        assert!(err.to_string().contains("receipt fetch"));
    }
}
