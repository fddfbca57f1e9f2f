//! Content processors.
//!
//! The full-sync processor reassembles blocks from fetch results and
//! executes them into the chain. The fast-sync processor writes receipts
//! for everything below the pivot, synchronizes the state trie at the
//! pivot, commits the pivot as the new fast head and executes the few
//! remaining blocks above it.

use crate::error::{Stage, SyncError, SyncResult};
use crate::scheduler::FetchResult;
use crate::state::StateSync;
use crate::sync::Synchronizer;
use crate::MAX_RESULTS_PROCESS;
use pyrite_types::{Block, Header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Split a result batch into the parts strictly before the pivot, the
/// pivot itself, and everything after it.
fn split_around_pivot(
    pivot: u64,
    results: Vec<FetchResult>,
) -> (Vec<FetchResult>, Option<FetchResult>, Vec<FetchResult>) {
    let mut before = Vec::new();
    let mut at = None;
    let mut after = Vec::new();
    for result in results {
        match result.header.number.cmp(&pivot) {
            std::cmp::Ordering::Less => before.push(result),
            std::cmp::Ordering::Equal => at = Some(result),
            std::cmp::Ordering::Greater => after.push(result),
        }
    }
    (before, at, after)
}

fn assemble(result: FetchResult) -> (Block, Vec<pyrite_types::Receipt>) {
    let FetchResult {
        header,
        transactions,
        uncles,
        receipts,
    } = result;
    (Block::new(header, transactions, uncles), receipts)
}

impl Synchronizer {
    /// Drain fetch results and execute them into the chain until the
    /// scheduler closes.
    pub(crate) async fn process_full_sync_content(&self) -> SyncResult<()> {
        loop {
            let results = self.scheduler.wait_results().await;
            if results.is_empty() {
                return Ok(());
            }
            self.import_block_results(results)?;
        }
    }

    /// Execute a batch of assembled blocks into the chain.
    pub(crate) fn import_block_results(&self, results: Vec<FetchResult>) -> SyncResult<()> {
        let mut results = results;
        while !results.is_empty() {
            // Makes clean shutdown faster.
            if self.quit.is_cancelled() {
                return Err(SyncError::Cancelled(Stage::ContentProcessing));
            }
            let items = results.len().min(MAX_RESULTS_PROCESS);
            let batch: Vec<FetchResult> = results.drain(..items).collect();
            debug!(
                items,
                first = batch[0].header.number,
                last = batch[items - 1].header.number,
                "Inserting downloaded chain"
            );
            let blocks: Vec<Block> = batch
                .into_iter()
                .map(|result| assemble(result).0)
                .collect();
            if let Err(failure) = self.chain.insert_chain(blocks) {
                debug!(index = failure.index, reason = %failure.reason, "Downloaded item processing failed");
                return Err(SyncError::InvalidChain);
            }
        }
        Ok(())
    }

    /// Drain fetch results in fast mode, committing receipts below the
    /// pivot and switching to full imports above it once the pivot state
    /// is in place.
    pub(crate) async fn process_fast_sync_content(
        &self,
        latest: &Header,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        // Begin state retrieval at the advertised head; by the time the
        // pivot content arrives most of its state is already local.
        let mut state_sync = self.sync_state(latest.state_root).await;
        {
            let scheduler = self.scheduler.clone();
            let watched = state_sync.clone();
            tokio::spawn(async move {
                if let Err(err) = watched.wait().await {
                    // A genuine state failure must wake the result loop; a
                    // cancelled sync was superseded on purpose.
                    if !err.is_cancel() {
                        scheduler.close();
                    }
                }
            });
        }

        let pivot = self.scheduler.fast_sync_pivot();
        let result = loop {
            let results = self.scheduler.wait_results().await;
            if results.is_empty() {
                state_sync.cancel();
                break match state_sync.wait().await {
                    Err(err) if !err.is_cancel() => Err(err),
                    _ => Ok(()),
                };
            }
            let (before, at, after) = split_around_pivot(pivot, results);
            if let Err(err) = self.commit_fast_sync_data(before, &state_sync) {
                break Err(err);
            }
            if let Some(pivot_result) = at {
                // The pivot arrived: retarget state retrieval at its root
                // and wait for the trie to complete before committing.
                state_sync.cancel();
                state_sync = self.sync_state(pivot_result.header.state_root).await;
                if let Err(err) = self.commit_pivot_block(&state_sync, pivot_result, cancel).await {
                    break Err(err);
                }
            }
            if let Err(err) = self.import_block_results(after) {
                break Err(err);
            }
        };
        // Whatever happened, the traversal must not outlive the session.
        state_sync.cancel();
        result
    }

    /// Write receipt-carrying blocks below the pivot. A state sync failure
    /// observed mid-batch supersedes the import.
    fn commit_fast_sync_data(
        &self,
        results: Vec<FetchResult>,
        state_sync: &StateSync,
    ) -> SyncResult<()> {
        let mut results = results;
        while !results.is_empty() {
            if self.quit.is_cancelled() {
                return Err(SyncError::Cancelled(Stage::ContentProcessing));
            }
            if let Some(Err(err)) = state_sync.outcome() {
                if !err.is_cancel() {
                    return Err(err);
                }
            }
            let items = results.len().min(MAX_RESULTS_PROCESS);
            let batch: Vec<FetchResult> = results.drain(..items).collect();
            debug!(
                items,
                first = batch[0].header.number,
                last = batch[items - 1].header.number,
                "Inserting fast-sync blocks"
            );
            let mut blocks = Vec::with_capacity(items);
            let mut receipts = Vec::with_capacity(items);
            for result in batch {
                let (block, block_receipts) = assemble(result);
                blocks.push(block);
                receipts.push(block_receipts);
            }
            if let Err(failure) = self.chain.insert_receipt_chain(blocks, receipts) {
                debug!(index = failure.index, reason = %failure.reason, "Downloaded item processing failed");
                return Err(SyncError::InvalidChain);
            }
        }
        Ok(())
    }

    /// Complete the pivot's state, then promote it to the new fast head.
    async fn commit_pivot_block(
        &self,
        state_sync: &StateSync,
        result: FetchResult,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        tokio::select! {
            completed = state_sync.wait() => completed?,
            _ = cancel.cancelled() => {
                return Err(SyncError::Cancelled(Stage::ContentProcessing));
            }
        }

        let (block, receipts) = assemble(result);
        let hash = block.hash();
        debug!(number = block.number(), %hash, "Committing fast sync pivot as new head");
        if let Err(failure) = self
            .chain
            .insert_receipt_chain(vec![block], vec![receipts])
        {
            warn!(reason = %failure.reason, "Pivot block import failed");
            return Err(SyncError::InvalidChain);
        }
        if let Err(failure) = self.chain.fast_sync_commit_head(hash) {
            warn!(reason = %failure.reason, "Pivot head commit failed");
            return Err(SyncError::InvalidChain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_at(number: u64) -> FetchResult {
        FetchResult {
            header: Header {
                number,
                ..Header::default()
            },
            transactions: Vec::new(),
            uncles: Vec::new(),
            receipts: Vec::new(),
        }
    }

    #[test]
    fn test_split_around_pivot() {
        let results: Vec<FetchResult> = (1..=10).map(result_at).collect();
        let (before, at, after) = split_around_pivot(7, results);

        assert_eq!(before.len(), 6);
        assert_eq!(at.as_ref().map(|r| r.header.number), Some(7));
        assert_eq!(after.len(), 3);
        assert!(before.iter().all(|r| r.header.number < 7));
        assert!(after.iter().all(|r| r.header.number > 7));
    }

    #[test]
    fn test_split_without_pivot_in_batch() {
        let results: Vec<FetchResult> = (1..=5).map(result_at).collect();
        let (before, at, after) = split_around_pivot(100, results);
        assert_eq!(before.len(), 5);
        assert!(at.is_none());
        assert!(after.is_empty());
    }
}
