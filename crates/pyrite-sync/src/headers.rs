//! Header acquisition pipeline.
//!
//! Headers are pulled in three phases: a single-header probe for the master
//! peer's advertised head, an ancestor search against the local chain
//! (linear probe first, binary search as fallback), and the skeleton-and-
//! fill stream in which the master supplies sparse anchor headers and any
//! peer may fill the segments between them. Verified batches flow into the
//! header processor, which inserts them locally and schedules content
//! retrieval.

use crate::error::{Stage, SyncError, SyncResult};
use crate::fetcher::{fetch_parts, HeaderFillKind, HeaderPack, Wake};
use crate::sync::{Session, SyncMode, Synchronizer};
use crate::{
    FS_HEADER_CHECK_FREQUENCY, FS_HEADER_FORCE_VERIFY, FS_HEADER_SAFETY_NET, MAX_FORK_ANCESTRY,
    MAX_HEADERS_PROCESS, MAX_HEADER_FETCH, MAX_QUEUED_HEADERS, MAX_SKELETON_SIZE,
};
use pyrite_types::{Hash256, Header};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace, warn};

impl Synchronizer {
    /// Retrieve the master peer's advertised head header to anchor the
    /// sync. Exactly one header must arrive within the current TTL.
    pub(crate) async fn fetch_height(
        &self,
        session: &Session,
        headers_rx: &mut mpsc::Receiver<HeaderPack>,
    ) -> SyncResult<Header> {
        let master = &session.master;
        debug!(peer = %master.id(), "Retrieving remote chain height");

        let (head_hash, _) = master.head();
        master.transport().request_headers_by_hash(head_hash, 1, 0, false);

        let ttl = self.qos.request_ttl();
        let deadline = Instant::now() + ttl;
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    return Err(SyncError::Cancelled(Stage::HeaderFetch));
                }

                pack = headers_rx.recv() => {
                    let Some(pack) = pack else {
                        return Err(SyncError::Cancelled(Stage::HeaderFetch));
                    };
                    // Discard anything not from the origin peer.
                    if pack.peer != *master.id() {
                        debug!(peer = %pack.peer, "Received headers from incorrect peer");
                        continue;
                    }
                    if pack.headers.len() != 1 {
                        debug!(peer = %master.id(), count = pack.headers.len(), "Multiple headers for single request");
                        return Err(SyncError::BadPeer);
                    }
                    let Some(head) = pack.headers.into_iter().next() else {
                        return Err(SyncError::BadPeer);
                    };
                    debug!(number = head.number, hash = %head.hash(), "Remote head header identified");
                    return Ok(head);
                }

                _ = sleep_until(deadline) => {
                    debug!(peer = %master.id(), elapsed_ms = ttl.as_millis() as u64, "Waiting for head header timed out");
                    return Err(SyncError::Timeout);
                }
            }
        }
    }

    /// Locate the latest block known both locally and to the master peer,
    /// bounded below by the fork ancestry window.
    pub(crate) async fn find_ancestor(
        &self,
        session: &Session,
        headers_rx: &mut mpsc::Receiver<HeaderPack>,
        height: u64,
    ) -> SyncResult<u64> {
        let master = &session.master;
        let ceil = match session.mode {
            SyncMode::Full => self.chain.current_block().number,
            SyncMode::Fast => self.chain.current_fast_block().number,
            SyncMode::Light => self.chain.current_header().number,
        };
        let floor = if ceil >= MAX_FORK_ANCESTRY {
            Some(ceil - MAX_FORK_ANCESTRY)
        } else {
            None
        };
        debug!(peer = %master.id(), local = ceil, remote = height, "Looking for common ancestor");

        // Probe a sparse window below the shared head; spanning 15-block
        // gaps beyond it catches peers reporting a head they do not have.
        let head = ceil.min(height);
        let from = head.saturating_sub(MAX_HEADER_FETCH as u64);
        let limit = 2 * MAX_HEADER_FETCH / 16;
        let count = (1 + ((ceil - from) / 16) as usize).min(limit);
        master.transport().request_headers_by_number(from, count, 15, false);

        let mut found: Option<(u64, Hash256)> = None;
        let ttl = self.qos.request_ttl();
        let deadline = Instant::now() + ttl;
        'probe: loop {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    return Err(SyncError::Cancelled(Stage::HeaderFetch));
                }

                pack = headers_rx.recv() => {
                    let Some(pack) = pack else {
                        return Err(SyncError::Cancelled(Stage::HeaderFetch));
                    };
                    if pack.peer != *master.id() {
                        debug!(peer = %pack.peer, "Received headers from incorrect peer");
                        continue;
                    }
                    let headers = pack.headers;
                    if headers.is_empty() {
                        warn!(peer = %master.id(), "Empty head header set");
                        return Err(SyncError::EmptyHeaderSet);
                    }
                    for (i, header) in headers.iter().enumerate() {
                        let requested = from + i as u64 * 16;
                        if header.number != requested {
                            warn!(peer = %master.id(), index = i, requested, received = header.number, "Head headers broke chain ordering");
                            return Err(SyncError::InvalidChain);
                        }
                    }
                    for (i, header) in headers.iter().enumerate().rev() {
                        // Skip headers underflowing or overflowing the local window.
                        if header.number < from || header.number > ceil {
                            continue;
                        }
                        let hash = header.hash();
                        let known = match session.mode {
                            SyncMode::Full => self.chain.has_block_and_state(&hash),
                            _ => self.chain.has_header(&hash, header.number),
                        };
                        if known {
                            found = Some((header.number, hash));
                            // Knowing every probed header, including ones past
                            // the advertised height, means the head report was
                            // a lie.
                            if header.number > height && i == limit - 1 {
                                warn!(peer = %master.id(), reported = height, found = header.number, "Peer lied about chain head");
                                return Err(SyncError::StallingPeer);
                            }
                            break;
                        }
                    }
                    break 'probe;
                }

                _ = sleep_until(deadline) => {
                    debug!(peer = %master.id(), elapsed_ms = ttl.as_millis() as u64, "Waiting for head header timed out");
                    return Err(SyncError::Timeout);
                }
            }
        }

        if let Some((number, hash)) = found {
            if floor.map_or(false, |floor| number <= floor) {
                warn!(peer = %master.id(), number, %hash, allowance = floor.unwrap_or(0), "Ancestor below allowance");
                return Err(SyncError::InvalidAncestor);
            }
            debug!(peer = %master.id(), number, %hash, "Found common ancestor");
            return Ok(number);
        }

        // Nothing matched in the sparse probe; bisect the whole window.
        let mut start = floor.unwrap_or(0);
        let mut end = head;
        while start + 1 < end {
            let check = (start + end) / 2;
            master.transport().request_headers_by_number(check, 1, 0, false);

            let ttl = self.qos.request_ttl();
            let deadline = Instant::now() + ttl;
            'reply: loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => {
                        return Err(SyncError::Cancelled(Stage::HeaderFetch));
                    }

                    pack = headers_rx.recv() => {
                        let Some(pack) = pack else {
                            return Err(SyncError::Cancelled(Stage::HeaderFetch));
                        };
                        if pack.peer != *master.id() {
                            debug!(peer = %pack.peer, "Received headers from incorrect peer");
                            continue;
                        }
                        if pack.headers.len() != 1 {
                            debug!(peer = %master.id(), count = pack.headers.len(), "Multiple headers for single request");
                            return Err(SyncError::BadPeer);
                        }
                        let header = &pack.headers[0];
                        let hash = header.hash();
                        let known = match session.mode {
                            SyncMode::Full => self.chain.has_block_and_state(&hash),
                            _ => self.chain.has_header(&hash, header.number),
                        };
                        if !known {
                            end = check;
                            break 'reply;
                        }
                        match self.chain.header_by_hash(&hash) {
                            Some(local) if local.number == check => start = check,
                            _ => {
                                debug!(peer = %master.id(), number = header.number, request = check, "Received non requested header");
                                return Err(SyncError::BadPeer);
                            }
                        }
                        break 'reply;
                    }

                    _ = sleep_until(deadline) => {
                        debug!(peer = %master.id(), elapsed_ms = ttl.as_millis() as u64, "Waiting for search header timed out");
                        return Err(SyncError::Timeout);
                    }
                }
            }
        }
        if floor.map_or(false, |floor| start <= floor) {
            warn!(peer = %master.id(), number = start, allowance = floor.unwrap_or(0), "Ancestor below allowance");
            return Err(SyncError::InvalidAncestor);
        }
        debug!(peer = %master.id(), number = start, "Found common ancestor");
        Ok(start)
    }

    /// Stream headers from `from` upward: skeleton batches from the master
    /// peer, segments filled by anyone, then a direct tail fetch once the
    /// skeleton runs dry. An unresponsive master ends the stream and the
    /// sync.
    pub(crate) async fn fetch_headers(
        &self,
        session: &Session,
        headers_rx: &mut mpsc::Receiver<HeaderPack>,
        from: u64,
    ) -> SyncResult<()> {
        let master = session.master.clone();
        debug!(peer = %master.id(), origin = from, "Directing header downloads");

        let mut skeleton = true;
        let mut from = from;

        let request = |skeleton: bool, from: u64| -> Instant {
            let ttl = self.qos.request_ttl();
            if skeleton {
                trace!(peer = %master.id(), count = MAX_HEADER_FETCH, from, "Fetching skeleton headers");
                master.transport().request_headers_by_number(
                    from + MAX_HEADER_FETCH as u64 - 1,
                    MAX_SKELETON_SIZE,
                    MAX_HEADER_FETCH as u64 - 1,
                    false,
                );
            } else {
                trace!(peer = %master.id(), count = MAX_HEADER_FETCH, from, "Fetching full headers");
                master
                    .transport()
                    .request_headers_by_number(from, MAX_HEADER_FETCH, 0, false);
            }
            Instant::now() + ttl
        };
        let mut deadline = request(skeleton, from);

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    return Err(SyncError::Cancelled(Stage::HeaderFetch));
                }

                pack = headers_rx.recv() => {
                    let Some(pack) = pack else {
                        return Err(SyncError::Cancelled(Stage::HeaderFetch));
                    };
                    // Only the master may steer the skeleton; fill traffic is
                    // consumed inside the fill loop itself.
                    if pack.peer != *master.id() {
                        debug!(peer = %pack.peer, "Received skeleton from incorrect peer");
                        continue;
                    }
                    // The skeleton ran dry: pull any remaining head headers
                    // directly from the master.
                    if pack.headers.is_empty() && skeleton {
                        skeleton = false;
                        deadline = request(skeleton, from);
                        continue;
                    }
                    // No more headers at all: signal end of stream.
                    if pack.headers.is_empty() {
                        debug!(peer = %master.id(), "No more headers available");
                        tokio::select! {
                            sent = session.header_proc_tx.send(Vec::new()) => {
                                let _ = sent;
                                return Ok(());
                            }
                            _ = session.cancel.cancelled() => {
                                return Err(SyncError::Cancelled(Stage::HeaderFetch));
                            }
                        }
                    }
                    let mut headers = pack.headers;
                    if skeleton {
                        let (filled, proced) =
                            self.fill_header_skeleton(session, headers_rx, from, headers).await?;
                        headers = filled[proced..].to_vec();
                        from += proced as u64;
                    }
                    if !headers.is_empty() {
                        let count = headers.len();
                        trace!(peer = %master.id(), count, from, "Scheduling new headers");
                        tokio::select! {
                            sent = session.header_proc_tx.send(headers) => {
                                if sent.is_err() {
                                    return Err(SyncError::Cancelled(Stage::HeaderFetch));
                                }
                            }
                            _ = session.cancel.cancelled() => {
                                return Err(SyncError::Cancelled(Stage::HeaderFetch));
                            }
                        }
                        from += count as u64;
                    }
                    deadline = request(skeleton, from);
                }

                _ = sleep_until(deadline) => {
                    // The master stalled the header stream; drop it and wind
                    // the sync down gracefully without discarding gathered
                    // data.
                    debug!(peer = %master.id(), "Header request timed out");
                    (self.drop_peer)(master.id());

                    session.body_wake.send_modify(|wake| wake.finished = true);
                    session.receipt_wake.send_modify(|wake| wake.finished = true);
                    tokio::select! {
                        sent = session.header_proc_tx.send(Vec::new()) => { let _ = sent; }
                        _ = session.cancel.cancelled() => {}
                    }
                    return Err(SyncError::BadPeer);
                }
            }
        }
    }

    /// Fill the segments of one skeleton batch using every available peer.
    /// Returns the contiguous filled prefix and how many of those headers
    /// were already forwarded to the processor mid-fill.
    async fn fill_header_skeleton(
        &self,
        session: &Session,
        headers_rx: &mut mpsc::Receiver<HeaderPack>,
        from: u64,
        skeleton: Vec<Header>,
    ) -> SyncResult<(Vec<Header>, usize)> {
        debug!(from, "Filling up skeleton");

        let (cont_tx, mut cont_rx) = watch::channel(Wake::default());
        self.scheduler.schedule_skeleton(from, &skeleton, cont_tx);

        let kind = HeaderFillKind {
            scheduler: self.scheduler.clone(),
            peers: self.peers.clone(),
            qos: self.qos.clone(),
            processor: session.header_proc_tx.clone(),
        };
        let outcome = fetch_parts(
            &kind,
            headers_rx,
            &mut cont_rx,
            &session.cancel,
            &self.peers,
            &self.drop_peer,
        )
        .await;

        let (filled, proced) = self.scheduler.retrieve_headers();
        match outcome {
            Ok(()) => {
                debug!(from, filled = filled.len(), "Skeleton fill terminated");
                Ok((filled, proced))
            }
            Err(err) if err.is_cancel() => Err(err),
            Err(err) => {
                debug!(%err, "Skeleton chain invalid");
                Err(SyncError::InvalidChain)
            }
        }
    }

    /// Consume verified header batches: insert them into the local header
    /// chain (fast/light), schedule content retrieval (full/fast) and keep
    /// the rollback bookkeeping that guards the pivot.
    pub(crate) async fn process_headers(
        &self,
        session: &Session,
        proc_rx: &mut mpsc::Receiver<Vec<Header>>,
        origin: u64,
    ) -> SyncResult<()> {
        let pivot = self.scheduler.fast_sync_pivot();
        let mut rollback: Vec<Header> = Vec::new();

        let result = self
            .process_header_stream(session, proc_rx, origin, pivot, &mut rollback)
            .await;

        if !rollback.is_empty() {
            // Revoke the uncertain headers from the local chain.
            let hashes: Vec<Hash256> = rollback.iter().map(|header| header.hash()).collect();
            let previous = self.chain.current_header().number;
            self.chain.rollback(&hashes);
            warn!(
                count = hashes.len(),
                was = previous,
                now = self.chain.current_header().number,
                "Rolled back headers"
            );

            // A failure past the pivot may be an attack on the state cutover
            // point: pin the pivot header so retries cannot be fed a
            // different one.
            let beyond_pivot = rollback
                .last()
                .map(|header| header.number > pivot)
                .unwrap_or(false);
            if beyond_pivot && self.pivot_fails.load(Ordering::Relaxed) == 0 {
                if let Some(header) = rollback.iter().find(|header| header.number == pivot) {
                    warn!(number = pivot, hash = %header.hash(), "Fast-sync pivot locked in");
                    *self.pivot_lock.lock() = Some(header.clone());
                }
            }
        }
        result
    }

    async fn process_header_stream(
        &self,
        session: &Session,
        proc_rx: &mut mpsc::Receiver<Vec<Header>>,
        origin: u64,
        pivot: u64,
        rollback: &mut Vec<Header>,
    ) -> SyncResult<()> {
        let mut origin = origin;
        let mut got_headers = false;

        loop {
            let headers = tokio::select! {
                _ = session.cancel.cancelled() => {
                    return Err(SyncError::Cancelled(Stage::HeaderProcessing));
                }
                headers = proc_rx.recv() => headers.unwrap_or_default(),
            };

            if headers.is_empty() {
                // Header stream finished: let the content fetchers drain.
                session.body_wake.send_modify(|wake| wake.finished = true);
                session.receipt_wake.send_modify(|wake| wake.finished = true);

                // A peer advertising a higher total difficulty but serving
                // no headers at all is stalling; the only exception is its
                // blocks arriving through other means first.
                if session.mode != SyncMode::Light && !got_headers {
                    let head = self.chain.current_block();
                    let local_td = self.chain.td_by_hash(&head.hash()).unwrap_or(0);
                    if session.td > local_td {
                        return Err(SyncError::StallingPeer);
                    }
                }
                if session.mode != SyncMode::Full {
                    let head = self.chain.current_header();
                    let local_td = self.chain.td_by_hash(&head.hash()).unwrap_or(0);
                    if session.td > local_td {
                        return Err(SyncError::StallingPeer);
                    }
                }
                rollback.clear();
                return Ok(());
            }
            got_headers = true;

            let mut headers = headers;
            while !headers.is_empty() {
                if session.cancel.is_cancelled() {
                    return Err(SyncError::Cancelled(Stage::HeaderProcessing));
                }
                let limit = headers.len().min(MAX_HEADERS_PROCESS);
                let chunk = &headers[..limit];

                if session.mode != SyncMode::Full {
                    // Remember which of these are new before insertion; those
                    // are the ones a later failure must revoke.
                    let unknown: Vec<Header> = chunk
                        .iter()
                        .filter(|header| !self.chain.has_header(&header.hash(), header.number))
                        .cloned()
                        .collect();

                    let last = chunk[chunk.len() - 1].number;
                    let frequency = if last + FS_HEADER_FORCE_VERIFY as u64 > pivot {
                        1
                    } else {
                        FS_HEADER_CHECK_FREQUENCY
                    };
                    if let Err(failure) = self.chain.insert_header_chain(chunk, frequency) {
                        if failure.index > 0 {
                            rollback.extend_from_slice(&chunk[..failure.index]);
                        }
                        let bad = failure.index.min(chunk.len() - 1);
                        debug!(
                            number = chunk[bad].number,
                            hash = %chunk[bad].hash(),
                            reason = %failure.reason,
                            "Invalid header encountered"
                        );
                        return Err(SyncError::InvalidChain);
                    }
                    rollback.extend(unknown);
                    if rollback.len() > FS_HEADER_SAFETY_NET {
                        let cut = rollback.len() - FS_HEADER_SAFETY_NET;
                        rollback.drain(..cut);
                    }
                }

                // The chunk spanning the pivot must contain the locked-in
                // pivot header, byte for byte.
                if session.mode == SyncMode::Fast {
                    let locked = self.pivot_lock.lock().clone();
                    if let Some(locked) = locked {
                        let first = chunk[0].number;
                        let last = chunk[chunk.len() - 1].number;
                        if first <= pivot && last >= pivot {
                            let candidate = &chunk[(pivot - first) as usize];
                            if candidate.hash() != locked.hash() {
                                warn!(
                                    remote_number = candidate.number,
                                    remote_hash = %candidate.hash(),
                                    local_number = locked.number,
                                    local_hash = %locked.hash(),
                                    "Pivot doesn't match locked in one"
                                );
                                return Err(SyncError::InvalidChain);
                            }
                        }
                    }
                }

                if session.mode != SyncMode::Light {
                    // Stall while the content queues are saturated.
                    while self.scheduler.pending_blocks() >= MAX_QUEUED_HEADERS
                        || self.scheduler.pending_receipts() >= MAX_QUEUED_HEADERS
                    {
                        tokio::select! {
                            _ = session.cancel.cancelled() => {
                                return Err(SyncError::Cancelled(Stage::HeaderProcessing));
                            }
                            _ = sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    let inserts = self.scheduler.schedule(chunk, origin);
                    if inserts != chunk.len() {
                        debug!(inserts, expected = chunk.len(), "Stale headers");
                        return Err(SyncError::BadPeer);
                    }
                }
                headers.drain(..limit);
                origin += limit as u64;
            }

            // New content tasks exist; nudge the fetchers.
            session.body_wake.send_modify(|wake| wake.generation += 1);
            session.receipt_wake.send_modify(|wake| wake.generation += 1);
        }
    }
}
