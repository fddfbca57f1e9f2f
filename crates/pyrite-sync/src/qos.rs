//! Adaptive request timing.
//!
//! Keeps an exponentially smoothed estimate of the network round trip time
//! together with a confidence factor, and derives the target RTT and the
//! TTL applied to outstanding requests. Both fields are plain atomics so
//! every fetch loop can read them without locking.

use crate::peers::PeerRegistry;
use crate::{
    QOS_CONFIDENCE_CAP, QOS_TUNING_IMPACT, RTT_MAX_ESTIMATE, RTT_MIN_CONFIDENCE, TTL_LIMIT,
    TTL_SCALING,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed-point scale representing full confidence.
const CONFIDENCE_ONE: u64 = 1_000_000;

/// Round trip time estimator.
pub struct QosEstimator {
    /// Estimated request round trip time, in nanoseconds.
    rtt_estimate: AtomicU64,
    /// Confidence in the estimate, in millionths.
    rtt_confidence: AtomicU64,
}

impl QosEstimator {
    /// Create an estimator with a pessimistic initial estimate and full
    /// confidence, so a lone bootstrap peer is given generous timeouts.
    pub fn new() -> Self {
        Self {
            rtt_estimate: AtomicU64::new(RTT_MAX_ESTIMATE.as_nanos() as u64),
            rtt_confidence: AtomicU64::new(CONFIDENCE_ONE),
        }
    }

    /// Current round trip time estimate.
    pub fn rtt_estimate(&self) -> Duration {
        Duration::from_nanos(self.rtt_estimate.load(Ordering::Relaxed))
    }

    /// Confidence in the estimate, in `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        self.rtt_confidence.load(Ordering::Relaxed) as f64 / CONFIDENCE_ONE as f64
    }

    /// Target round trip time for a single request.
    ///
    /// Nine tenths of the estimate: querying slightly under the measured
    /// RTT keeps the download stream stable when several values would fit.
    pub fn request_rtt(&self) -> Duration {
        self.rtt_estimate().mul_f64(0.9)
    }

    /// Time allowance for a single request before its peer is penalised.
    pub fn request_ttl(&self) -> Duration {
        let rtt = self.rtt_estimate();
        let conf = self.confidence();
        let ttl = rtt.mul_f64(TTL_SCALING as f64 / conf);
        ttl.min(TTL_LIMIT)
    }

    /// Fold a freshly measured median RTT into the estimate and take one
    /// confidence recovery step.
    pub fn tune(&self, median: Duration) {
        let old = self.rtt_estimate.load(Ordering::Relaxed) as f64;
        let blended = (1.0 - QOS_TUNING_IMPACT) * old + QOS_TUNING_IMPACT * median.as_nanos() as f64;
        self.rtt_estimate.store(blended as u64, Ordering::Relaxed);

        let conf = self.rtt_confidence.load(Ordering::Relaxed);
        let conf = conf + (CONFIDENCE_ONE - conf) / 2;
        self.rtt_confidence.store(conf, Ordering::Relaxed);

        debug!(
            rtt_ms = self.rtt_estimate().as_millis() as u64,
            confidence = self.confidence(),
            ttl_ms = self.request_ttl().as_millis() as u64,
            "Recalculated sync QoS values"
        );
    }

    /// Reduce confidence after the peer set grew to `peers` entries, since
    /// the median the estimate was built from no longer reflects the set.
    pub fn reduce_confidence(&self, peers: usize) {
        if peers == 0 {
            // Registration raced with a disconnect, nothing to adjust.
            return;
        }
        if peers == 1 {
            self.rtt_confidence.store(CONFIDENCE_ONE, Ordering::Relaxed);
            return;
        }
        if peers >= QOS_CONFIDENCE_CAP {
            return;
        }
        let conf = self.rtt_confidence.load(Ordering::Relaxed) * (peers as u64 - 1) / peers as u64;
        let floor = (RTT_MIN_CONFIDENCE * CONFIDENCE_ONE as f64) as u64;
        let conf = conf.max(floor);
        self.rtt_confidence.store(conf, Ordering::Relaxed);

        debug!(
            rtt_ms = self.rtt_estimate().as_millis() as u64,
            confidence = self.confidence(),
            ttl_ms = self.request_ttl().as_millis() as u64,
            "Relaxed sync QoS values"
        );
    }

    /// Background loop re-pricing the estimate from the peer median once
    /// every estimated round trip, until shutdown.
    pub(crate) async fn tuner(
        self: Arc<Self>,
        peers: Arc<PeerRegistry>,
        shutdown: CancellationToken,
    ) {
        loop {
            self.tune(peers.median_rtt());
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(self.rtt_estimate()) => {}
            }
        }
    }
}

impl Default for QosEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_values() {
        let qos = QosEstimator::new();
        assert_eq!(qos.rtt_estimate(), RTT_MAX_ESTIMATE);
        assert!((qos.confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ttl_between_rtt_and_limit() {
        let qos = QosEstimator::new();
        // Holds at every confidence level the estimator can reach.
        for peers in 2..QOS_CONFIDENCE_CAP {
            qos.reduce_confidence(peers);
            let ttl = qos.request_ttl();
            assert!(qos.request_rtt() <= ttl, "target must not exceed ttl");
            assert!(ttl <= TTL_LIMIT, "ttl must honour the hard cap");
        }
    }

    #[test]
    fn test_tune_moves_estimate_toward_median() {
        let qos = QosEstimator::new();
        let before = qos.rtt_estimate();
        qos.tune(Duration::from_secs(2));
        let after = qos.rtt_estimate();
        assert!(after < before);
        assert!(after > Duration::from_secs(2));
    }

    #[test]
    fn test_tune_recovers_confidence() {
        let qos = QosEstimator::new();
        qos.reduce_confidence(2);
        let reduced = qos.confidence();
        assert!(reduced < 1.0);

        qos.tune(Duration::from_secs(5));
        let recovered = qos.confidence();
        assert!((recovered - (reduced + (1.0 - reduced) / 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_single_peer_forces_full_confidence() {
        let qos = QosEstimator::new();
        qos.reduce_confidence(3);
        assert!(qos.confidence() < 1.0);

        qos.reduce_confidence(1);
        assert!((qos.confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_large_peer_sets_do_not_reduce_confidence() {
        let qos = QosEstimator::new();
        qos.reduce_confidence(QOS_CONFIDENCE_CAP);
        assert!((qos.confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_confidence_floor() {
        let qos = QosEstimator::new();
        for _ in 0..64 {
            qos.reduce_confidence(2);
        }
        assert!(qos.confidence() >= RTT_MIN_CONFIDENCE - f64::EPSILON);
    }
}
