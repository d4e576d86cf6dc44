//! # Eclipse Detector
//!
//! Statistical test for eclipsed neighborhoods. In a healthy overlay the
//! peers returned by a lookup are a distance-ordered sample of uniformly
//! placed ids, so their common-prefix lengths with the target follow a
//! predictable distribution once the network size is known. An attacker
//! occupying a target's neighborhood with generated ids skews that
//! distribution toward implausibly deep prefixes; the detector measures the
//! skew as a KL divergence and flags the neighborhood when it exceeds a
//! size-dependent threshold.
//!
//! ## Expected distribution
//!
//! For the `K` closest peers out of `N̂` uniform ids, the expected number
//! with CPL at least `i` is `m_i = min(K, N̂ · 2⁻ⁱ)`, giving
//! `exp[i] = (m_i − m_{i+1}) / K` for `i < l` and a folded tail
//! `exp[l] = m_l / K`, with `l = ⌊log₂ N̂⌋`. The histogram is floored at
//! [`EXPECTED_FLOOR`] and renormalized so a single off-model peer cannot
//! blow the divergence up through a zero bin.
//!
//! ## Threshold
//!
//! `τ(N̂) = TAU_BASE + TAU_SCALE / log₂ N̂`, monotone decreasing in the
//! network size. The constants are conservative against the sampling noise
//! of a 20-peer histogram (expected noise ≈ (bins−1)/2K nats) and should be
//! recalibrated empirically for production deployments.

use thiserror::Error;
use tracing::debug;

use crate::keyspace::{KeyspaceId, KEYSPACE_BITS};

/// Lower bound applied to expected-histogram bins before normalization.
const EXPECTED_FLOOR: f64 = 1e-3;

/// Guard against log-of-zero in the divergence sum.
const EPSILON: f64 = 1e-9;

/// Additive term of the detection threshold.
const TAU_BASE: f64 = 0.25;

/// Scale of the size-dependent threshold term.
const TAU_SCALE: f64 = 12.0;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DetectorError {
    #[error("not enough peers for eclipse detection: expected {expected}, found {found}")]
    InsufficientPeers { expected: usize, found: usize },

    #[error("no network size estimate available")]
    NoSizeEstimate,
}

/// Outcome of one detector invocation, kept for diagnostic logging.
#[derive(Clone, Debug)]
pub struct Detection {
    /// True when the divergence exceeded the threshold.
    pub attack: bool,
    pub kl_divergence: f64,
    pub threshold: f64,
    /// The fold bucket `l`: CPLs above it are counted as `l`.
    pub max_cpl_bucket: u32,
    /// Observed CPL histogram, `counts[i]` peers at CPL `i` (folded at `l`).
    pub counts: Vec<usize>,
    /// The network-size estimate the expectations were derived from.
    pub network_size: f64,
}

/// CPL-histogram eclipse detector.
///
/// Deterministic given `(network_size, target, peers)`: the same inputs
/// always produce the same verdict.
pub struct EclipseDetector {
    sample_size: usize,
}

impl EclipseDetector {
    /// `sample_size` is the fixed number of closest peers the test uses
    /// (`K_ed`); callers must supply at least that many.
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// The fold bucket for a given network size: occupancy beyond
    /// `⌊log₂ N̂⌋` is negligible.
    pub fn max_cpl_bucket(&self, network_size: f64) -> u32 {
        let l = network_size.max(2.0).log2().floor() as u32;
        l.clamp(1, KEYSPACE_BITS - 1)
    }

    /// Divergence threshold for a given network size, monotone decreasing.
    pub fn threshold(&self, network_size: f64) -> f64 {
        TAU_BASE + TAU_SCALE / network_size.max(2.0).log2()
    }

    /// Observed CPL histogram of `peers` against `target`, folded at `l`.
    pub fn prefix_len_counts(
        &self,
        target: &KeyspaceId,
        peers: &[KeyspaceId],
        l: u32,
    ) -> Vec<usize> {
        let mut counts = vec![0usize; l as usize + 1];
        for peer in peers {
            let cpl = target.common_prefix_len(peer).min(l);
            counts[cpl as usize] += 1;
        }
        counts
    }

    /// Expected CPL distribution of the `sample_size` closest peers in a
    /// uniform network of `network_size` ids, folded at `l`.
    pub fn expected_distribution(&self, network_size: f64, l: u32) -> Vec<f64> {
        let k = self.sample_size as f64;
        let m = |i: u32| -> f64 { (network_size * 2f64.powi(-(i as i32))).min(k) };

        let mut exp = Vec::with_capacity(l as usize + 1);
        for i in 0..l {
            exp.push((m(i) - m(i + 1)) / k);
        }
        exp.push(m(l) / k);

        for bin in exp.iter_mut() {
            if *bin < EXPECTED_FLOOR {
                *bin = EXPECTED_FLOOR;
            }
        }
        let total: f64 = exp.iter().sum();
        for bin in exp.iter_mut() {
            *bin /= total;
        }
        exp
    }

    /// `Σ obs[i] · ln(obs[i] / exp[i])` with the `0 · ln 0 = 0` convention.
    pub fn kl_divergence(&self, counts: &[usize], expected: &[f64]) -> f64 {
        let total: usize = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let mut kl = 0.0;
        for (i, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let obs = count as f64 / total as f64;
            let exp = expected.get(i).copied().unwrap_or(EPSILON).max(EPSILON);
            kl += obs * (obs / exp).ln();
        }
        kl
    }

    /// Run the full test over the first `sample_size` peers (callers supply
    /// them ascending by distance to the target).
    pub fn evaluate(
        &self,
        network_size: f64,
        target: &KeyspaceId,
        peers: &[KeyspaceId],
    ) -> Result<Detection, DetectorError> {
        if peers.len() < self.sample_size {
            return Err(DetectorError::InsufficientPeers {
                expected: self.sample_size,
                found: peers.len(),
            });
        }
        let sample = &peers[..self.sample_size];

        let l = self.max_cpl_bucket(network_size);
        let threshold = self.threshold(network_size);
        let counts = self.prefix_len_counts(target, sample, l);
        let expected = self.expected_distribution(network_size, l);
        let kl = self.kl_divergence(&counts, &expected);
        let attack = kl > threshold;

        debug!(
            target = hex::encode(&target.as_bytes()[..8]),
            network_size,
            l,
            threshold,
            kl,
            attack,
            "eclipse detection"
        );

        Ok(Detection {
            attack,
            kl_divergence: kl,
            threshold,
            max_cpl_bucket: l,
            counts,
            network_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::hash_id;

    /// Brute-force a keyspace id with CPL at least `min_cpl` to `target`.
    fn id_with_cpl_at_least(target: &KeyspaceId, min_cpl: u32, salt: &mut u64) -> KeyspaceId {
        loop {
            *salt += 1;
            let id = hash_id(&salt.to_be_bytes());
            if target.common_prefix_len(&id) >= min_cpl {
                return id;
            }
        }
    }

    /// Brute-force a keyspace id with CPL exactly `cpl` to `target`.
    fn id_with_cpl_exactly(target: &KeyspaceId, cpl: u32, salt: &mut u64) -> KeyspaceId {
        loop {
            *salt += 1;
            let id = hash_id(&salt.to_be_bytes());
            if target.common_prefix_len(&id) == cpl {
                return id;
            }
        }
    }

    #[test]
    fn kl_is_zero_for_matching_distributions() {
        let det = EclipseDetector::new(20);
        let counts = vec![5, 5, 5, 5];
        let expected = vec![0.25, 0.25, 0.25, 0.25];
        assert_eq!(det.kl_divergence(&counts, &expected), 0.0);
    }

    #[test]
    fn kl_is_positive_for_diverging_distributions() {
        let det = EclipseDetector::new(20);
        let counts = vec![20, 0, 0, 0];
        let expected = vec![0.25, 0.25, 0.25, 0.25];
        assert!(det.kl_divergence(&counts, &expected) > 0.0);
    }

    #[test]
    fn expected_distribution_is_normalized() {
        let det = EclipseDetector::new(20);
        for &n in &[50.0, 1000.0, 100_000.0] {
            let l = det.max_cpl_bucket(n);
            let exp = det.expected_distribution(n, l);
            let total: f64 = exp.iter().sum();
            assert!((total - 1.0).abs() < 1e-9, "sum {total} for n = {n}");
            assert!(exp.iter().all(|&p| p > 0.0));
        }
    }

    #[test]
    fn threshold_decreases_with_network_size() {
        let det = EclipseDetector::new(20);
        assert!(det.threshold(100.0) > det.threshold(10_000.0));
        assert!(det.threshold(10_000.0) > det.threshold(1_000_000.0));
    }

    #[test]
    fn insufficient_peers_is_an_error() {
        let det = EclipseDetector::new(20);
        let target = hash_id(b"target");
        let peers: Vec<KeyspaceId> = (0..10u64).map(|n| hash_id(&n.to_be_bytes())).collect();
        let err = det.evaluate(1000.0, &target, &peers).unwrap_err();
        assert_eq!(
            err,
            DetectorError::InsufficientPeers {
                expected: 20,
                found: 10
            }
        );
    }

    #[test]
    fn occupied_neighborhood_is_flagged() {
        // 20/20 peers sharing >= 8 bits with the target in a network of
        // ~1000 peers: the honest expectation there is ~4 peers.
        let det = EclipseDetector::new(20);
        let target = hash_id(b"victim-content");
        let mut salt = 0u64;
        let peers: Vec<KeyspaceId> = (0..20)
            .map(|_| id_with_cpl_at_least(&target, 8, &mut salt))
            .collect();

        let detection = det.evaluate(1000.0, &target, &peers).unwrap();
        assert!(
            detection.attack,
            "kl {} threshold {}",
            detection.kl_divergence, detection.threshold
        );
    }

    #[test]
    fn model_conforming_neighborhood_is_not_flagged() {
        // Build a sample that matches the expected histogram for n = 1000,
        // K = 20: roughly {5: 4, 6: 8, 7: 4, 8: 2, >=9: 2}.
        let det = EclipseDetector::new(20);
        let target = hash_id(b"healthy-content");
        let mut salt = 0u64;
        let mut peers = Vec::new();
        for _ in 0..4 {
            peers.push(id_with_cpl_exactly(&target, 5, &mut salt));
        }
        for _ in 0..8 {
            peers.push(id_with_cpl_exactly(&target, 6, &mut salt));
        }
        for _ in 0..4 {
            peers.push(id_with_cpl_exactly(&target, 7, &mut salt));
        }
        for _ in 0..2 {
            peers.push(id_with_cpl_exactly(&target, 8, &mut salt));
        }
        for _ in 0..2 {
            peers.push(id_with_cpl_at_least(&target, 9, &mut salt));
        }

        let detection = det.evaluate(1000.0, &target, &peers).unwrap();
        assert!(
            !detection.attack,
            "kl {} threshold {}",
            detection.kl_divergence, detection.threshold
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let det = EclipseDetector::new(20);
        let target = hash_id(b"target");
        let peers: Vec<KeyspaceId> = (0..25u64).map(|n| hash_id(&n.to_be_bytes())).collect();
        let a = det.evaluate(5000.0, &target, &peers).unwrap();
        let b = det.evaluate(5000.0, &target, &peers).unwrap();
        assert_eq!(a.attack, b.attack);
        assert_eq!(a.kl_divergence, b.kl_divergence);
        assert_eq!(a.counts, b.counts);
    }

    #[test]
    fn extra_peers_beyond_sample_size_are_ignored() {
        let det = EclipseDetector::new(20);
        let target = hash_id(b"target");
        let peers: Vec<KeyspaceId> = (0..40u64).map(|n| hash_id(&n.to_be_bytes())).collect();
        let truncated = det.evaluate(1000.0, &target, &peers[..20]).unwrap();
        let full = det.evaluate(1000.0, &target, &peers).unwrap();
        assert_eq!(truncated.counts, full.counts);
    }
}
