//! # Network-Size Estimation
//!
//! The widening strategy and the eclipse detector both need a scalar
//! estimate of how many peers the overlay currently has. The estimate comes
//! from routing-bucket densities: in a network of `N` uniformly placed
//! peers, the bucket at common-prefix-length `i` is expected to hold
//! `N / 2^(i+1)` peers, so every unsaturated bucket yields a local estimate
//! `N_i = count_i * 2^(i+1)`. Saturated buckets (clipped at k) are skipped,
//! the rest are combined count-weighted, and a median over a window of
//! observations smooths out churn.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::routing::RoutingTableView;

/// Number of observations kept for median smoothing.
const ESTIMATE_WINDOW: usize = 8;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EstimateError {
    #[error("insufficient data for a network size estimate")]
    InsufficientData,
}

/// Produces the scalar network-size estimate consumed by the widening
/// strategy and the eclipse detector.
///
/// `network_size` may fail while the estimator is cold; callers invoke
/// `gather_data` and retry once before falling back to standard placement.
#[async_trait]
pub trait NetworkSizeEstimator: Send + Sync + 'static {
    async fn network_size(&self) -> Result<f64, EstimateError>;
    async fn gather_data(&self);
}

/// Bucket-density estimator over the local routing table view.
pub struct BucketDensityEstimator {
    view: Arc<dyn RoutingTableView>,
    bucket_capacity: usize,
    window: Mutex<VecDeque<f64>>,
}

impl BucketDensityEstimator {
    pub fn new(view: Arc<dyn RoutingTableView>, bucket_capacity: usize) -> Self {
        Self {
            view,
            bucket_capacity,
            window: Mutex::new(VecDeque::with_capacity(ESTIMATE_WINDOW)),
        }
    }

    /// One raw estimate from a bucket-population snapshot, or `None` when no
    /// bucket carries usable signal.
    fn estimate_from_buckets(&self, populations: &[usize]) -> Option<f64> {
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;

        for (i, &count) in populations.iter().enumerate() {
            if count == 0 {
                continue;
            }
            // A full bucket is clipped at capacity and says nothing about
            // how many peers the prefix really holds.
            if count >= self.bucket_capacity {
                continue;
            }
            let local_estimate = (count as f64) * 2f64.powi(i as i32 + 1);
            let weight = count as f64;
            weighted_sum += local_estimate * weight;
            total_weight += weight;
        }

        if total_weight < f64::EPSILON {
            return None;
        }
        Some((weighted_sum / total_weight).max(1.0))
    }

    fn median(&self) -> Option<f64> {
        let window = self.window.lock();
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }
}

#[async_trait]
impl NetworkSizeEstimator for BucketDensityEstimator {
    async fn network_size(&self) -> Result<f64, EstimateError> {
        self.median().ok_or(EstimateError::InsufficientData)
    }

    async fn gather_data(&self) {
        let populations = self.view.bucket_populations();
        match self.estimate_from_buckets(&populations) {
            Some(estimate) => {
                let mut window = self.window.lock();
                window.push_back(estimate);
                if window.len() > ESTIMATE_WINDOW {
                    window.pop_front();
                }
                debug!(estimate, samples = window.len(), "network size observation");
            }
            None => {
                debug!("no unsaturated routing buckets; skipping size observation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{hash_id, KeyspaceId, PeerId};
    use crate::routing::RoutingTable;

    struct FixedView {
        populations: Vec<usize>,
    }

    impl RoutingTableView for FixedView {
        fn closest_local(&self, _t: &KeyspaceId, _n: usize) -> Vec<PeerId> {
            Vec::new()
        }
        fn reset_refresh_at(&self, _cpl: u32, _now: std::time::SystemTime) {}
        fn bucket_populations(&self) -> Vec<usize> {
            self.populations.clone()
        }
        fn random_id_in_bucket(&self, _cpl: u32) -> Option<KeyspaceId> {
            None
        }
    }

    #[tokio::test]
    async fn cold_estimator_reports_insufficient_data() {
        let view = Arc::new(FixedView {
            populations: vec![0; 256],
        });
        let est = BucketDensityEstimator::new(view, 20);
        assert_eq!(
            est.network_size().await,
            Err(EstimateError::InsufficientData)
        );
    }

    #[tokio::test]
    async fn ideal_bucket_densities_invert_to_network_size() {
        // Populations for N = 1024 with k = 20: bucket i holds
        // min(k, N / 2^(i+1)).
        let n = 1024f64;
        let k = 20usize;
        let mut populations = vec![0usize; 256];
        for (i, slot) in populations.iter_mut().enumerate() {
            let expected = n / 2f64.powi(i as i32 + 1);
            *slot = (expected.round() as usize).min(k);
        }

        let est = BucketDensityEstimator::new(Arc::new(FixedView { populations }), k);
        est.gather_data().await;
        let estimate = est.network_size().await.expect("estimate available");
        assert!(
            estimate > n / 2.0 && estimate < n * 2.0,
            "estimate {estimate} not within a factor of two of {n}"
        );
    }

    #[tokio::test]
    async fn live_routing_table_produces_an_estimate() {
        let table = Arc::new(RoutingTable::new(hash_id(b"self"), 20));
        for i in 0..500u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            table.insert(PeerId::from_bytes(bytes));
        }
        let est = BucketDensityEstimator::new(table, 20);
        est.gather_data().await;
        let estimate = est.network_size().await.expect("estimate available");
        assert!(estimate >= 1.0);
    }

    #[tokio::test]
    async fn median_smooths_observation_spikes() {
        let view = Arc::new(FixedView {
            populations: {
                let mut p = vec![0usize; 256];
                p[5] = 10; // N_5 = 10 * 64 = 640
                p
            },
        });
        let est = BucketDensityEstimator::new(view, 20);
        for _ in 0..5 {
            est.gather_data().await;
        }
        let estimate = est.network_size().await.unwrap();
        assert!((estimate - 640.0).abs() < 1.0);
    }
}
