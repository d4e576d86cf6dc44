//! # Routing Table View
//!
//! CPL-indexed k-buckets over the XOR keyspace. The routing core only ever
//! *reads* this table (closest-peer seeding, bucket refresh bookkeeping,
//! widening probes); how it gets populated — liveness pinging, eviction,
//! replacement caches — is the host node's business and stays outside this
//! crate.
//!
//! Bucket `i` holds peers whose keyspace id shares exactly `i` leading bits
//! with the local id. Each bucket remembers when a lookup last "refreshed"
//! it, which the host uses to schedule bucket refresh walks.

use std::time::SystemTime;

use parking_lot::RwLock;

use crate::keyspace::{distance_cmp, KeyspaceId, PeerId, KEYSPACE_BITS};

/// Read-only view the routing core has of the local routing table.
///
/// Implementations must be safe to share across concurrent lookups.
pub trait RoutingTableView: Send + Sync {
    /// Up to `n` locally-known peers, strictly ascending by XOR distance to
    /// `target` (ties broken by lexicographic peer id).
    fn closest_local(&self, target: &KeyspaceId, n: usize) -> Vec<PeerId>;

    /// Record that the bucket at common-prefix-length `cpl` was covered by a
    /// successfully completed lookup at `now`.
    fn reset_refresh_at(&self, cpl: u32, now: SystemTime);

    /// Peer count per CPL bucket, index = CPL with the local id.
    fn bucket_populations(&self) -> Vec<usize>;

    /// A uniformly random keyspace point sharing exactly `cpl` leading bits
    /// with the local id, or `None` when `cpl` is out of range or the local
    /// table holds no peer in that bucket.
    fn random_id_in_bucket(&self, cpl: u32) -> Option<KeyspaceId>;
}

#[derive(Clone, Copy)]
struct BucketEntry {
    peer: PeerId,
    id: KeyspaceId,
}

struct Bucket {
    entries: Vec<BucketEntry>,
    refreshed_at: SystemTime,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            refreshed_at: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Concrete in-memory routing table.
///
/// Interior-locked so a shared `Arc<RoutingTable>` can serve concurrent
/// lookups without an actor in between.
pub struct RoutingTable {
    self_id: KeyspaceId,
    k: usize,
    buckets: RwLock<Vec<Bucket>>,
}

impl RoutingTable {
    pub fn new(self_id: KeyspaceId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(KEYSPACE_BITS as usize);
        for _ in 0..KEYSPACE_BITS {
            buckets.push(Bucket::new());
        }
        Self {
            self_id,
            k,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn self_id(&self) -> &KeyspaceId {
        &self.self_id
    }

    fn bucket_index(&self, id: &KeyspaceId) -> Option<usize> {
        let cpl = self.self_id.common_prefix_len(id);
        if cpl >= KEYSPACE_BITS {
            // Same id as self; self never lives in its own table.
            return None;
        }
        Some(cpl as usize)
    }

    /// Insert a peer, k-bounded per bucket. Re-inserting an existing peer
    /// moves it to the back of its bucket. Returns false when the bucket is
    /// full or the peer maps onto the local id.
    pub fn insert(&self, peer: PeerId) -> bool {
        let id = peer.keyspace_id();
        let Some(idx) = self.bucket_index(&id) else {
            return false;
        };
        let mut buckets = self.buckets.write();
        let bucket = &mut buckets[idx];
        if let Some(pos) = bucket.entries.iter().position(|e| e.peer == peer) {
            let entry = bucket.entries.remove(pos);
            bucket.entries.push(entry);
            return true;
        }
        if bucket.entries.len() < self.k {
            bucket.entries.push(BucketEntry { peer, id });
            return true;
        }
        false
    }

    pub fn remove(&self, peer: &PeerId) {
        let id = peer.keyspace_id();
        let Some(idx) = self.bucket_index(&id) else {
            return;
        };
        let mut buckets = self.buckets.write();
        buckets[idx].entries.retain(|e| e.peer != *peer);
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let id = peer.keyspace_id();
        let Some(idx) = self.bucket_index(&id) else {
            return false;
        };
        self.buckets.read()[idx].entries.iter().any(|e| e.peer == *peer)
    }

    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn refreshed_at(&self, cpl: u32) -> Option<SystemTime> {
        let buckets = self.buckets.read();
        buckets.get(cpl as usize).map(|b| b.refreshed_at)
    }
}

impl RoutingTableView for RoutingTable {
    fn closest_local(&self, target: &KeyspaceId, n: usize) -> Vec<PeerId> {
        if n == 0 {
            return Vec::new();
        }
        let buckets = self.buckets.read();
        let mut entries: Vec<(PeerId, [u8; 32])> = Vec::new();
        for bucket in buckets.iter() {
            for entry in &bucket.entries {
                entries.push((entry.peer, entry.id.distance(target)));
            }
        }
        drop(buckets);

        entries.sort_by(|a, b| distance_cmp(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries.into_iter().map(|(peer, _)| peer).collect()
    }

    fn reset_refresh_at(&self, cpl: u32, now: SystemTime) {
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get_mut(cpl as usize) {
            bucket.refreshed_at = now;
        }
    }

    fn bucket_populations(&self) -> Vec<usize> {
        self.buckets.read().iter().map(|b| b.entries.len()).collect()
    }

    fn random_id_in_bucket(&self, cpl: u32) -> Option<KeyspaceId> {
        if cpl >= KEYSPACE_BITS {
            return None;
        }
        if self.buckets.read()[cpl as usize].entries.is_empty() {
            return None;
        }

        let self_bytes = self.self_id.as_bytes();
        let mut distance = [0u8; 32];
        if getrandom::getrandom(&mut distance).is_err() {
            return None;
        }

        // Force the first differing bit to sit exactly at `cpl`.
        let byte_idx = (cpl / 8) as usize;
        let bit_pos = cpl % 8;
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        let target_bit = 0x80u8 >> bit_pos;
        let random_mask = target_bit.wrapping_sub(1);
        distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self_bytes[i] ^ distance[i];
        }
        Some(KeyspaceId::from_bytes(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::hash_id;

    fn peer(n: u32) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn insert_and_closest_orders_by_distance() {
        let self_id = hash_id(b"self");
        let table = RoutingTable::new(self_id, 20);
        for n in 0..50 {
            table.insert(peer(n));
        }
        assert!(table.len() > 0);

        let target = hash_id(b"target");
        let closest = table.closest_local(&target, 10);
        assert!(closest.len() <= 10);
        for pair in closest.windows(2) {
            let da = pair[0].keyspace_id().distance(&target);
            let db = pair[1].keyspace_id().distance(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn buckets_are_k_bounded() {
        let self_id = hash_id(b"self");
        let table = RoutingTable::new(self_id, 2);
        for n in 0..2000 {
            table.insert(peer(n));
        }
        for population in table.bucket_populations() {
            assert!(population <= 2);
        }
    }

    #[test]
    fn reinsert_does_not_duplicate() {
        let table = RoutingTable::new(hash_id(b"self"), 20);
        assert!(table.insert(peer(7)));
        assert!(table.insert(peer(7)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn refresh_timestamps_update() {
        let table = RoutingTable::new(hash_id(b"self"), 20);
        let before = table.refreshed_at(3).unwrap();
        let now = SystemTime::now();
        table.reset_refresh_at(3, now);
        let after = table.refreshed_at(3).unwrap();
        assert!(after > before);
        assert_eq!(after, now);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let self_id = hash_id(b"self");
        let table = RoutingTable::new(self_id, 20);
        // Populate until some low bucket is non-empty.
        for n in 0..200 {
            table.insert(peer(n));
        }
        let populations = table.bucket_populations();
        let cpl = populations
            .iter()
            .position(|&c| c > 0)
            .expect("some bucket populated") as u32;

        for _ in 0..16 {
            let id = table.random_id_in_bucket(cpl).expect("bucket is populated");
            assert_eq!(self_id.common_prefix_len(&id), cpl);
        }
    }

    #[test]
    fn random_id_requires_populated_bucket() {
        let table = RoutingTable::new(hash_id(b"self"), 20);
        assert!(table.random_id_in_bucket(4).is_none());
        assert!(table.random_id_in_bucket(KEYSPACE_BITS).is_none());
    }
}
