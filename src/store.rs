//! # In-Memory Stores
//!
//! Bounded, TTL-aware implementations of the storage capabilities. They are
//! what the crate's own tests run against and a reasonable default for hosts
//! that do not need persistence; production nodes inject their own.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::capabilities::{AddrInfo, PeerAddressStore, ProviderStore, RecordStore};
use crate::keyspace::{KeyspaceId, PeerId};
use crate::record::Record;

/// Entry bound for the record cache.
const RECORD_STORE_MAX_ENTRIES: usize = 100_000;

/// Key bound for the provider cache.
const PROVIDER_STORE_MAX_KEYS: usize = 10_000;

/// Provider announcements expire after this long without re-announcement.
const PROVIDER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Providers tracked per content hash.
const MAX_PROVIDERS_PER_KEY: usize = 1_000;

/// Peer bound for the address book.
const ADDR_STORE_MAX_PEERS: usize = 10_000;

/// Bounded in-memory record store.
pub struct MemoryRecordStore {
    cache: Mutex<LruCache<Vec<u8>, Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(RECORD_STORE_MAX_ENTRIES).expect("capacity is non-zero");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_local(&self, key: &[u8]) -> Result<Option<Record>> {
        Ok(self.cache.lock().get(key).cloned())
    }

    async fn put_local(&self, key: &[u8], record: Record) -> Result<()> {
        self.cache.lock().put(key.to_vec(), record);
        Ok(())
    }
}

struct ProviderEntry {
    info: AddrInfo,
    announced_at: Instant,
}

/// Bounded in-memory provider store with announcement expiry.
pub struct MemoryProviderStore {
    entries: Mutex<LruCache<KeyspaceId, Vec<ProviderEntry>>>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(PROVIDER_STORE_MAX_KEYS).expect("capacity is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Default for MemoryProviderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn add_provider(&self, hash: &KeyspaceId, provider: AddrInfo) -> Result<()> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let list = entries.get_or_insert_mut(*hash, Vec::new);
        list.retain(|e| {
            now.duration_since(e.announced_at) < PROVIDER_ANNOUNCE_LIFETIME
                && e.info.peer != provider.peer
        });
        if list.len() < MAX_PROVIDERS_PER_KEY {
            list.push(ProviderEntry {
                info: provider,
                announced_at: now,
            });
        } else {
            debug!(
                hash = hex::encode(&hash.as_bytes()[..8]),
                "provider list full, dropping announcement"
            );
        }
        Ok(())
    }

    async fn providers(&self, hash: &KeyspaceId) -> Result<Vec<AddrInfo>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(hash) {
            Some(list) => {
                list.retain(|e| now.duration_since(e.announced_at) < PROVIDER_ANNOUNCE_LIFETIME);
                Ok(list.iter().map(|e| e.info.clone()).collect())
            }
            None => Ok(Vec::new()),
        }
    }
}

struct AddrEntry {
    addr: String,
    expires_at: Instant,
}

/// Bounded in-memory peer address book with per-address TTLs.
pub struct MemoryPeerAddressStore {
    peers: Mutex<LruCache<PeerId, Vec<AddrEntry>>>,
}

impl MemoryPeerAddressStore {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(ADDR_STORE_MAX_PEERS).expect("capacity is non-zero");
        Self {
            peers: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Default for MemoryPeerAddressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerAddressStore for MemoryPeerAddressStore {
    async fn maybe_add_addrs(&self, peer: PeerId, addrs: Vec<String>, ttl: Duration) {
        if addrs.is_empty() {
            return;
        }
        let mut peers = self.peers.lock();
        let now = Instant::now();
        let expires_at = now + ttl;
        let list = peers.get_or_insert_mut(peer, Vec::new);
        list.retain(|e| e.expires_at > now);
        for addr in addrs {
            match list.iter_mut().find(|e| e.addr == addr) {
                Some(existing) => {
                    if existing.expires_at < expires_at {
                        existing.expires_at = expires_at;
                    }
                }
                None => list.push(AddrEntry { addr, expires_at }),
            }
        }
    }

    async fn addr_info(&self, peer: &PeerId) -> AddrInfo {
        let mut peers = self.peers.lock();
        let now = Instant::now();
        match peers.get_mut(peer) {
            Some(list) => {
                list.retain(|e| e.expires_at > now);
                AddrInfo::new(*peer, list.iter().map(|e| e.addr.clone()).collect())
            }
            None => AddrInfo::bare(*peer),
        }
    }
}
