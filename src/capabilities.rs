//! # Consumed Capabilities
//!
//! The routing core is written against injectable collaborator traits, one
//! per concern, so the host node decides how records persist, how peers are
//! reached on the wire, and how addresses are cached:
//!
//! | Capability | Trait | Purpose |
//! |------------|-------|---------|
//! | Messenger | [`ProtoMessenger`] | Per-peer DHT RPCs |
//! | Records | [`RecordStore`] | Local record persistence |
//! | Providers | [`ProviderStore`] | Local provider-record persistence |
//! | Addresses | [`PeerAddressStore`] | Peer address book with TTLs |
//! | Connectivity | [`Network`] | Connection-state queries |
//!
//! Traits are deliberately narrow: the core borrows them for the lifetime of
//! one operation and never assumes anything about their internals beyond the
//! documented contract. All of them must be safe to share across concurrent
//! operations.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::keyspace::{KeyspaceId, PeerId};
use crate::record::Record;

/// A peer and the addresses it can be dialed at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub peer: PeerId,
    pub addrs: Vec<String>,
}

impl AddrInfo {
    pub fn new(peer: PeerId, addrs: Vec<String>) -> Self {
        Self { peer, addrs }
    }

    /// An entry carrying only the peer id.
    pub fn bare(peer: PeerId) -> Self {
        Self {
            peer,
            addrs: Vec::new(),
        }
    }
}

/// Connection state of a peer as reported by the host's network layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    /// No connection and no known way to reach the peer.
    NotConnected,
    /// A live connection exists.
    Connected,
    /// Recently connected; addresses are known and believed dialable.
    CanConnect,
    /// A recent dial attempt failed.
    CannotConnect,
}

/// Per-peer DHT request/response messaging.
///
/// Transport errors are per-peer: the core logs and isolates them, so
/// implementations should return an error rather than retry internally.
#[async_trait]
pub trait ProtoMessenger: Send + Sync + 'static {
    /// Ask `to` to store `record`.
    async fn put_value(&self, to: PeerId, record: Record) -> Result<()>;

    /// Ask `to` for the record under `key`, plus peers closer to it.
    async fn get_value(&self, to: PeerId, key: &[u8]) -> Result<(Option<Record>, Vec<AddrInfo>)>;

    /// Announce `provider` to `to` for the content addressed by `key`.
    async fn put_provider(&self, to: PeerId, key: &[u8], provider: AddrInfo) -> Result<()>;

    /// Ask `to` for providers of `key`, plus peers closer to it.
    async fn get_providers(&self, to: PeerId, key: &[u8])
        -> Result<(Vec<AddrInfo>, Vec<AddrInfo>)>;

    /// Ask `to` for the peers it knows closest to `target`.
    async fn get_closest_peers(&self, to: PeerId, target: KeyspaceId) -> Result<Vec<AddrInfo>>;
}

/// Local record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn get_local(&self, key: &[u8]) -> Result<Option<Record>>;
    async fn put_local(&self, key: &[u8], record: Record) -> Result<()>;
}

/// Local provider-record persistence, addressed by the content hash derived
/// from a provider key.
#[async_trait]
pub trait ProviderStore: Send + Sync + 'static {
    async fn add_provider(&self, hash: &KeyspaceId, provider: AddrInfo) -> Result<()>;
    async fn providers(&self, hash: &KeyspaceId) -> Result<Vec<AddrInfo>>;
}

/// Peer address book. Addresses learned during lookups are cached here with
/// short TTLs so follow-up dials can find them.
#[async_trait]
pub trait PeerAddressStore: Send + Sync + 'static {
    async fn maybe_add_addrs(&self, peer: PeerId, addrs: Vec<String>, ttl: Duration);
    async fn addr_info(&self, peer: &PeerId) -> AddrInfo;
}

/// Connection-state queries against the host's network layer.
pub trait Network: Send + Sync + 'static {
    fn connectedness(&self, peer: &PeerId) -> Connectedness;
}
