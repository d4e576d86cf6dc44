//! # Umbriel — Eclipse-Hardened Kademlia Routing Core
//!
//! Umbriel is the routing layer of a Kademlia-style DHT client, hardened
//! against eclipse attacks: adversaries that occupy a key's overlay
//! neighborhood with generated identities to deny honest peers access to
//! records. It provides:
//!
//! - **Iterative lookups with follow-up**: α-parallel best-first
//!   convergence on the k closest peers, plus a confirmation pass that
//!   re-queries any top-k peer the main search never reached.
//! - **Widened provider placement** ("special provide"): replicating
//!   provider records to every peer within a common-prefix-length radius
//!   expected to hold a target population, derived from a live
//!   network-size estimate, instead of only the k numerically closest —
//!   an attacker must then occupy an entire keyspace shell, not just the
//!   top-k.
//! - **Statistical eclipse detection**: a KL-divergence test comparing the
//!   observed common-prefix-length histogram of a returned neighborhood
//!   against the distribution expected from a uniform network of the
//!   estimated size.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `dht` | Top-level operations: values, providers, peer lookup |
//! | `query` | Iterative lookup engine and per-peer state machine |
//! | `keyspace` | BLAKE3 keyspace ids, XOR distance, common-prefix length |
//! | `routing` | CPL-bucketed routing table view |
//! | `detector` | CPL-histogram KL-divergence eclipse detector |
//! | `estimator` | Bucket-density network-size estimation |
//! | `record` | Records and namespaced validation |
//! | `capabilities` | Injected collaborator traits |
//! | `store` | Bounded in-memory capability implementations |
//!
//! ## Architecture
//!
//! The [`Dht`] handle owns injected capability traits (messenger, stores,
//! validator, network view); every operation borrows them for its own
//! duration. Operations fan out over tokio tasks and communicate over
//! bounded channels, so streaming consumers back-pressure the searches that
//! feed them. Per-peer transport failures are isolated inside the lookup
//! engine and never fail a whole operation.

mod capabilities;
mod detector;
mod dht;
mod estimator;
mod keyspace;
mod query;
mod record;
mod routing;
mod store;

pub use capabilities::{
    AddrInfo, Connectedness, Network, PeerAddressStore, ProtoMessenger, ProviderStore, RecordStore,
};
pub use detector::{Detection, DetectorError, EclipseDetector};
pub use dht::{
    min_cpl_for_network, Capabilities, Dht, DhtConfig, ProvideReport, ReceivedValue, RoutingError,
    SearchOptions, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE, DEFAULT_ECLIPSE_DETECTION_K,
    DEFAULT_PER_QUERY_TIMEOUT, DEFAULT_QUORUM, DEFAULT_SPECIAL_PROVIDE_NUMBER,
};
pub use estimator::{BucketDensityEstimator, EstimateError, NetworkSizeEstimator};
pub use keyspace::{
    distance_cmp, hash_id, Distance, KeyspaceId, PeerId, KEYSPACE_BITS,
};
pub use query::{LookupResult, PeerState};
pub use record::{NamespacedValidator, Record, Validator};
pub use routing::{RoutingTable, RoutingTableView};
pub use store::{MemoryPeerAddressStore, MemoryProviderStore, MemoryRecordStore};
