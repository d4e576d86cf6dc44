//! # DHT Routing Operations
//!
//! The top-level overlay operations, layered on the iterative lookup engine:
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put_value` / `get_value` / `search_value` | Record storage with quorum gathering and corrective writes |
//! | `provide` / `provide_with_return` | Provider announcement, standard or widened placement |
//! | `find_providers` / `find_providers_async` | Streaming provider discovery |
//! | `find_peer` | Peer resolution with early termination on connectedness |
//! | `get_closest_peers` | Plain closest-peer walk |
//! | `eclipse_detection` | Statistical neighborhood check |
//!
//! Two hardening mechanisms sit on top of the standard operations. When
//! `special_provide_enabled` is set and a network-size estimate is
//! available, provider records are replicated to *every* peer within a
//! common-prefix-length radius expected to contain `special_provide_number`
//! peers, instead of only the k numerically closest. Independently, each
//! provide/find-providers neighborhood is run through the eclipse detector
//! and the verdict logged; detection is diagnostic and never changes
//! placement.
//!
//! All collaborators are injected capabilities; the operations borrow them
//! for their own duration and per-peer transport failures never escape.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::capabilities::{
    AddrInfo, Connectedness, Network, PeerAddressStore, ProtoMessenger, ProviderStore, RecordStore,
};
use crate::detector::{Detection, DetectorError, EclipseDetector};
use crate::estimator::{EstimateError, NetworkSizeEstimator};
use crate::keyspace::{distance_cmp, hash_id, KeyspaceId, PeerId, KEYSPACE_BITS};
use crate::query::{LookupEngine, LookupResult, PeerState, QueryFn, StopFn, Termination};
use crate::record::{Record, Validator};
use crate::routing::RoutingTableView;

/// Default replication factor (bucket size) k.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Default lookup concurrency factor α.
pub const DEFAULT_ALPHA: usize = 3;

/// Default target population of the widened provider placement.
pub const DEFAULT_SPECIAL_PROVIDE_NUMBER: usize = 30;

/// Default sample size of the eclipse detector.
pub const DEFAULT_ECLIPSE_DETECTION_K: usize = 20;

/// Default quorum applied by `get_value` when the caller supplies none.
pub const DEFAULT_QUORUM: usize = 16;

/// Per-peer query timeout inside lookups.
pub const DEFAULT_PER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the `search_value` output stream.
const VALUE_STREAM_CAPACITY: usize = 16;

/// Capacity of the internal received-value channel.
const RECEIVED_VALUE_CAPACITY: usize = 1;

/// Capacity of the on-path peer stream of
/// `find_providers_return_on_path_nodes`. The producer back-pressures
/// against a lagging consumer instead of buffering without bound.
const ON_PATH_CHANNEL_CAPACITY: usize = 512;

/// Timeout for each corrective write after a value search.
const CORRECTIVE_PUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Below this remaining budget, `provide` reserves 10% for the put phase.
const PROVIDE_TAIL_THRESHOLD: Duration = Duration::from_secs(10);

/// Above the threshold, `provide` reserves a flat second for the put phase.
const PROVIDE_TAIL_RESERVE: Duration = Duration::from_secs(1);

/// TTL for addresses learned from lookup responses.
const DISCOVERED_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Errors surfaced by the DHT operations.
///
/// Per-peer transport failures are not here: they are logged and isolated
/// inside the lookup engine.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("operation not supported")]
    NotSupported,

    #[error("invalid key")]
    InvalidKey,

    #[error("record rejected: {0}")]
    Validation(String),

    #[error("cannot replace a newer value with an older value")]
    StaleWrite,

    #[error("store failure: {0}")]
    Store(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// DHT tuning knobs. `Default` mirrors the crate constants.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub enable_values: bool,
    pub enable_providers: bool,
    /// Replication factor k: lookup result width and put fan-out.
    pub bucket_size: usize,
    /// Lookup concurrency factor α.
    pub alpha: usize,
    /// Replicate provider records across a CPL radius instead of only the
    /// k closest peers, whenever a network-size estimate is available.
    pub special_provide_enabled: bool,
    /// Target population of the widened placement radius.
    pub special_provide_number: usize,
    /// Sample size K_ed of the eclipse detector.
    pub eclipse_detection_k: usize,
    /// Quorum applied by `get_value` when the caller supplies none.
    pub default_quorum: usize,
    /// Per-peer query timeout inside lookups.
    pub per_query_timeout: Duration,
    /// Outer deadline applied by `provide`; `None` means unbounded.
    pub provide_timeout: Option<Duration>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enable_values: true,
            enable_providers: true,
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            special_provide_enabled: true,
            special_provide_number: DEFAULT_SPECIAL_PROVIDE_NUMBER,
            eclipse_detection_k: DEFAULT_ECLIPSE_DETECTION_K,
            default_quorum: DEFAULT_QUORUM,
            per_query_timeout: DEFAULT_PER_QUERY_TIMEOUT,
            provide_timeout: None,
        }
    }
}

/// The injected collaborators of one DHT instance.
pub struct Capabilities {
    pub routing: Arc<dyn RoutingTableView>,
    pub messenger: Arc<dyn ProtoMessenger>,
    pub validator: Arc<dyn Validator>,
    pub record_store: Arc<dyn RecordStore>,
    pub provider_store: Arc<dyn ProviderStore>,
    pub peer_addrs: Arc<dyn PeerAddressStore>,
    pub network: Arc<dyn Network>,
    pub estimator: Arc<dyn NetworkSizeEstimator>,
}

/// A value received during a search, with its origin.
#[derive(Clone, Debug)]
pub struct ReceivedValue {
    pub value: Vec<u8>,
    pub from: PeerId,
}

/// Options for `get_value` / `search_value`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchOptions {
    /// Responses to gather before the search stops early. `None` means the
    /// operation default (`get_value` applies the configured quorum,
    /// `search_value` runs to lookup completion).
    pub quorum: Option<usize>,
    /// Hard deadline for the underlying lookup.
    pub deadline: Option<Instant>,
}

/// What a provide run selected, for callers measuring placement.
#[derive(Clone, Debug)]
pub struct ProvideReport {
    /// Peers the provider record was dispatched to.
    pub peers: Vec<PeerId>,
    /// Iterative lookups the placement required.
    pub num_lookups: usize,
}

/// The minimum common-prefix length whose keyspace shell is expected to
/// hold `replication` peers in a network of `network_size`.
pub fn min_cpl_for_network(network_size: f64, replication: usize) -> u32 {
    let replication = replication.max(1) as f64;
    let raw = (network_size / replication).log2().ceil() as i64 - 1;
    raw.clamp(0, (KEYSPACE_BITS - 1) as i64) as u32
}

struct DhtInner {
    self_peer: PeerId,
    self_key: KeyspaceId,
    config: DhtConfig,
    special_provide_number: AtomicUsize,
    routing: Arc<dyn RoutingTableView>,
    messenger: Arc<dyn ProtoMessenger>,
    validator: Arc<dyn Validator>,
    record_store: Arc<dyn RecordStore>,
    provider_store: Arc<dyn ProviderStore>,
    peer_addrs: Arc<dyn PeerAddressStore>,
    network: Arc<dyn Network>,
    estimator: Arc<dyn NetworkSizeEstimator>,
    detector: EclipseDetector,
    engine: LookupEngine,
    // Providing is heavy and rare; serializing it keeps the provider store
    // and the size estimator from concurrent thrash.
    provide_lock: tokio::sync::Mutex<()>,
}

/// The eclipse-hardened DHT routing core.
///
/// Cheap to clone; operations take `&self` and spawn their own workers.
pub struct Dht {
    inner: Arc<DhtInner>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Dht {
    pub fn new(self_peer: PeerId, config: DhtConfig, caps: Capabilities) -> Self {
        let engine = LookupEngine {
            k: config.bucket_size.max(1),
            alpha: config.alpha.max(1),
            per_query_timeout: config.per_query_timeout,
            self_peer,
        };
        let detector = EclipseDetector::new(config.eclipse_detection_k.max(1));
        let special_provide_number = AtomicUsize::new(config.special_provide_number.max(1));
        Self {
            inner: Arc::new(DhtInner {
                self_peer,
                self_key: self_peer.keyspace_id(),
                config,
                special_provide_number,
                routing: caps.routing,
                messenger: caps.messenger,
                validator: caps.validator,
                record_store: caps.record_store,
                provider_store: caps.provider_store,
                peer_addrs: caps.peer_addrs,
                network: caps.network,
                estimator: caps.estimator,
                detector,
                engine,
                provide_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn self_peer(&self) -> PeerId {
        self.inner.self_peer
    }

    /// Adjust the widened placement's target population at runtime.
    pub fn set_special_provide_number(&self, n: usize) {
        self.inner
            .special_provide_number
            .store(n.max(1), Ordering::Relaxed);
    }

    fn special_provide_number(&self) -> usize {
        self.inner.special_provide_number.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Closest-peer walks
    // ========================================================================

    /// The k peers closest to `key`, by full iterative lookup.
    pub async fn get_closest_peers(&self, key: &[u8]) -> Result<Vec<PeerId>, RoutingError> {
        let target = hash_id(key);
        let (result, termination) = self.closest_peers_walk(target, None).await;
        if termination == Termination::DeadlineExceeded {
            return Err(RoutingError::DeadlineExceeded);
        }
        Ok(result.peers)
    }

    async fn closest_peers_walk(
        &self,
        target: KeyspaceId,
        deadline: Option<Instant>,
    ) -> (LookupResult, Termination) {
        let query_fn = self.closest_peers_query_fn(target);
        let never: StopFn = Arc::new(|| false);
        let seeds = self.seeds_for(&target);
        let (result, termination) = self
            .inner
            .engine
            .run_lookup_with_followup(target, seeds, query_fn, never, deadline)
            .await;
        self.note_refresh(&target, &result);
        (result, termination)
    }

    /// Per-peer query that walks toward `target` and caches discovered
    /// addresses.
    fn closest_peers_query_fn(&self, target: KeyspaceId) -> QueryFn {
        let dht = self.clone();
        Arc::new(move |peer: PeerId| {
            let dht = dht.clone();
            Box::pin(async move {
                let closer = dht.inner.messenger.get_closest_peers(peer, target).await?;
                for info in &closer {
                    dht.inner
                        .peer_addrs
                        .maybe_add_addrs(info.peer, info.addrs.clone(), DISCOVERED_ADDR_TTL)
                        .await;
                }
                Ok(closer)
            })
        })
    }

    fn seeds_for(&self, target: &KeyspaceId) -> Vec<PeerId> {
        self.inner
            .routing
            .closest_local(target, self.inner.config.bucket_size)
    }

    /// A completed lookup covered the target's bucket; note the refresh so
    /// the host can skip its scheduled walk.
    fn note_refresh(&self, target: &KeyspaceId, result: &LookupResult) {
        if result.completed {
            let cpl = self
                .inner
                .self_key
                .common_prefix_len(target)
                .min(KEYSPACE_BITS - 1);
            self.inner.routing.reset_refresh_at(cpl, SystemTime::now());
        }
    }

    // ========================================================================
    // Value operations
    // ========================================================================

    /// Store `value` under `key`, locally and on the k closest peers.
    ///
    /// Refuses to overwrite a local record the validator ranks better than
    /// the new value. Per-peer store failures are logged and swallowed.
    pub async fn put_value(&self, key: &[u8], value: Vec<u8>) -> Result<(), RoutingError> {
        if !self.inner.config.enable_values {
            return Err(RoutingError::NotSupported);
        }
        debug!(key = %log_key(key), "putting value");

        self.inner
            .validator
            .validate(key, &value)
            .map_err(|e| RoutingError::Validation(e.to_string()))?;

        let old = self
            .inner
            .record_store
            .get_local(key)
            .await
            .map_err(|e| RoutingError::Store(e.to_string()))?;
        if let Some(old) = &old {
            if old.value != value {
                let selected = self
                    .inner
                    .validator
                    .select(key, &[&value, &old.value])
                    .map_err(|e| RoutingError::Validation(e.to_string()))?;
                if selected != 0 {
                    return Err(RoutingError::StaleWrite);
                }
            }
        }

        let record = Record::stamped(key.to_vec(), value);
        self.inner
            .record_store
            .put_local(key, record.clone())
            .await
            .map_err(|e| RoutingError::Store(e.to_string()))?;

        let peers = self.get_closest_peers(key).await?;
        let mut join_set = JoinSet::new();
        for peer in peers {
            let dht = self.clone();
            let record = record.clone();
            join_set.spawn(async move {
                if let Err(e) = dht.inner.messenger.put_value(peer, record).await {
                    debug!(peer = %peer, error = %e, "failed putting value to peer");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        Ok(())
    }

    /// Search for the value under `key`, streaming every improvement.
    ///
    /// Emitted values are monotonically non-decreasing under the validator's
    /// ranking; the last value is the best one the search found. After a
    /// naturally completed search, peers that returned stale values receive
    /// corrective writes in the background.
    pub async fn search_value(
        &self,
        key: &[u8],
        opts: SearchOptions,
    ) -> Result<mpsc::Receiver<Vec<u8>>, RoutingError> {
        if !self.inner.config.enable_values {
            return Err(RoutingError::NotSupported);
        }
        let quorum = opts.quorum.unwrap_or(0);
        debug!(key = %log_key(key), quorum, "searching value");

        let (out_tx, out_rx) = mpsc::channel(VALUE_STREAM_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (val_rx, lookup_rx) = self.get_values(key.to_vec(), stop_rx, opts.deadline);

        let dht = self.clone();
        let key = key.to_vec();
        tokio::spawn(async move {
            let (best, peers_with_best, aborted) = dht
                .process_values(&key, val_rx, &out_tx, &stop_tx, quorum)
                .await;
            let Some(best) = best else {
                return;
            };
            if aborted {
                return;
            }
            let lookup = match lookup_rx.await {
                Ok(Some(lookup)) => lookup,
                _ => return,
            };
            let outdated: Vec<PeerId> = lookup
                .peers
                .iter()
                .filter(|p| !peers_with_best.contains(*p))
                .copied()
                .collect();
            let fix_local = !peers_with_best.contains(&dht.inner.self_peer);
            dht.update_peer_values(&key, best, outdated, fix_local);
        });

        Ok(out_rx)
    }

    /// Search for the value under `key` and return the best one.
    pub async fn get_value(
        &self,
        key: &[u8],
        opts: SearchOptions,
    ) -> Result<Vec<u8>, RoutingError> {
        let quorum = opts.quorum.unwrap_or(self.inner.config.default_quorum);
        let opts = SearchOptions {
            quorum: Some(quorum),
            ..opts
        };
        let mut rx = self.search_value(key, opts).await?;
        let mut best = None;
        while let Some(value) = rx.recv().await {
            best = Some(value);
        }
        best.ok_or(RoutingError::NotFound)
    }

    /// Run the value lookup, streaming validated records out as they
    /// arrive. The local record, if any, seeds the stream.
    fn get_values(
        &self,
        key: Vec<u8>,
        stop_rx: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> (
        mpsc::Receiver<ReceivedValue>,
        oneshot::Receiver<Option<LookupResult>>,
    ) {
        let (val_tx, val_rx) = mpsc::channel(RECEIVED_VALUE_CAPACITY);
        let (res_tx, res_rx) = oneshot::channel();

        let dht = self.clone();
        tokio::spawn(async move {
            match dht.inner.record_store.get_local(&key).await {
                Ok(Some(record)) => {
                    let _ = val_tx
                        .send(ReceivedValue {
                            value: record.value,
                            from: dht.inner.self_peer,
                        })
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %log_key(&key), error = %e, "local record read failed");
                }
            }

            let target = hash_id(&key);
            let query_fn: QueryFn = {
                let dht = dht.clone();
                let key = key.clone();
                let val_tx = val_tx.clone();
                Arc::new(move |peer: PeerId| {
                    let dht = dht.clone();
                    let key = key.clone();
                    let val_tx = val_tx.clone();
                    Box::pin(async move {
                        let (record, closer) = dht.inner.messenger.get_value(peer, &key).await?;
                        for info in &closer {
                            dht.inner
                                .peer_addrs
                                .maybe_add_addrs(info.peer, info.addrs.clone(), DISCOVERED_ADDR_TTL)
                                .await;
                        }
                        if let Some(record) = record {
                            if record.value.is_empty() {
                                debug!(peer = %peer, "received an empty record value");
                            } else if let Err(e) = dht.inner.validator.validate(&key, &record.value)
                            {
                                debug!(peer = %peer, error = %e, "received invalid record (discarded)");
                            } else if val_tx
                                .send(ReceivedValue {
                                    value: record.value,
                                    from: peer,
                                })
                                .await
                                .is_err()
                            {
                                anyhow::bail!("value consumer closed");
                            }
                        }
                        Ok(closer)
                    })
                })
            };
            let stop_fn: StopFn = {
                let stop_rx = stop_rx.clone();
                Arc::new(move || *stop_rx.borrow())
            };
            let seeds = dht.seeds_for(&target);
            let (result, _termination) = dht
                .inner
                .engine
                .run_lookup_with_followup(target, seeds, query_fn, stop_fn, deadline)
                .await;
            dht.note_refresh(&target, &result);
            let _ = res_tx.send(Some(result));
        });

        (val_rx, res_rx)
    }

    /// The quorum pipeline: track the best value seen so far and who holds
    /// it, emit every improvement, and raise the stop signal once `quorum`
    /// responses have been processed.
    ///
    /// Returns `(best, peers_with_best, aborted)`; an aborted run (quorum
    /// reached or consumer gone) skips the corrective-write phase.
    async fn process_values(
        &self,
        key: &[u8],
        mut val_rx: mpsc::Receiver<ReceivedValue>,
        out_tx: &mpsc::Sender<Vec<u8>>,
        stop_tx: &watch::Sender<bool>,
        quorum: usize,
    ) -> (Option<Vec<u8>>, HashSet<PeerId>, bool) {
        let mut best: Option<Vec<u8>> = None;
        let mut peers_with_best: HashSet<PeerId> = HashSet::new();
        let mut responses = 0usize;

        while let Some(received) = val_rx.recv().await {
            let better = match best.as_deref() {
                None => true,
                Some(current) if current == received.value.as_slice() => {
                    peers_with_best.insert(received.from);
                    false
                }
                Some(current) => {
                    match self
                        .inner
                        .validator
                        .select(key, &[current, &received.value])
                    {
                        Ok(1) => true,
                        Ok(_) => false,
                        Err(e) => {
                            warn!(key = %log_key(key), error = %e, "failed to select best value");
                            continue;
                        }
                    }
                }
            };

            if better {
                best = Some(received.value.clone());
                peers_with_best.clear();
                peers_with_best.insert(received.from);
                if out_tx.send(received.value).await.is_err() {
                    return (best, peers_with_best, true);
                }
            }

            responses += 1;
            if quorum > 0 && responses > quorum {
                trace!(responses, quorum, "quorum reached, stopping search");
                let _ = stop_tx.send(true);
                return (best, peers_with_best, true);
            }
        }

        (best, peers_with_best, false)
    }

    /// Push the winning value to every peer that returned something worse,
    /// detached from the caller and bounded per peer.
    fn update_peer_values(&self, key: &[u8], value: Vec<u8>, peers: Vec<PeerId>, fix_local: bool) {
        let record = Record::stamped(key.to_vec(), value);

        if fix_local {
            let dht = self.clone();
            let key = key.to_vec();
            let record = record.clone();
            tokio::spawn(async move {
                let stale = match dht.inner.record_store.get_local(&key).await {
                    Ok(Some(local)) => local.value != record.value,
                    _ => false,
                };
                if stale {
                    if let Err(e) = dht.inner.record_store.put_local(&key, record).await {
                        warn!(key = %log_key(&key), error = %e, "failed correcting local record");
                    }
                }
            });
        }

        for peer in peers {
            let dht = self.clone();
            let record = record.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + CORRECTIVE_PUT_TIMEOUT;
                match timeout_at(deadline, dht.inner.messenger.put_value(peer, record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "corrective write failed"),
                    Err(_) => debug!(peer = %peer, "corrective write timed out"),
                }
            });
        }
    }

    // ========================================================================
    // Provider operations
    // ========================================================================

    /// Announce this node as a provider for `key`.
    ///
    /// With `broadcast` false only the local provider store is updated.
    /// The outer deadline comes from `DhtConfig::provide_timeout`.
    pub async fn provide(&self, key: &[u8], broadcast: bool) -> Result<(), RoutingError> {
        let deadline = self
            .inner
            .config
            .provide_timeout
            .map(|timeout| Instant::now() + timeout);
        self.provide_with_deadline(key, broadcast, deadline)
            .await
            .map(|_| ())
    }

    /// `provide`, reporting the selected peers and lookup count.
    pub async fn provide_with_return(
        &self,
        key: &[u8],
        broadcast: bool,
    ) -> Result<ProvideReport, RoutingError> {
        let deadline = self
            .inner
            .config
            .provide_timeout
            .map(|timeout| Instant::now() + timeout);
        self.provide_with_deadline(key, broadcast, deadline).await
    }

    /// `provide` under an explicit outer deadline.
    ///
    /// A slice of the budget (10% under [`PROVIDE_TAIL_THRESHOLD`], one
    /// second otherwise) is reserved for the final put fan-out. If the
    /// lookup phase exhausts its inner budget while the outer deadline is
    /// still live, the record is dispatched to the best partial peer set
    /// and the call returns `DeadlineExceeded` after the put phase.
    pub async fn provide_with_deadline(
        &self,
        key: &[u8],
        broadcast: bool,
        deadline: Option<Instant>,
    ) -> Result<ProvideReport, RoutingError> {
        if !self.inner.config.enable_providers {
            return Err(RoutingError::NotSupported);
        }
        if key.is_empty() {
            return Err(RoutingError::InvalidKey);
        }

        let _guard = self.inner.provide_lock.lock().await;

        let hash = hash_id(key);
        debug!(hash = %log_id(&hash), broadcast, "providing");

        let self_info = self.inner.peer_addrs.addr_info(&self.inner.self_peer).await;
        self.inner
            .provider_store
            .add_provider(&hash, self_info.clone())
            .await
            .map_err(|e| RoutingError::Store(e.to_string()))?;
        if !broadcast {
            return Ok(ProvideReport {
                peers: Vec::new(),
                num_lookups: 0,
            });
        }

        let inner_deadline = match deadline {
            Some(outer) => {
                let now = Instant::now();
                if outer <= now {
                    return Err(RoutingError::DeadlineExceeded);
                }
                let remaining = outer - now;
                let reserve = if remaining < PROVIDE_TAIL_THRESHOLD {
                    remaining / 10
                } else {
                    PROVIDE_TAIL_RESERVE
                };
                Some(outer - reserve)
            }
            None => None,
        };

        let netsize = if self.inner.config.special_provide_enabled {
            match self.network_size_with_retry().await {
                Ok(netsize) => Some(netsize),
                Err(e) => {
                    debug!(error = %e, "standard provide: no network size estimate");
                    None
                }
            }
        } else {
            None
        };

        let mut exceeded = false;
        let num_lookups;
        let peers: Vec<PeerId> = match netsize {
            Some(netsize) => {
                let min_cpl = min_cpl_for_network(netsize, self.special_provide_number());
                info!(hash = %log_id(&hash), netsize, min_cpl, "wide provider placement");
                let never: StopFn = Arc::new(|| false);
                let (peers, lookups, hit_deadline) = self
                    .peers_with_cpl(
                        &hash,
                        min_cpl,
                        |target| self.closest_peers_query_fn(target),
                        never,
                        inner_deadline,
                    )
                    .await;
                num_lookups = lookups;
                if hit_deadline {
                    if deadline_elapsed(deadline) {
                        return Err(RoutingError::DeadlineExceeded);
                    }
                    exceeded = true;
                }
                peers
            }
            None => {
                let (result, termination) = self.closest_peers_walk(hash, inner_deadline).await;
                num_lookups = 1;
                if termination == Termination::DeadlineExceeded {
                    if deadline_elapsed(deadline) {
                        return Err(RoutingError::DeadlineExceeded);
                    }
                    exceeded = true;
                }
                result.peers
            }
        };

        debug!(
            hash = %log_id(&hash),
            peers = peers.len(),
            num_lookups,
            "dispatching provider record"
        );
        let mut join_set = JoinSet::new();
        for peer in peers.iter().copied() {
            let dht = self.clone();
            let key = key.to_vec();
            let self_info = self_info.clone();
            join_set.spawn(async move {
                let send = dht.inner.messenger.put_provider(peer, &key, self_info);
                let result = match deadline {
                    Some(outer) => match timeout_at(outer, send).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("deadline exceeded")),
                    },
                    None => send.await,
                };
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "provider announcement failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        self.report_neighborhood(&hash, &peers, "provide").await;

        if exceeded {
            return Err(RoutingError::DeadlineExceeded);
        }
        Ok(ProvideReport { peers, num_lookups })
    }

    /// Providers of `key`, up to the configured bucket size.
    pub async fn find_providers(&self, key: &[u8]) -> Result<Vec<AddrInfo>, RoutingError> {
        let mut rx = self
            .find_providers_async(key, self.inner.config.bucket_size)
            .await?;
        let mut providers = Vec::new();
        while let Some(info) = rx.recv().await {
            providers.push(info);
        }
        Ok(providers)
    }

    /// Stream providers of `key` as they are found. `count = 0` keeps the
    /// search running until the lookup naturally terminates; otherwise at
    /// most `count` unique providers are emitted and the search stops.
    pub async fn find_providers_async(
        &self,
        key: &[u8],
        count: usize,
    ) -> Result<mpsc::Receiver<AddrInfo>, RoutingError> {
        if !self.inner.config.enable_providers {
            return Err(RoutingError::NotSupported);
        }
        if key.is_empty() {
            return Err(RoutingError::InvalidKey);
        }
        debug!(key = %log_key(key), count, "finding providers");

        let (out_tx, out_rx) = mpsc::channel(count.max(1));
        let dht = self.clone();
        let key = key.to_vec();
        tokio::spawn(async move {
            dht.find_providers_routine(key, count, out_tx, None).await;
        });
        Ok(out_rx)
    }

    /// `find_providers` that also reports every peer the search contacted.
    pub async fn find_providers_return_on_path_nodes(
        &self,
        key: &[u8],
    ) -> Result<(Vec<AddrInfo>, Vec<PeerId>), RoutingError> {
        if !self.inner.config.enable_providers {
            return Err(RoutingError::NotSupported);
        }
        if key.is_empty() {
            return Err(RoutingError::InvalidKey);
        }

        let count = self.inner.config.bucket_size;
        let (out_tx, mut out_rx) = mpsc::channel(count.max(1));
        let (path_tx, mut path_rx) = mpsc::channel(ON_PATH_CHANNEL_CAPACITY);

        let dht = self.clone();
        let key = key.to_vec();
        tokio::spawn(async move {
            dht.find_providers_routine(key, count, out_tx, Some(path_tx))
                .await;
        });

        // Drain both streams concurrently; the bounded on-path channel
        // back-pressures the search if either were left unread.
        let providers = async {
            let mut acc = Vec::new();
            while let Some(info) = out_rx.recv().await {
                acc.push(info);
            }
            acc
        };
        let on_path = async {
            let mut acc = Vec::new();
            while let Some(peer) = path_rx.recv().await {
                acc.push(peer);
            }
            acc
        };
        let (providers, on_path) = tokio::join!(providers, on_path);
        Ok((providers, on_path))
    }

    async fn find_providers_routine(
        self,
        key: Vec<u8>,
        count: usize,
        out_tx: mpsc::Sender<AddrInfo>,
        on_path_tx: Option<mpsc::Sender<PeerId>>,
    ) {
        let find_all = count == 0;
        let hash = hash_id(&key);
        let found: Arc<Mutex<HashSet<PeerId>>> = Arc::new(Mutex::new(HashSet::new()));

        // Local provider store streams first.
        let local = match self.inner.provider_store.providers(&hash).await {
            Ok(local) => local,
            Err(e) => {
                warn!(hash = %log_id(&hash), error = %e, "provider store read failed");
                return;
            }
        };
        for info in local {
            if try_add_provider(&found, info.peer, count, find_all) {
                if out_tx.send(info).await.is_err() {
                    return;
                }
            }
            if !find_all && found.lock().len() >= count {
                return;
            }
        }

        let contacted: Arc<Mutex<HashSet<PeerId>>> = Arc::new(Mutex::new(HashSet::new()));
        let query_fn: QueryFn = {
            let dht = self.clone();
            let key = key.clone();
            let out_tx = out_tx.clone();
            let found = found.clone();
            let contacted = contacted.clone();
            let on_path_tx = on_path_tx.clone();
            Arc::new(move |peer: PeerId| {
                let dht = dht.clone();
                let key = key.clone();
                let out_tx = out_tx.clone();
                let found = found.clone();
                let contacted = contacted.clone();
                let on_path_tx = on_path_tx.clone();
                Box::pin(async move {
                    if let Some(path_tx) = &on_path_tx {
                        if contacted.lock().insert(peer) {
                            let _ = path_tx.send(peer).await;
                        }
                    }

                    let (providers, closer) = dht.inner.messenger.get_providers(peer, &key).await?;
                    trace!(peer = %peer, providers = providers.len(), "provider entries");

                    for provider in providers {
                        dht.inner
                            .peer_addrs
                            .maybe_add_addrs(
                                provider.peer,
                                provider.addrs.clone(),
                                DISCOVERED_ADDR_TTL,
                            )
                            .await;
                        if try_add_provider(&found, provider.peer, count, find_all) {
                            if out_tx.send(provider).await.is_err() {
                                anyhow::bail!("provider consumer closed");
                            }
                        }
                        if !find_all && found.lock().len() >= count {
                            break;
                        }
                    }

                    for info in &closer {
                        dht.inner
                            .peer_addrs
                            .maybe_add_addrs(info.peer, info.addrs.clone(), DISCOVERED_ADDR_TTL)
                            .await;
                    }
                    Ok(closer)
                })
            })
        };
        let stop_fn: StopFn = {
            let found = found.clone();
            Arc::new(move || !find_all && found.lock().len() >= count)
        };

        let netsize = if self.inner.config.special_provide_enabled {
            self.network_size_with_retry().await.ok()
        } else {
            None
        };

        let visited: Vec<PeerId> = match netsize {
            Some(netsize) => {
                let min_cpl = min_cpl_for_network(netsize, self.special_provide_number());
                debug!(hash = %log_id(&hash), netsize, min_cpl, "wide provider search");
                let (peers, num_lookups, _) = self
                    .peers_with_cpl(
                        &hash,
                        min_cpl,
                        |target| {
                            if target == hash {
                                query_fn.clone()
                            } else {
                                self.closest_peers_query_fn(target)
                            }
                        },
                        stop_fn,
                        None,
                    )
                    .await;
                debug!(hash = %log_id(&hash), num_lookups, "wide provider search done");
                peers
            }
            None => {
                let seeds = self.seeds_for(&hash);
                let (result, _termination) = self
                    .inner
                    .engine
                    .run_lookup_with_followup(hash, seeds, query_fn, stop_fn, None)
                    .await;
                self.note_refresh(&hash, &result);
                result.peers
            }
        };

        if !visited.is_empty() {
            self.report_neighborhood(&hash, &visited, "find_providers")
                .await;
        }
    }

    // ========================================================================
    // Widening strategy
    // ========================================================================

    /// Enumerate peers sharing at least `min_cpl` bits with `target`.
    ///
    /// A single closest-peer lookup converges to distance, not prefix
    /// width, so the target walk is combined with a probe into the local
    /// bucket at `min_cpl` and with the local view, then filtered down to
    /// the requested shell. Returns the peers ascending by distance, the
    /// number of lookups issued, and whether the deadline cut the walk
    /// short.
    async fn peers_with_cpl(
        &self,
        target: &KeyspaceId,
        min_cpl: u32,
        query_for: impl Fn(KeyspaceId) -> QueryFn,
        stop_fn: StopFn,
        deadline: Option<Instant>,
    ) -> (Vec<PeerId>, usize, bool) {
        let mut num_lookups = 0usize;
        let mut hit_deadline = false;
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut union: Vec<PeerId> = Vec::new();

        let seeds = self.seeds_for(target);
        let (initial, termination) = self
            .inner
            .engine
            .run_lookup_with_followup(*target, seeds, query_for(*target), stop_fn.clone(), deadline)
            .await;
        self.note_refresh(target, &initial);
        num_lookups += 1;
        if termination == Termination::DeadlineExceeded {
            hit_deadline = true;
        }
        for peer in initial.peers {
            if seen.insert(peer) {
                union.push(peer);
            }
        }

        if !hit_deadline && !stop_fn() {
            if let Some(probe) = self.inner.routing.random_id_in_bucket(min_cpl) {
                let seeds = self.seeds_for(&probe);
                let (result, termination) = self
                    .inner
                    .engine
                    .run_lookup_with_followup(
                        probe,
                        seeds,
                        query_for(probe),
                        stop_fn.clone(),
                        deadline,
                    )
                    .await;
                num_lookups += 1;
                if termination == Termination::DeadlineExceeded {
                    hit_deadline = true;
                }
                for peer in result.peers {
                    if seen.insert(peer) {
                        union.push(peer);
                    }
                }
            }
        }

        // Everything already in the local view counts toward the shell.
        let table_size: usize = self.inner.routing.bucket_populations().iter().sum();
        for peer in self.inner.routing.closest_local(target, table_size) {
            if seen.insert(peer) {
                union.push(peer);
            }
        }

        let mut peers: Vec<PeerId> = union
            .into_iter()
            .filter(|peer| peer.keyspace_id().common_prefix_len(target) >= min_cpl)
            .collect();
        peers.sort_by(|a, b| {
            distance_cmp(
                &a.keyspace_id().distance(target),
                &b.keyspace_id().distance(target),
            )
        });
        (peers, num_lookups, hit_deadline)
    }

    // ========================================================================
    // Peer lookup
    // ========================================================================

    /// Resolve a peer's addresses, dialing toward it if necessary.
    ///
    /// Succeeds iff the peer was dialed during the lookup or a live (or
    /// recently live) connection exists.
    pub async fn find_peer(&self, id: PeerId) -> Result<AddrInfo, RoutingError> {
        debug!(peer = %id, "finding peer");

        if self.inner.network.connectedness(&id) == Connectedness::Connected {
            return Ok(self.inner.peer_addrs.addr_info(&id).await);
        }

        let target = id.keyspace_id();
        let query_fn = self.closest_peers_query_fn(target);
        let stop_fn: StopFn = {
            let dht = self.clone();
            Arc::new(move || dht.inner.network.connectedness(&id) == Connectedness::Connected)
        };
        let seeds = self.seeds_for(&target);
        let (result, _termination) = self
            .inner
            .engine
            .run_lookup_with_followup(target, seeds, query_fn, stop_fn, None)
            .await;
        self.note_refresh(&target, &result);

        let dialed_during_query = result
            .peers
            .iter()
            .position(|peer| *peer == id)
            .map(|i| {
                matches!(
                    result.states[i],
                    PeerState::Queried | PeerState::Waiting | PeerState::Unreachable
                )
            })
            .unwrap_or(false);

        let connectedness = self.inner.network.connectedness(&id);
        if dialed_during_query
            || connectedness == Connectedness::Connected
            || connectedness == Connectedness::CanConnect
        {
            Ok(self.inner.peer_addrs.addr_info(&id).await)
        } else {
            Err(RoutingError::NotFound)
        }
    }

    // ========================================================================
    // Eclipse detection
    // ========================================================================

    /// Test whether `peers` (ascending by distance to `key`'s keyspace id)
    /// look like an eclipsed neighborhood.
    pub async fn eclipse_detection(
        &self,
        key: &[u8],
        peers: &[PeerId],
    ) -> Result<Detection, RoutingError> {
        let hash = hash_id(key);
        self.detect_neighborhood(&hash, peers)
            .await
            .map_err(RoutingError::from)
    }

    async fn detect_neighborhood(
        &self,
        target: &KeyspaceId,
        peers: &[PeerId],
    ) -> Result<Detection, DetectorError> {
        let expected = self.inner.detector.sample_size();
        if peers.len() < expected {
            return Err(DetectorError::InsufficientPeers {
                expected,
                found: peers.len(),
            });
        }
        let netsize = self
            .network_size_with_retry()
            .await
            .map_err(|_| DetectorError::NoSizeEstimate)?;
        let ids: Vec<KeyspaceId> = peers.iter().map(|peer| peer.keyspace_id()).collect();
        self.inner.detector.evaluate(netsize, target, &ids)
    }

    /// Diagnostic detection after provider operations; never fails the host
    /// operation.
    async fn report_neighborhood(&self, target: &KeyspaceId, peers: &[PeerId], op: &str) {
        match self.detect_neighborhood(target, peers).await {
            Ok(detection) => {
                if detection.attack {
                    warn!(
                        op,
                        target = %log_id(target),
                        kl = detection.kl_divergence,
                        threshold = detection.threshold,
                        "possible eclipse attack on neighborhood"
                    );
                } else {
                    debug!(
                        op,
                        target = %log_id(target),
                        kl = detection.kl_divergence,
                        threshold = detection.threshold,
                        "no eclipse attack detected"
                    );
                }
            }
            Err(e) => {
                debug!(op, target = %log_id(target), error = %e, "eclipse detection unavailable");
            }
        }
    }

    async fn network_size_with_retry(&self) -> Result<f64, EstimateError> {
        match self.inner.estimator.network_size().await {
            Ok(netsize) => Ok(netsize),
            Err(_) => {
                self.inner.estimator.gather_data().await;
                self.inner.estimator.network_size().await
            }
        }
    }
}

fn deadline_elapsed(deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => Instant::now() >= deadline,
        None => false,
    }
}

fn try_add_provider(
    found: &Arc<Mutex<HashSet<PeerId>>>,
    peer: PeerId,
    count: usize,
    find_all: bool,
) -> bool {
    let mut found = found.lock();
    if found.contains(&peer) {
        return false;
    }
    if find_all || found.len() < count {
        found.insert(peer);
        return true;
    }
    false
}

fn log_key(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(8)])
}

fn log_id(id: &KeyspaceId) -> String {
    hex::encode(&id.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_cpl_matches_expected_populations() {
        // 960 peers, shells of 30: ceil(log2(32)) - 1 = 4.
        assert_eq!(min_cpl_for_network(960.0, 30), 4);
        // A shell the size of the whole network floors at zero.
        assert_eq!(min_cpl_for_network(30.0, 30), 0);
        assert_eq!(min_cpl_for_network(10.0, 30), 0);
        // Larger networks widen less.
        assert_eq!(min_cpl_for_network(61_440.0, 30), 10);
    }

    #[test]
    fn config_defaults_mirror_constants() {
        let config = DhtConfig::default();
        assert_eq!(config.bucket_size, DEFAULT_BUCKET_SIZE);
        assert_eq!(config.alpha, DEFAULT_ALPHA);
        assert_eq!(
            config.special_provide_number,
            DEFAULT_SPECIAL_PROVIDE_NUMBER
        );
        assert_eq!(config.eclipse_detection_k, DEFAULT_ECLIPSE_DETECTION_K);
        assert_eq!(config.default_quorum, DEFAULT_QUORUM);
        assert!(config.enable_values);
        assert!(config.enable_providers);
    }
}
