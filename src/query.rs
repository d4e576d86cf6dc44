//! # Iterative Lookup Engine
//!
//! Best-first, α-parallel convergence on the k peers closest to a keyspace
//! target, followed by a confirmation pass ("follow-up") that re-queries any
//! top-k peer the main phase never reached directly.
//!
//! The engine is generic over a per-peer query function: value searches,
//! provider searches and plain closest-peer walks all reuse the same loop
//! and differ only in what the query function streams out as a side effect.
//!
//! Per-peer state machine: `Heard → Waiting → {Queried, Unreachable}`.
//! Terminal states never revert within one lookup. Per-peer transport errors
//! are isolated — one dead peer never fails the lookup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, trace};

use crate::capabilities::AddrInfo;
use crate::keyspace::{distance_cmp, Distance, KeyspaceId, PeerId};

/// Observation state of a peer within a single lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Referred to us by another peer; not yet dialed.
    Heard,
    /// A query to this peer is in flight.
    Waiting,
    /// Responded to a query.
    Queried,
    /// Failed to respond (transport error or per-query timeout).
    Unreachable,
}

/// Outcome of a lookup.
#[derive(Clone, Debug)]
pub struct LookupResult {
    /// Up to k peers, strictly ascending by distance to the target.
    pub peers: Vec<PeerId>,
    /// `states[i]` is the final main-phase state of `peers[i]`.
    pub states: Vec<PeerState>,
    /// True iff the lookup reached its natural termination condition, as
    /// opposed to being cut short by the stop predicate or a deadline.
    pub completed: bool,
}

impl LookupResult {
    fn empty(completed: bool) -> Self {
        Self {
            peers: Vec::new(),
            states: Vec::new(),
            completed,
        }
    }
}

/// Why the lookup stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The k closest known peers were all queried or unreachable and no
    /// closer candidate remained.
    Completed,
    /// The caller's stop predicate returned true.
    Stopped,
    /// The deadline expired; the result holds the best partial view.
    DeadlineExceeded,
}

/// Boxed future returned by a per-peer query.
pub type QueryFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<AddrInfo>>> + Send>>;

/// Per-peer query function: returns peers closer to the target and may
/// stream records or providers out through side channels.
pub type QueryFn = Arc<dyn Fn(PeerId) -> QueryFuture + Send + Sync>;

/// Stop predicate, polled between lookup events.
pub type StopFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct QueryPeerInfo {
    peer: PeerId,
    distance: Distance,
    state: PeerState,
}

/// Distance-ordered peer set for one lookup.
///
/// Kept sorted ascending by `(distance, peer)`; lexicographic peer id breaks
/// the (hash-collision-only) distance ties deterministically.
struct QueryPeers {
    target: KeyspaceId,
    peers: Vec<QueryPeerInfo>,
    index: HashMap<PeerId, usize>,
}

impl QueryPeers {
    fn new(target: KeyspaceId) -> Self {
        Self {
            target,
            peers: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add a newly heard peer. Returns false on duplicates.
    fn try_add(&mut self, peer: PeerId) -> bool {
        if self.index.contains_key(&peer) {
            return false;
        }
        let distance = peer.keyspace_id().distance(&self.target);
        let pos = self
            .peers
            .partition_point(|e| match distance_cmp(&e.distance, &distance) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => e.peer < peer,
                std::cmp::Ordering::Greater => false,
            });
        self.peers.insert(
            pos,
            QueryPeerInfo {
                peer,
                distance,
                state: PeerState::Heard,
            },
        );
        for (i, entry) in self.peers.iter().enumerate().skip(pos) {
            self.index.insert(entry.peer, i);
        }
        true
    }

    fn set_state(&mut self, peer: &PeerId, state: PeerState) {
        if let Some(&i) = self.index.get(peer) {
            self.peers[i].state = state;
        }
    }

    /// The closest peer still in `Heard`.
    fn closest_heard(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|e| e.state == PeerState::Heard)
            .map(|e| e.peer)
    }

    /// The n closest peers whose state is in `states`, ascending.
    fn closest_in_states(&self, n: usize, states: &[PeerState]) -> Vec<(PeerId, PeerState)> {
        self.peers
            .iter()
            .filter(|e| states.contains(&e.state))
            .take(n)
            .map(|e| (e.peer, e.state))
            .collect()
    }

    /// Natural-termination test: among the k closest peers that are heard,
    /// waiting or queried, none is still merely heard.
    fn lookup_terminated(&self, k: usize) -> bool {
        !self
            .closest_in_states(
                k,
                &[PeerState::Heard, PeerState::Waiting, PeerState::Queried],
            )
            .iter()
            .any(|(_, s)| *s == PeerState::Heard)
    }
}

/// The iterative lookup engine.
///
/// Owns only the tuning knobs; all collaborators arrive through the query
/// function, so one engine value serves every operation of the DHT.
pub(crate) struct LookupEngine {
    pub k: usize,
    pub alpha: usize,
    pub per_query_timeout: Duration,
    pub self_peer: PeerId,
}

impl LookupEngine {
    /// Run the main α-parallel search and the follow-up pass.
    ///
    /// `seeds` is the initial frontier (normally the k locally-known peers
    /// closest to the target). The engine never dials itself.
    pub async fn run_lookup_with_followup(
        &self,
        target: KeyspaceId,
        seeds: Vec<PeerId>,
        query_fn: QueryFn,
        stop_fn: StopFn,
        deadline: Option<Instant>,
    ) -> (LookupResult, Termination) {
        if let Some(dl) = deadline {
            if Instant::now() >= dl {
                return (LookupResult::empty(false), Termination::DeadlineExceeded);
            }
        }

        let mut qp = QueryPeers::new(target);
        for seed in seeds {
            if seed != self.self_peer {
                qp.try_add(seed);
            }
        }

        let (termination, mut result) = self
            .run_main_phase(&mut qp, &query_fn, &stop_fn, deadline)
            .await;

        result.completed = termination == Termination::Completed;
        if result.completed {
            let interrupted = self.run_followup(&result, &query_fn, &stop_fn, deadline).await;
            if interrupted {
                result.completed = false;
            }
        }

        debug!(
            target = hex::encode(&target.as_bytes()[..8]),
            found = result.peers.len(),
            completed = result.completed,
            termination = ?termination,
            "lookup finished"
        );
        (result, termination)
    }

    async fn run_main_phase(
        &self,
        qp: &mut QueryPeers,
        query_fn: &QueryFn,
        stop_fn: &StopFn,
        deadline: Option<Instant>,
    ) -> (Termination, LookupResult) {
        let mut join_set: JoinSet<(PeerId, anyhow::Result<Vec<AddrInfo>>)> = JoinSet::new();
        let termination = loop {
            if stop_fn() {
                break Termination::Stopped;
            }
            if qp.lookup_terminated(self.k) {
                break Termination::Completed;
            }

            while join_set.len() < self.alpha {
                let Some(next) = qp.closest_heard() else {
                    break;
                };
                qp.set_state(&next, PeerState::Waiting);
                trace!(peer = %next, "dispatching query");
                let fut = query_fn(next);
                let per_query = self.per_query_timeout;
                join_set.spawn(async move {
                    match timeout(per_query, fut).await {
                        Ok(res) => (next, res),
                        Err(_) => (next, Err(anyhow::anyhow!("query timed out"))),
                    }
                });
            }

            if join_set.is_empty() {
                // Nothing heard, nothing in flight: the frontier is spent.
                break Termination::Completed;
            }

            let joined = match deadline {
                Some(dl) => match timeout_at(dl, join_set.join_next()).await {
                    Ok(j) => j,
                    Err(_) => break Termination::DeadlineExceeded,
                },
                None => join_set.join_next().await,
            };

            match joined {
                Some(Ok((peer, Ok(closer)))) => {
                    qp.set_state(&peer, PeerState::Queried);
                    for info in closer {
                        if info.peer != self.self_peer {
                            qp.try_add(info.peer);
                        }
                    }
                }
                Some(Ok((peer, Err(e)))) => {
                    debug!(peer = %peer, error = %e, "peer unreachable during lookup");
                    qp.set_state(&peer, PeerState::Unreachable);
                }
                Some(Err(_)) | None => {}
            }
        };
        join_set.abort_all();

        let top = qp.closest_in_states(
            self.k,
            &[PeerState::Heard, PeerState::Waiting, PeerState::Queried],
        );
        let mut result = LookupResult::empty(false);
        for (peer, state) in top {
            result.peers.push(peer);
            result.states.push(state);
        }
        (termination, result)
    }

    /// Re-query every top-k peer the main phase left unqueried. Returns true
    /// when the pass was interrupted by the stop predicate or the deadline.
    async fn run_followup(
        &self,
        result: &LookupResult,
        query_fn: &QueryFn,
        stop_fn: &StopFn,
        deadline: Option<Instant>,
    ) -> bool {
        let pending: Vec<PeerId> = result
            .peers
            .iter()
            .zip(result.states.iter())
            .filter(|(_, s)| **s != PeerState::Queried)
            .map(|(p, _)| *p)
            .collect();
        if pending.is_empty() {
            return false;
        }
        if stop_fn() {
            return true;
        }

        trace!(count = pending.len(), "following up unqueried top peers");
        let mut join_set: JoinSet<()> = JoinSet::new();
        for peer in pending {
            let fut = query_fn(peer);
            let per_query = self.per_query_timeout;
            join_set.spawn(async move {
                let _ = timeout(per_query, fut).await;
            });
        }

        while !join_set.is_empty() {
            let joined = match deadline {
                Some(dl) => match timeout_at(dl, join_set.join_next()).await {
                    Ok(j) => j,
                    Err(_) => {
                        join_set.abort_all();
                        return true;
                    }
                },
                None => join_set.join_next().await,
            };
            if joined.is_none() {
                break;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    fn peer(n: u32) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        PeerId::from_bytes(bytes)
    }

    fn never_stop() -> StopFn {
        Arc::new(|| false)
    }

    /// A static network where every peer knows every other peer.
    fn full_mesh_query_fn(
        peers: Vec<PeerId>,
        failures: HashSet<PeerId>,
        log: Arc<Mutex<Vec<PeerId>>>,
    ) -> QueryFn {
        Arc::new(move |p: PeerId| {
            let peers = peers.clone();
            let failures = failures.clone();
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(p);
                if failures.contains(&p) {
                    anyhow::bail!("injected failure");
                }
                Ok(peers.into_iter().map(AddrInfo::bare).collect())
            })
        })
    }

    fn engine(k: usize, alpha: usize) -> LookupEngine {
        LookupEngine {
            k,
            alpha,
            per_query_timeout: Duration::from_secs(2),
            self_peer: peer(u32::MAX),
        }
    }

    fn true_closest(all: &[PeerId], target: &KeyspaceId, k: usize) -> Vec<PeerId> {
        let mut v = all.to_vec();
        v.sort_by(|a, b| {
            distance_cmp(
                &a.keyspace_id().distance(target),
                &b.keyspace_id().distance(target),
            )
        });
        v.truncate(k);
        v
    }

    #[tokio::test]
    async fn converges_on_true_closest_peers() {
        let all: Vec<PeerId> = (0..60).map(peer).collect();
        let target = crate::keyspace::hash_id(b"target");
        let log = Arc::new(Mutex::new(Vec::new()));
        let qf = full_mesh_query_fn(all.clone(), HashSet::new(), log);

        let eng = engine(8, 3);
        let seeds = vec![all[0], all[1]];
        let (res, term) = eng
            .run_lookup_with_followup(target, seeds, qf, never_stop(), None)
            .await;

        assert_eq!(term, Termination::Completed);
        assert!(res.completed);
        assert_eq!(res.peers, true_closest(&all, &target, 8));
        for pair in res.peers.windows(2) {
            let da = pair[0].keyspace_id().distance(&target);
            let db = pair[1].keyspace_id().distance(&target);
            assert_eq!(distance_cmp(&da, &db), std::cmp::Ordering::Less);
        }
    }

    #[tokio::test]
    async fn per_peer_failures_do_not_fail_the_lookup() {
        let all: Vec<PeerId> = (0..30).map(peer).collect();
        let target = crate::keyspace::hash_id(b"target");
        let mut failures = HashSet::new();
        failures.insert(all[3]);
        failures.insert(all[7]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let qf = full_mesh_query_fn(all.clone(), failures.clone(), log);

        let eng = engine(8, 3);
        let (res, term) = eng
            .run_lookup_with_followup(target, all.clone(), qf, never_stop(), None)
            .await;

        assert_eq!(term, Termination::Completed);
        for (p, s) in res.peers.iter().zip(res.states.iter()) {
            if failures.contains(p) {
                // Unreachable peers are excluded from the result set.
                panic!("unreachable peer {p} surfaced with state {s:?}");
            }
        }
    }

    #[tokio::test]
    async fn stop_predicate_marks_lookup_incomplete() {
        let all: Vec<PeerId> = (0..30).map(peer).collect();
        let target = crate::keyspace::hash_id(b"target");
        let log = Arc::new(Mutex::new(Vec::new()));
        let qf = full_mesh_query_fn(all.clone(), HashSet::new(), log.clone());

        let counter = log.clone();
        let stop: StopFn = Arc::new(move || counter.lock().len() >= 2);

        let eng = engine(8, 1);
        let (res, term) = eng
            .run_lookup_with_followup(target, all, qf, stop, None)
            .await;

        assert_eq!(term, Termination::Stopped);
        assert!(!res.completed);
    }

    #[tokio::test]
    async fn elapsed_deadline_short_circuits() {
        let all: Vec<PeerId> = (0..10).map(peer).collect();
        let target = crate::keyspace::hash_id(b"target");
        let log = Arc::new(Mutex::new(Vec::new()));
        let qf = full_mesh_query_fn(all.clone(), HashSet::new(), log.clone());

        let eng = engine(8, 3);
        let past = Instant::now() - Duration::from_millis(10);
        let (res, term) = eng
            .run_lookup_with_followup(target, all, qf, never_stop(), Some(past))
            .await;

        assert_eq!(term, Termination::DeadlineExceeded);
        assert!(!res.completed);
        assert!(res.peers.is_empty());
        assert!(log.lock().is_empty(), "no queries may be sent past deadline");
    }

    #[tokio::test]
    async fn followup_requeries_peers_left_waiting() {
        // One peer responds slowly; termination cuts it off in `Waiting`,
        // then the follow-up pass must dial it a second time.
        let all: Vec<PeerId> = (0..6).map(peer).collect();
        let target = crate::keyspace::hash_id(b"target");
        let slow = true_closest(&all, &target, 6)[5];
        let log = Arc::new(Mutex::new(Vec::new()));

        let qf: QueryFn = {
            let all = all.clone();
            let log = log.clone();
            Arc::new(move |p: PeerId| {
                let all = all.clone();
                let log = log.clone();
                Box::pin(async move {
                    log.lock().push(p);
                    if p == slow {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    Ok(all.into_iter().map(AddrInfo::bare).collect())
                })
            })
        };

        let eng = engine(6, 3);
        let (res, _) = eng
            .run_lookup_with_followup(target, all, qf, never_stop(), None)
            .await;

        assert!(res.completed);
        let dials = log.lock().iter().filter(|p| **p == slow).count();
        assert!(dials >= 2, "slow peer dialed {dials} times, want >= 2");
    }

    #[tokio::test]
    async fn empty_seed_set_completes_immediately() {
        let target = crate::keyspace::hash_id(b"target");
        let log = Arc::new(Mutex::new(Vec::new()));
        let qf = full_mesh_query_fn(Vec::new(), HashSet::new(), log);

        let eng = engine(8, 3);
        let (res, term) = eng
            .run_lookup_with_followup(target, Vec::new(), qf, never_stop(), None)
            .await;

        assert_eq!(term, Termination::Completed);
        assert!(res.completed);
        assert!(res.peers.is_empty());
    }

    #[tokio::test]
    async fn result_never_contains_self() {
        let mut eng = engine(8, 3);
        eng.self_peer = peer(1);
        let all: Vec<PeerId> = (0..10).map(peer).collect();
        let target = crate::keyspace::hash_id(b"target");
        let log = Arc::new(Mutex::new(Vec::new()));
        let qf = full_mesh_query_fn(all.clone(), HashSet::new(), log);

        let (res, _) = eng
            .run_lookup_with_followup(target, all, qf, never_stop(), None)
            .await;
        assert!(!res.peers.contains(&peer(1)));
    }
}
