//! In-memory consensus engine
//!
//! A small, single-process stand-in for a Raft library. Engines find each
//! other through a shared [`RaftNetwork`] keyed by consensus address. The
//! leader is chosen explicitly ([`MemoryRaft::bootstrap`],
//! [`MemoryRaft::campaign`]) rather than elected by timeouts, which keeps
//! tests deterministic. What it does model faithfully is what the node
//! depends on:
//!
//! - only the leader accepts entries and voter changes
//! - an entry commits once a majority of voters hold it, in a single total order
//! - followers reject entries from a stale term
//! - followers apply only what the leader reports as committed
//! - a candidate needs votes from a majority whose logs are no newer than its own
//! - a follower drops an uncommitted suffix that conflicts with the leader's log
//! - a voter added later catches up by replaying the log from the last matching index
//! - a state machine failure halts the replica for good

use crate::common::{Error, Result};
use crate::engine::{ConsensusEngine, LeaderNotify, StateMachine};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Registry through which in-memory engines reach each other
#[derive(Default)]
pub struct RaftNetwork {
    nodes: Mutex<HashMap<String, Weak<RaftInner>>>,
    isolated: Mutex<HashSet<String>>,
}

impl RaftNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cut `address` off from every other engine.
    pub fn isolate(&self, address: &str) {
        self.isolated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.isolated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    fn register(&self, address: &str, node: Weak<RaftInner>) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        if nodes.get(address).and_then(Weak::upgrade).is_some() {
            return Err(Error::Consensus(format!(
                "address {} already in use",
                address
            )));
        }
        nodes.insert(address.to_string(), node);
        Ok(())
    }

    fn deregister(&self, address: &str) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    /// Resolve `to` as seen from `from`, honouring isolation.
    fn peer(&self, from: &str, to: &str) -> Option<Arc<RaftInner>> {
        {
            let isolated = self.isolated.lock().unwrap_or_else(PoisonError::into_inner);
            if isolated.contains(from) || isolated.contains(to) {
                return None;
            }
        }
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .and_then(Weak::upgrade)
    }
}

#[derive(Debug)]
enum Reject {
    StaleTerm(u64),
    Mismatch(u64),
    Conflict(u64),
    Halted,
    Down,
}

impl std::fmt::Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reject::StaleTerm(term) => write!(f, "stale term, peer is at term {}", term),
            Reject::Mismatch(index) => write!(f, "peer log does not match at index {}", index),
            Reject::Conflict(index) => {
                write!(f, "peer already applied a different entry at index {}", index)
            }
            Reject::Halted => write!(f, "peer replica halted"),
            Reject::Down => write!(f, "peer shut down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    term: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct RaftState {
    leader: bool,
    term: u64,
    leader_addr: Option<String>,
    /// id -> consensus address
    voters: BTreeMap<String, String>,
    config_index: u64,
    /// Entry at index `i` is `log[i - 1]`.
    log: Vec<Entry>,
    applied: u64,
    halted: Option<String>,
    shutdown: bool,
}

struct RaftInner {
    id: String,
    address: String,
    network: Arc<RaftNetwork>,
    fsm: Arc<dyn StateMachine>,
    state: Mutex<RaftState>,
    /// Serializes log appends and configuration changes on the leader.
    write_lock: tokio::sync::Mutex<()>,
    notify_tx: mpsc::UnboundedSender<bool>,
    notify_rx: Mutex<Option<LeaderNotify>>,
}

impl RaftInner {
    fn state(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_leader(&self, st: &mut RaftState, leader: bool) {
        if st.leader == leader {
            return;
        }
        st.leader = leader;
        if self.notify_tx.send(leader).is_err() {
            tracing::debug!(node = %self.id, leader, "no leadership subscriber");
        }
    }

    /// Adopt `term`/`leader_addr` if they are at least as new as ours.
    fn observe_leader(
        &self,
        st: &mut RaftState,
        term: u64,
        leader_addr: &str,
    ) -> std::result::Result<(), Reject> {
        if st.shutdown {
            return Err(Reject::Down);
        }
        if term < st.term {
            return Err(Reject::StaleTerm(st.term));
        }
        if term > st.term || st.leader_addr.as_deref() != Some(leader_addr) {
            st.term = term;
            st.leader_addr = Some(leader_addr.to_string());
            if leader_addr != self.address {
                self.set_leader(st, false);
            }
        }
        Ok(())
    }

    /// Apply every stored entry past `applied`, up to `upto`.
    fn apply_committed(&self, st: &mut RaftState, upto: u64) -> Result<()> {
        if let Some(reason) = &st.halted {
            return Err(Error::Consensus(format!("replica halted: {}", reason)));
        }
        while st.applied < upto {
            let index = st.applied + 1;
            let data = &st.log[(index - 1) as usize].data;
            if let Err(e) = self.fsm.apply(index, data) {
                tracing::error!(node = %self.id, index, error = %e, "state machine failed, halting replica");
                st.halted = Some(e.to_string());
                return Err(e);
            }
            st.applied = index;
        }
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.state().log.len() as u64
    }

    /// `(current term, last log term, last log index)`
    fn log_position(&self) -> (u64, u64, u64) {
        let st = self.state();
        let last_term = st.log.last().map_or(0, |e| e.term);
        (st.term, last_term, st.log.len() as u64)
    }

    fn entry_terms(&self) -> Vec<u64> {
        self.state().log.iter().map(|e| e.term).collect()
    }

    /// Follower side of replication. `entries` follow `prev_index`, which must
    /// hold an entry of `prev_term`. Everything up to `leader_commit` is applied.
    fn append(
        &self,
        term: u64,
        leader_addr: &str,
        prev_index: u64,
        prev_term: u64,
        entries: &[Entry],
        leader_commit: u64,
    ) -> std::result::Result<u64, Reject> {
        let mut st = self.state();
        self.observe_leader(&mut st, term, leader_addr)?;
        if st.halted.is_some() {
            return Err(Reject::Halted);
        }
        if prev_index > 0
            && st.log.get(prev_index as usize - 1).map(|e| e.term) != Some(prev_term)
        {
            return Err(Reject::Mismatch(prev_index));
        }
        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            match st.log.get(index as usize - 1).map(|e| e.term) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    if index <= st.applied {
                        return Err(Reject::Conflict(index));
                    }
                    tracing::warn!(node = %self.id, index, "dropping conflicting log suffix");
                    st.log.truncate(index as usize - 1);
                    st.log.push(entry.clone());
                }
                None => st.log.push(entry.clone()),
            }
        }
        let commit = leader_commit.min(st.log.len() as u64);
        self.apply_committed(&mut st, commit).map_err(|_| Reject::Halted)?;
        Ok(st.log.len() as u64)
    }

    fn accept_config(
        &self,
        term: u64,
        leader_addr: &str,
        voters: &BTreeMap<String, String>,
        config_index: u64,
    ) -> std::result::Result<(), Reject> {
        let mut st = self.state();
        self.observe_leader(&mut st, term, leader_addr)?;
        st.voters = voters.clone();
        st.config_index = config_index;
        Ok(())
    }

    /// Bring `peer` in line with our log from the last index both agree on,
    /// and tell it how far we have committed.
    fn sync_peer(&self, peer: &RaftInner, term: u64) -> std::result::Result<u64, Reject> {
        let theirs = peer.entry_terms();
        let (prev, prev_term, tail, commit) = {
            let st = self.state();
            let prev = st
                .log
                .iter()
                .zip(&theirs)
                .take_while(|(ours, their_term)| ours.term == **their_term)
                .count();
            let prev_term = prev.checked_sub(1).map_or(0, |i| st.log[i].term);
            (prev as u64, prev_term, st.log[prev..].to_vec(), st.applied)
        };
        peer.append(term, &self.address, prev, prev_term, &tail, commit)
    }

    fn reachable_peers(&self, voters: &BTreeMap<String, String>) -> Vec<Arc<RaftInner>> {
        voters
            .values()
            .filter(|addr| addr.as_str() != self.address)
            .filter_map(|addr| self.network.peer(&self.address, addr))
            .collect()
    }

    fn not_leader(&self, st: &RaftState) -> Error {
        Error::NotLeader(
            st.leader_addr
                .clone()
                .filter(|addr| addr != &self.address)
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }
}

/// In-memory [`ConsensusEngine`]
pub struct MemoryRaft {
    inner: Arc<RaftInner>,
}

impl MemoryRaft {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        network: Arc<RaftNetwork>,
        fsm: Arc<dyn StateMachine>,
    ) -> Result<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RaftInner {
            id: id.into(),
            address: address.into(),
            network: network.clone(),
            fsm,
            state: Mutex::new(RaftState::default()),
            write_lock: tokio::sync::Mutex::new(()),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        });
        network.register(&inner.address, Arc::downgrade(&inner))?;
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Form a single-voter group led by this node.
    pub fn bootstrap(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state();
        if !st.voters.is_empty() {
            return Err(Error::Consensus("cluster already bootstrapped".into()));
        }
        st.voters.insert(inner.id.clone(), inner.address.clone());
        st.term += 1;
        st.leader_addr = Some(inner.address.clone());
        inner.set_leader(&mut st, true);
        tracing::info!(node = %inner.id, term = st.term, "bootstrapped cluster");
        Ok(())
    }

    /// Take over leadership at a term above every reachable voter's.
    ///
    /// A reachable voter grants its vote only when the candidate's log is at
    /// least as recent as its own, compared by last term and then length.
    pub fn campaign(&self) -> Result<u64> {
        let inner = &self.inner;
        let voters = {
            let st = inner.state();
            if st.shutdown {
                return Err(Error::Shutdown);
            }
            if !st.voters.contains_key(&inner.id) {
                return Err(Error::Consensus(format!("{} is not a voter", inner.id)));
            }
            st.voters.clone()
        };
        let peers = inner.reachable_peers(&voters);
        let majority = voters.len() / 2 + 1;
        if peers.len() + 1 < majority {
            return Err(Error::Consensus("no quorum for election".into()));
        }
        let (_, last_term, last_index) = inner.log_position();
        let mut votes = 1;
        let mut highest = 0;
        for peer in &peers {
            let (peer_term, peer_last_term, peer_last_index) = peer.log_position();
            highest = highest.max(peer_term);
            if (peer_last_term, peer_last_index) <= (last_term, last_index) {
                votes += 1;
            } else {
                tracing::debug!(node = %inner.id, peer = %peer.id, "vote refused, peer log is newer");
            }
        }
        if votes < majority {
            return Err(Error::Consensus(format!(
                "election lost: {} of {} votes, log is behind",
                votes,
                voters.len()
            )));
        }
        let term = {
            let mut st = inner.state();
            st.term = st.term.max(highest) + 1;
            st.leader_addr = Some(inner.address.clone());
            inner.set_leader(&mut st, true);
            st.term
        };
        for peer in &peers {
            if let Err(reject) = inner.sync_peer(peer, term) {
                tracing::warn!(node = %inner.id, peer = %peer.id, %reject, "peer refused new leader");
            }
        }
        tracing::info!(node = %inner.id, term, "won leadership");
        Ok(term)
    }

    pub fn step_down(&self) {
        let mut st = self.inner.state();
        self.inner.set_leader(&mut st, false);
    }

    pub fn term(&self) -> u64 {
        self.inner.state().term
    }

    pub fn last_index(&self) -> u64 {
        self.inner.last_index()
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.state().applied
    }

    pub fn voters(&self) -> BTreeMap<String, String> {
        self.inner.state().voters.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.inner.state().halted.is_some()
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(timeout, fut).await?
    }
}

#[async_trait]
impl ConsensusEngine for MemoryRaft {
    fn take_leader_notify(&self) -> Option<LeaderNotify> {
        self.inner
            .notify_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<()> {
        let inner = &self.inner;
        bounded(timeout, async {
            let _write = inner.write_lock.lock().await;
            let (term, voters, config_index) = {
                let mut st = inner.state();
                if st.shutdown {
                    return Err(Error::Shutdown);
                }
                if !st.leader {
                    return Err(inner.not_leader(&st));
                }
                if prev_index != 0 && prev_index != st.config_index {
                    return Err(Error::Consensus(format!(
                        "configuration changed: expected index {}, at {}",
                        prev_index, st.config_index
                    )));
                }
                if st.voters.get(id).map(String::as_str) == Some(address) {
                    tracing::debug!(node = %inner.id, voter = %id, "voter already present");
                    return Ok(());
                }
                st.voters.insert(id.to_string(), address.to_string());
                st.config_index = st.log.len() as u64;
                (st.term, st.voters.clone(), st.config_index)
            };

            for peer in inner.reachable_peers(&voters) {
                let synced = peer
                    .accept_config(term, &inner.address, &voters, config_index)
                    .and_then(|_| inner.sync_peer(&peer, term));
                if let Err(reject) = synced {
                    tracing::warn!(node = %inner.id, peer = %peer.id, %reject, "could not sync voter");
                }
            }
            tracing::info!(node = %inner.id, voter = %id, %address, "added voter");
            Ok(())
        })
        .await
    }

    async fn apply(&self, entry: Vec<u8>, timeout: Duration) -> Result<u64> {
        let inner = &self.inner;
        bounded(timeout, async {
            let _write = inner.write_lock.lock().await;
            let (term, voters) = {
                let st = inner.state();
                if st.shutdown {
                    return Err(Error::Shutdown);
                }
                if let Some(reason) = &st.halted {
                    return Err(Error::Consensus(format!("replica halted: {}", reason)));
                }
                if !st.leader {
                    return Err(inner.not_leader(&st));
                }
                (st.term, st.voters.clone())
            };

            // Nothing is appended anywhere unless a majority can take it.
            let majority = voters.len() / 2 + 1;
            let peers = inner.reachable_peers(&voters);
            if peers.len() + 1 < majority {
                return Err(Error::Consensus(format!(
                    "quorum unavailable: {} of {} voters reachable",
                    peers.len() + 1,
                    voters.len()
                )));
            }
            if let Some(newer) = peers.iter().map(|p| p.state().term).find(|t| *t > term) {
                let mut st = inner.state();
                st.term = newer;
                inner.set_leader(&mut st, false);
                return Err(inner.not_leader(&st));
            }

            let index = {
                let mut st = inner.state();
                st.log.push(Entry { term, data: entry });
                st.log.len() as u64
            };

            let mut acks = 1;
            for peer in &peers {
                match inner.sync_peer(peer, term) {
                    Ok(_) => acks += 1,
                    Err(Reject::StaleTerm(newer)) => {
                        let mut st = inner.state();
                        st.term = st.term.max(newer);
                        inner.set_leader(&mut st, false);
                        return Err(inner.not_leader(&st));
                    }
                    Err(reject) => {
                        tracing::warn!(node = %inner.id, peer = %peer.id, %reject, "replication failed")
                    }
                }
            }
            if acks < majority {
                return Err(Error::Consensus(format!(
                    "entry {} not acknowledged by a majority",
                    index
                )));
            }

            inner.apply_committed(&mut inner.state(), index)?;
            for peer in &peers {
                if let Err(reject) = inner.sync_peer(peer, term) {
                    tracing::debug!(node = %inner.id, peer = %peer.id, %reject, "commit not delivered");
                }
            }
            Ok(index)
        })
        .await
    }

    fn is_leader(&self) -> bool {
        let st = self.inner.state();
        st.leader && !st.shutdown
    }

    fn leader_address(&self) -> Option<String> {
        self.inner.state().leader_addr.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut st = inner.state();
            if st.shutdown {
                return Ok(());
            }
            st.shutdown = true;
            inner.set_leader(&mut st, false);
        }
        inner.network.deregister(&inner.address);
        tracing::info!(node = %inner.id, "consensus engine stopped");
        Ok(())
    }
}
