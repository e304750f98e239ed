//! In-memory gossip engine
//!
//! Members share a [`GossipNetwork`]. Each member keeps a view (the set of
//! member names it knows about); joining merges views and every member that
//! learns about someone new receives a `Join` event for them. Leaving,
//! failing, reaping and tag updates fan out to the members that know the
//! subject. There is no failure detector: failures are injected with
//! [`GossipNetwork::fail`].

use crate::common::{Error, Result};
use crate::engine::{EventHandler, GossipEngine, GossipEvent, Member, MemberEventKind, MemberStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PeerSlot {
    member: Member,
    view: BTreeSet<String>,
    tx: mpsc::UnboundedSender<GossipEvent>,
}

impl PeerSlot {
    fn deliver(&self, event: GossipEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(member = %self.member.name, "gossip event dropped, member stopped");
        }
    }
}

/// Shared medium for [`MemoryGossip`] members
#[derive(Default)]
pub struct GossipNetwork {
    peers: Mutex<BTreeMap<String, PeerSlot>>,
    /// Failed members awaiting reap, with the members that saw them fail.
    failed: Mutex<BTreeMap<String, (Member, Vec<String>)>>,
}

impl GossipNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn peers(&self) -> MutexGuard<'_, BTreeMap<String, PeerSlot>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, member: Member, tx: mpsc::UnboundedSender<GossipEvent>) -> Result<()> {
        let mut peers = self.peers();
        if peers.contains_key(&member.name) {
            return Err(Error::Gossip(format!("member {} already running", member.name)));
        }
        if peers.values().any(|p| p.member.addr == member.addr) {
            return Err(Error::Gossip(format!("address {} already in use", member.addr)));
        }
        let slot = PeerSlot {
            member: member.clone(),
            view: BTreeSet::from([member.name.clone()]),
            tx,
        };
        slot.deliver(GossipEvent::member(MemberEventKind::Join, vec![member.clone()]));
        peers.insert(member.name, slot);
        Ok(())
    }

    /// Merge the views of `name` and the member listening on `target_addr`.
    fn merge(&self, name: &str, target_addr: &str) -> bool {
        let mut peers = self.peers();
        let Some(target) = peers
            .values()
            .find(|p| p.member.addr == target_addr)
            .map(|p| p.member.name.clone())
        else {
            return false;
        };
        let (Some(own), Some(theirs)) = (peers.get(name), peers.get(&target)) else {
            return false;
        };
        let union: BTreeSet<String> = own.view.union(&theirs.view).cloned().collect();
        let known: BTreeMap<String, Member> = union
            .iter()
            .filter_map(|n| peers.get(n).map(|p| (n.clone(), p.member.clone())))
            .collect();

        for n in &union {
            let Some(slot) = peers.get_mut(n) else {
                continue;
            };
            let fresh: Vec<Member> = union
                .difference(&slot.view)
                .filter_map(|m| known.get(m).cloned())
                .collect();
            if !fresh.is_empty() {
                slot.deliver(GossipEvent::member(MemberEventKind::Join, fresh));
            }
            slot.view = union.clone();
        }
        true
    }

    fn depart(
        &self,
        name: &str,
        kind: MemberEventKind,
        status: MemberStatus,
    ) -> Option<(Member, Vec<String>)> {
        let mut peers = self.peers();
        let slot = peers.remove(name)?;
        let mut member = slot.member;
        member.status = status;
        let mut observers = Vec::new();
        for other in slot.view.iter().filter(|n| n.as_str() != name) {
            if let Some(peer) = peers.get_mut(other) {
                peer.view.remove(name);
                peer.deliver(GossipEvent::member(kind, vec![member.clone()]));
                observers.push(other.clone());
            }
        }
        Some((member, observers))
    }

    fn leave(&self, name: &str) {
        self.depart(name, MemberEventKind::Leave, MemberStatus::Left);
    }

    /// Simulate `name` crashing: its peers see it as failed.
    pub fn fail(&self, name: &str) -> bool {
        match self.depart(name, MemberEventKind::Failed, MemberStatus::Failed) {
            Some(entry) => {
                self.failed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), entry);
                true
            }
            None => false,
        }
    }

    /// Drop a failed member for good, telling whoever saw it fail.
    pub fn reap(&self, name: &str) -> bool {
        let Some((member, observers)) = self
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
        else {
            return false;
        };
        let peers = self.peers();
        for observer in observers {
            if let Some(peer) = peers.get(&observer) {
                peer.deliver(GossipEvent::member(MemberEventKind::Reap, vec![member.clone()]));
            }
        }
        true
    }

    fn update(&self, name: &str, tags: BTreeMap<String, String>) -> Option<Member> {
        let mut peers = self.peers();
        let slot = peers.get_mut(name)?;
        slot.member.tags = tags;
        let member = slot.member.clone();
        let view = slot.view.clone();
        for n in view {
            if let Some(peer) = peers.get(&n) {
                peer.deliver(GossipEvent::member(MemberEventKind::Update, vec![member.clone()]));
            }
        }
        Some(member)
    }

    /// Names currently registered, sorted.
    pub fn member_names(&self) -> Vec<String> {
        self.peers().keys().cloned().collect()
    }
}

/// In-memory [`GossipEngine`]
pub struct MemoryGossip {
    network: Arc<GossipNetwork>,
    local: Mutex<Member>,
    handler: Arc<Mutex<Option<Arc<dyn EventHandler>>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryGossip {
    pub fn new(network: Arc<GossipNetwork>, local: Member) -> Self {
        Self {
            network,
            local: Mutex::new(local),
            handler: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            dispatch: Mutex::new(None),
        }
    }

    fn name(&self) -> String {
        self.local_member().name
    }

    /// Replace the local member's tags and broadcast an update.
    pub fn set_tags(&self, tags: BTreeMap<String, String>) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(Error::Gossip("gossip engine not running".into()));
        }
        let name = self.name();
        let member = self
            .network
            .update(&name, tags)
            .ok_or_else(|| Error::Gossip(format!("member {} not registered", name)))?;
        *self.local.lock().unwrap_or_else(PoisonError::into_inner) = member;
        Ok(())
    }
}

#[async_trait]
impl GossipEngine for MemoryGossip {
    fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Gossip("gossip engine already shut down".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Gossip("gossip engine already started".into()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self.network.register(self.local_member(), tx) {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        let name = self.name();
        let dispatch = tokio::spawn(async move {
            loop {
                // no event is handed out once shutdown has been requested
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let current = handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
                match current {
                    Some(handler) => handler.handle_event(event).await,
                    None => tracing::warn!(member = %name, ?event, "no gossip handler registered"),
                }
            }
            tracing::debug!(member = %name, "gossip dispatch stopped");
        });
        *self.dispatch.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatch);

        tracing::info!(member = %self.name(), "gossip engine started");
        Ok(())
    }

    async fn join(&self, addresses: &[String], _ignore_old: bool) -> Result<usize> {
        if !self.started.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(Error::Gossip("gossip engine not running".into()));
        }
        let local = self.local_member();
        let contacted = addresses
            .iter()
            .filter(|addr| **addr != local.addr)
            .filter(|addr| self.network.merge(&local.name, addr))
            .count();
        if contacted == 0 && !addresses.is_empty() {
            return Err(Error::Gossip(format!(
                "none of {:?} could be reached",
                addresses
            )));
        }
        Ok(contacted)
    }

    fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        if self.started.load(Ordering::SeqCst) {
            self.network.leave(&self.name());
        }
        self.shutdown.cancel();
        // wait out an event that is still being handled
        let dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatch) = dispatch {
            if let Err(e) = dispatch.await {
                tracing::warn!(member = %self.name(), error = %e, "gossip dispatch task failed");
            }
        }
        tracing::info!(member = %self.name(), "gossip engine stopped");
        Ok(())
    }

    fn local_member(&self) -> Member {
        self.local.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
