//! Interfaces to the consensus and gossip engines
//!
//! The node never talks to Raft or to the gossip layer directly: it goes
//! through [`ConsensusEngine`] and [`GossipEngine`]. Both traits carry only
//! what the coordination layer needs. In-memory implementations live in
//! [`memory_raft`] and [`memory_gossip`].

pub mod memory_gossip;
pub mod memory_raft;

pub use memory_gossip::{GossipNetwork, MemoryGossip};
pub use memory_raft::{MemoryRaft, RaftNetwork};

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receiving side of the leadership notification channel (`true` = became leader).
pub type LeaderNotify = mpsc::UnboundedReceiver<bool>;

/// Consensus engine surface used by the node.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Hand out the leadership notification channel. Single subscriber: every
    /// call after the first returns `None`.
    fn take_leader_notify(&self) -> Option<LeaderNotify>;

    /// Add a voter to the group. Adding a voter that is already present with
    /// the same address is a no-op. `prev_index == 0` means unconditional.
    async fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<()>;

    /// Submit an entry; resolves with its log index once committed and applied.
    async fn apply(&self, entry: Vec<u8>, timeout: Duration) -> Result<u64>;

    /// Instantaneous and possibly stale.
    fn is_leader(&self) -> bool;

    /// Consensus address of the leader as last known by this node.
    fn leader_address(&self) -> Option<String>;

    async fn shutdown(&self) -> Result<()>;
}

/// State machine driven by committed log entries.
pub trait StateMachine: Send + Sync {
    /// Apply the committed entry at `index`. An error here means this replica
    /// can no longer follow the log.
    fn apply(&self, index: u64, data: &[u8]) -> Result<()>;
}

/// Gossip engine surface used by the node.
#[async_trait]
pub trait GossipEngine: Send + Sync {
    fn register_event_handler(&self, handler: Arc<dyn EventHandler>);

    async fn start(&self) -> Result<()>;

    /// Join an existing cluster through any of `addresses`. Returns how many
    /// of them were contacted. `ignore_old` skips replaying past user events.
    async fn join(&self, addresses: &[String], ignore_old: bool) -> Result<usize>;

    /// Cancelled once the engine has shut down.
    fn shutdown_signal(&self) -> CancellationToken;

    async fn shutdown(&self) -> Result<()>;

    fn local_member(&self) -> Member;
}

/// Receiver of gossip events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: GossipEvent);
}

/// Liveness of a member as seen by gossip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

/// A gossip member descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Gossip address
    pub addr: String,
    pub tags: BTreeMap<String, String>,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            tags: BTreeMap::new(),
            status: MemberStatus::Alive,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
    Reap,
    Update,
}

impl std::fmt::Display for MemberEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberEventKind::Join => write!(f, "member-join"),
            MemberEventKind::Leave => write!(f, "member-leave"),
            MemberEventKind::Failed => write!(f, "member-failed"),
            MemberEventKind::Reap => write!(f, "member-reap"),
            MemberEventKind::Update => write!(f, "member-update"),
        }
    }
}

/// Everything the gossip engine can deliver to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    Member {
        kind: MemberEventKind,
        members: Vec<Member>,
    },
    /// Custom broadcast; the node does not act on these.
    User { name: String, payload: Vec<u8> },
}

impl GossipEvent {
    pub fn member(kind: MemberEventKind, members: Vec<Member>) -> Self {
        GossipEvent::Member { kind, members }
    }
}
