//! A single quorumkv node
//!
//! Gossip tells the node who is in the cluster, Raft decides what is in the
//! store. The pieces in between:
//! - [`metadata`]: registry of known members and their Raft addresses
//! - [`leadership`]: local view of whether this node leads
//! - [`membership`]: gossip events to metadata updates and voter additions
//! - [`fsm`]: the replicated table/row/column store
//! - [`router`] and [`http`]: the client-facing API
//! - [`server`]: startup, supervision and ordered teardown

pub mod admission;
pub mod fsm;
pub mod http;
pub mod leadership;
pub mod membership;
pub mod metadata;
pub mod router;
pub mod server;
pub mod supervisor;

pub use fsm::{KvStateMachine, LogEntry, Row};
pub use leadership::{LeadershipTracker, Role};
pub use metadata::{MetadataStore, NodeRecord, NodeStatus, RAFT_ADDR_TAG};
pub use router::{NodeStatusView, RequestRouter};
pub use server::Node;
