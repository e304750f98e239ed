//! # quorumkv
//!
//! A strongly-consistent key-value node that uses gossip for membership
//! discovery and Raft for replication:
//! - Members discovered by gossip are admitted as Raft voters by the leader
//! - Writes are replicated through the Raft log, reads are served locally
//! - Data is addressed as `table/row/column`
//!
//! ## Architecture
//!
//! ```text
//!        HTTP API (/key, /join, /health, /members)
//!                      │
//!               ┌──────▼───────┐
//!               │ RequestRouter│──── reads ───► KvStateMachine
//!               └──────┬───────┘                     ▲
//!                      │ apply / add_voter           │ committed entries
//!               ┌──────▼──────────┐                  │
//!               │ ConsensusEngine │──────────────────┘
//!               └──────▲──────────┘
//!                      │ add_voter (leader only)
//!             ┌────────┴─────────┐
//!             │ MembershipBridge │◄─── events ─── GossipEngine
//!             └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a seed node and a member
//! ```bash
//! quorumkv-node serve --id n1 --seed --http 127.0.0.1:8080 \
//!   --gossip 127.0.0.1:7946 --raft 127.0.0.1:9000
//! ```
//!
//! ### Run a local three node cluster
//! ```bash
//! quorumkv-node dev --nodes 3
//! ```
//!
//! ### Use the CLI
//! ```bash
//! quorumkv put users u1 email a@x.com
//! quorumkv get users u1
//! quorumkv status
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod engine;
pub mod node;

pub use common::{Error, NodeConfig, Result};
pub use node::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
