//! Cluster member registry
//!
//! Stores one [`NodeRecord`] per member id, built from gossip member
//! descriptors. Records are never removed: a member that left or failed keeps
//! its record with the matching status, so a later re-join is a plain upsert.

use crate::common::{timestamp_now_millis, Error, Result};
use crate::engine::{Member, MemberStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Gossip tag carrying a member's consensus address
pub const RAFT_ADDR_TAG: &str = "raft_addr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Alive,
    Left,
    Failed,
}

impl From<MemberStatus> for NodeStatus {
    fn from(status: MemberStatus) -> Self {
        match status {
            MemberStatus::Alive | MemberStatus::Leaving => NodeStatus::Alive,
            MemberStatus::Left => NodeStatus::Left,
            MemberStatus::Failed => NodeStatus::Failed,
        }
    }
}

/// Identity of one cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub gossip_address: String,
    pub consensus_address: String,
    pub status: NodeStatus,
    pub updated_at: u64,
}

impl NodeRecord {
    /// Parse a gossip member descriptor.
    pub fn from_member(member: &Member) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedMember {
            member: member.name.clone(),
            reason: reason.to_string(),
        };
        if member.name.trim().is_empty() {
            return Err(malformed("empty member name"));
        }
        let consensus_address = member
            .tags
            .get(RAFT_ADDR_TAG)
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| malformed("missing raft_addr tag"))?;

        Ok(Self {
            id: member.name.clone(),
            gossip_address: member.addr.clone(),
            consensus_address: consensus_address.to_string(),
            status: member.status.into(),
            updated_at: timestamp_now_millis(),
        })
    }
}

/// Metadata store
#[derive(Default)]
pub struct MetadataStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `member` and upsert it. Nothing is written when parsing fails.
    pub fn add(&self, member: &Member) -> Result<NodeRecord> {
        let record = NodeRecord::from_member(member)?;
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn lookup(&self, id: &str) -> Option<NodeRecord> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Update the status of a known member. Returns false for unknown ids.
    pub fn mark(&self, id: &str, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(id) {
            Some(record) => {
                record.status = status;
                record.updated_at = timestamp_now_millis();
                true
            }
            None => false,
        }
    }

    /// All records, sorted by id
    pub fn members(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
