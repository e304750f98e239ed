//! Client request routing
//!
//! Writes and joins go through the consensus engine; reads are served from
//! the local state machine without a consensus round trip, so a lagging
//! follower answers with data that is stale but consistent with its log.

use crate::common::{non_empty, Error, Result};
use crate::engine::ConsensusEngine;
use crate::node::admission::VoterAdmission;
use crate::node::fsm::{KvStateMachine, LogEntry, Row};
use crate::node::leadership::{LeadershipTracker, Role};
use crate::node::metadata::{MetadataStore, NodeRecord};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Point-in-time view of this node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusView {
    pub node_id: String,
    pub role: String,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub last_applied: u64,
    pub members: usize,
}

pub struct RequestRouter {
    node_id: String,
    fsm: Arc<KvStateMachine>,
    consensus: Arc<dyn ConsensusEngine>,
    leadership: LeadershipTracker,
    metadata: Arc<MetadataStore>,
    admission: VoterAdmission,
    apply_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        node_id: impl Into<String>,
        fsm: Arc<KvStateMachine>,
        consensus: Arc<dyn ConsensusEngine>,
        leadership: LeadershipTracker,
        metadata: Arc<MetadataStore>,
        admission: VoterAdmission,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            fsm,
            consensus,
            leadership,
            metadata,
            admission,
            apply_timeout,
        }
    }

    /// Replicate a single cell write. Returns the committed log index.
    ///
    /// There is no retry and no forwarding: a follower, a timeout, or a
    /// rejection by the engine all come back as [`Error::WriteFailed`].
    pub async fn write(&self, table: &str, row: &str, column: &str, value: &str) -> Result<u64> {
        let entry = LogEntry::set(
            non_empty("table", table)?,
            non_empty("row", row)?,
            non_empty("column", column)?,
            value,
        );

        if !self.leadership.is_leader() {
            return Err(Error::WriteFailed(format!(
                "not the leader, current leader is {}",
                self.leader_address().unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let bytes = entry.encode()?;
        let submitted = tokio::time::timeout(
            self.apply_timeout,
            self.consensus.apply(bytes, self.apply_timeout),
        )
        .await;
        match submitted {
            Ok(Ok(index)) => {
                tracing::debug!(table = %entry.table, row = %entry.row, column = %entry.column, index, "write committed");
                Ok(index)
            }
            Ok(Err(e)) => {
                tracing::warn!(table = %entry.table, row = %entry.row, error = %e, "write rejected");
                Err(Error::WriteFailed(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(table = %entry.table, row = %entry.row, timeout = ?self.apply_timeout, "write timed out");
                Err(Error::WriteFailed(format!(
                    "not committed within {:?}",
                    self.apply_timeout
                )))
            }
        }
    }

    /// Every column of `table/row` applied on this replica so far.
    pub fn read(&self, table: &str, row: &str) -> Result<Row> {
        self.fsm
            .get_by_row_key(table, row)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table, row)))
    }

    pub fn read_cell(&self, table: &str, row: &str, column: &str) -> Result<String> {
        self.fsm
            .get_cell(table, row, column)
            .ok_or_else(|| Error::NotFound(format!("{}/{}/{}", table, row, column)))
    }

    /// Administrative voter addition, not gated on the local leadership flag.
    /// An empty `candidate_id` defaults to the address.
    pub async fn join(&self, candidate_id: &str, candidate_address: &str) -> Result<()> {
        let address = non_empty("peer address", candidate_address.trim())?;
        let id = match candidate_id.trim() {
            "" => address,
            id => id,
        };
        self.admission.admit(id, address).await
    }

    pub fn leader_address(&self) -> Option<String> {
        self.consensus.leader_address()
    }

    pub fn members(&self) -> Vec<NodeRecord> {
        self.metadata.members()
    }

    pub fn status(&self) -> NodeStatusView {
        let role = self.leadership.role();
        NodeStatusView {
            node_id: self.node_id.clone(),
            role: role.to_string(),
            is_leader: role == Role::Leader,
            leader: self.leader_address(),
            last_applied: self.fsm.last_applied(),
            members: self.metadata.len(),
        }
    }
}
