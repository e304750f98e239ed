//! Voter admission
//!
//! The single path through which this node asks the consensus engine to add
//! a voter. Both the gossip-driven bridge and the administrative join call
//! it; the leadership gate is applied by the bridge only.

use crate::common::Result;
use crate::engine::ConsensusEngine;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct VoterAdmission {
    consensus: Arc<dyn ConsensusEngine>,
    timeout: Duration,
}

impl VoterAdmission {
    pub fn new(consensus: Arc<dyn ConsensusEngine>, timeout: Duration) -> Self {
        Self { consensus, timeout }
    }

    /// Ask the engine to add `id` at `address`. Re-admitting a present voter is
    /// a no-op at the engine.
    pub async fn admit(&self, id: &str, address: &str) -> Result<()> {
        match self.consensus.add_voter(id, address, 0, self.timeout).await {
            Ok(()) => {
                tracing::info!(peer.id = %id, peer.remoteaddr = %address, "Peer joined Raft");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    peer.id = %id,
                    peer.remoteaddr = %address,
                    error = %e,
                    "Error joining peer to Raft"
                );
                Err(e)
            }
        }
    }
}
