//! Gossip membership bridge
//!
//! Turns gossip events into metadata updates on every node and, on the
//! leader only, into voter additions. Leave/failed/reap never remove a voter:
//! a member that merely looks dead during a partition may still be a live
//! voter.

use crate::engine::{EventHandler, GossipEvent, Member, MemberEventKind};
use crate::node::admission::VoterAdmission;
use crate::node::leadership::LeadershipTracker;
use crate::node::metadata::{MetadataStore, NodeStatus};
use async_trait::async_trait;
use std::sync::Arc;

pub struct MembershipBridge {
    metadata: Arc<MetadataStore>,
    leadership: LeadershipTracker,
    admission: VoterAdmission,
}

impl MembershipBridge {
    pub fn new(
        metadata: Arc<MetadataStore>,
        leadership: LeadershipTracker,
        admission: VoterAdmission,
    ) -> Self {
        Self {
            metadata,
            leadership,
            admission,
        }
    }

    async fn on_join(&self, members: &[Member]) {
        for member in members {
            let record = match self.metadata.add(member) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(member = ?member, error = %e, "Error processing metadata");
                    continue;
                }
            };
            if !self.leadership.is_leader() {
                tracing::info!(peer.id = %record.id, "Not the raft leader, skipping join");
                continue;
            }
            // Failures are logged by the admission path; the next gossip event
            // or a manual join retries.
            let _ = self
                .admission
                .admit(&record.id, &record.consensus_address)
                .await;
        }
    }

    fn on_departure(&self, kind: MemberEventKind, members: &[Member], status: NodeStatus) {
        for member in members {
            if !self.metadata.mark(&member.name, status) {
                tracing::debug!(member = %member.name, %kind, "departure of unknown member");
            }
        }
    }

    fn on_update(&self, members: &[Member]) {
        for member in members {
            if let Err(e) = self.metadata.add(member) {
                tracing::error!(member = ?member, error = %e, "Error processing metadata update");
            }
        }
    }
}

#[async_trait]
impl EventHandler for MembershipBridge {
    async fn handle_event(&self, event: GossipEvent) {
        let (kind, members) = match event {
            GossipEvent::Member { kind, members } => (kind, members),
            GossipEvent::User { name, .. } => {
                tracing::warn!(event = %name, "rejecting unhandled gossip user event");
                return;
            }
        };
        let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
        tracing::info!(%kind, members = ?names, "gossip membership event");

        match kind {
            MemberEventKind::Join => self.on_join(&members).await,
            MemberEventKind::Leave => self.on_departure(kind, &members, NodeStatus::Left),
            MemberEventKind::Failed => self.on_departure(kind, &members, NodeStatus::Failed),
            MemberEventKind::Reap => {
                tracing::debug!(members = ?names, "reaped members keep their records");
            }
            MemberEventKind::Update => self.on_update(&members),
        }
    }
}
