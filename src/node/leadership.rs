//! Leadership tracking
//!
//! Mirrors the consensus engine's leadership notifications into a flag that
//! the membership bridge and the request router can read cheaply. The flag is
//! advisory: it may lag a real leadership change, and it starts as follower
//! until the engine says otherwise.

use crate::common::Result;
use crate::engine::LeaderNotify;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Cloneable handle onto the node's leadership flag
#[derive(Clone, Default)]
pub struct LeadershipTracker {
    leader: Arc<AtomicBool>,
}

impl LeadershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> Role {
        if self.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    fn observe(&self, leader: bool) {
        let previous = self.leader.swap(leader, Ordering::SeqCst);
        if previous == leader {
            tracing::debug!(role = %self.role(), "leadership notification without change");
        } else if leader {
            tracing::info!("became raft leader");
        } else {
            tracing::info!("lost raft leadership");
        }
    }

    /// Follow `notify` until `shutdown` is cancelled. A closed channel keeps the
    /// last observed role.
    pub async fn run(self, mut notify: LeaderNotify, shutdown: CancellationToken) -> Result<()> {
        let mut open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                update = notify.recv(), if open => match update {
                    Some(leader) => self.observe(leader),
                    None => {
                        tracing::debug!(role = %self.role(), "leadership channel closed");
                        open = false;
                    }
                },
            }
        }
        tracing::info!("leadership monitor stopped");
        Ok(())
    }
}
