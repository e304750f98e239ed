//! Node server: wires the engines, the membership bridge and the HTTP API
//! together and supervises them until shutdown.

use crate::common::{Error, NodeConfig, Result};
use crate::engine::{
    ConsensusEngine, GossipEngine, GossipNetwork, Member, MemoryGossip, MemoryRaft, RaftNetwork,
};
use crate::node::admission::VoterAdmission;
use crate::node::fsm::KvStateMachine;
use crate::node::http::create_router;
use crate::node::leadership::LeadershipTracker;
use crate::node::membership::MembershipBridge;
use crate::node::metadata::{MetadataStore, RAFT_ADDR_TAG};
use crate::node::router::RequestRouter;
use crate::node::supervisor::Supervisor;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

enum Listen {
    Addr(SocketAddr),
    Bound(TcpListener),
}

pub struct Node {
    config: NodeConfig,
    consensus: Arc<dyn ConsensusEngine>,
    gossip: Arc<dyn GossipEngine>,
    fsm: Arc<KvStateMachine>,
    metadata: Arc<MetadataStore>,
    leadership: LeadershipTracker,
    router: Arc<RequestRouter>,
}

impl Node {
    /// Build the node around already constructed engines. The membership
    /// bridge is registered with the gossip engine here, before it starts.
    pub fn new(
        config: NodeConfig,
        consensus: Arc<dyn ConsensusEngine>,
        gossip: Arc<dyn GossipEngine>,
        fsm: Arc<KvStateMachine>,
    ) -> Self {
        let metadata = Arc::new(MetadataStore::new());
        let leadership = LeadershipTracker::new();
        let admission = VoterAdmission::new(consensus.clone(), config.reconfig_timeout());

        let bridge = MembershipBridge::new(metadata.clone(), leadership.clone(), admission.clone());
        gossip.register_event_handler(Arc::new(bridge));

        let router = Arc::new(RequestRouter::new(
            config.node_id.clone(),
            fsm.clone(),
            consensus.clone(),
            leadership.clone(),
            metadata.clone(),
            admission,
            config.apply_timeout(),
        ));

        Self {
            config,
            consensus,
            gossip,
            fsm,
            metadata,
            leadership,
            router,
        }
    }

    /// Build a node on the in-memory engines. Seed nodes bootstrap a
    /// single-voter group.
    pub fn in_memory(
        config: NodeConfig,
        raft_network: Arc<RaftNetwork>,
        gossip_network: Arc<GossipNetwork>,
    ) -> Result<Self> {
        let fsm = Arc::new(KvStateMachine::new());
        let raft = MemoryRaft::new(
            config.node_id.clone(),
            config.raft_addr.clone(),
            raft_network,
            fsm.clone(),
        )?;
        if config.is_seed {
            raft.bootstrap()?;
        }
        let local = Member::new(config.node_id.clone(), config.gossip_addr.clone())
            .with_tag(RAFT_ADDR_TAG, config.raft_addr.clone());
        let gossip = MemoryGossip::new(gossip_network, local);
        Ok(Self::new(config, Arc::new(raft), Arc::new(gossip), fsm))
    }

    pub fn router(&self) -> Arc<RequestRouter> {
        self.router.clone()
    }

    pub fn metadata(&self) -> Arc<MetadataStore> {
        self.metadata.clone()
    }

    pub fn leadership(&self) -> LeadershipTracker {
        self.leadership.clone()
    }

    pub fn fsm(&self) -> Arc<KvStateMachine> {
        self.fsm.clone()
    }

    /// Run until Ctrl-C or until a task fails.
    pub async fn serve(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `interrupt` resolves or until a task fails.
    pub async fn run_until<F>(self, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.http_addr;
        self.run(Listen::Addr(addr), interrupt).await
    }

    /// Same as [`Node::run_until`] with an HTTP listener bound by the caller.
    pub async fn run_with_listener<F>(self, listener: TcpListener, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.run(Listen::Bound(listener), interrupt).await
    }

    async fn run<F>(self, listen: Listen, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Node {
            config,
            consensus,
            gossip,
            leadership,
            router,
            ..
        } = self;

        tracing::info!("Starting node: {}", config.node_id);
        tracing::info!("  Gossip: {}", config.gossip_addr);
        tracing::info!("  Raft: {}", config.raft_addr);
        tracing::info!("  Seed: {}", config.is_seed);

        let notify = match prepare(&config).await {
            Ok(()) => consensus.take_leader_notify().ok_or_else(|| {
                Error::Internal("leadership notifications already taken".into())
            }),
            Err(e) => Err(e),
        };
        let notify = match notify {
            Ok(notify) => notify,
            Err(e) => {
                tracing::error!(error = %e, "node failed to start");
                if let Err(teardown) = teardown(gossip, consensus).await {
                    tracing::warn!(error = %teardown, "teardown after failed start");
                }
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let mut tasks = Supervisor::new(shutdown.clone());

        tasks.spawn("leadership", leadership.run(notify, shutdown.clone()));
        tasks.spawn(
            "gossip",
            run_gossip(
                gossip.clone(),
                config.is_seed,
                config.join_addrs.clone(),
                shutdown.clone(),
            ),
        );
        tasks.spawn("http", serve_http(listen, router, shutdown.clone()));

        let interrupted = shutdown.clone();
        tasks.spawn("interrupt", async move {
            tokio::select! {
                _ = interrupt => {
                    tracing::info!("interrupt received, shutting down");
                    interrupted.cancel();
                }
                _ = interrupted.cancelled() => {}
            }
            Ok(())
        });

        tasks.spawn_on_cancel("teardown", teardown(gossip, consensus));

        tracing::info!("Node ready: {}", config.node_id);

        match tasks.wait().await {
            Ok(()) => {
                tracing::info!("Clean shutdown");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Child workers returned an error");
                Err(e)
            }
        }
    }
}

async fn prepare(config: &NodeConfig) -> Result<()> {
    tokio::fs::create_dir_all(&config.gossip_data_dir).await?;
    tokio::fs::create_dir_all(&config.raft_data_dir).await?;
    Ok(())
}

/// Stop gossip first so no membership event reaches a stopped consensus
/// engine. Both are always attempted; the first error wins.
async fn teardown(gossip: Arc<dyn GossipEngine>, consensus: Arc<dyn ConsensusEngine>) -> Result<()> {
    let gossip_result = gossip.shutdown().await;
    if let Err(e) = &gossip_result {
        tracing::warn!(error = %e, "gossip shutdown failed");
    }
    let consensus_result = consensus.shutdown().await;
    if let Err(e) = &consensus_result {
        tracing::warn!(error = %e, "raft shutdown failed");
    }
    gossip_result.and(consensus_result)
}

async fn run_gossip(
    gossip: Arc<dyn GossipEngine>,
    is_seed: bool,
    join_addrs: Vec<String>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Err(e) = gossip.start().await {
        tracing::error!(error = %e, "gossip agent failed to start");
        return Err(e);
    }
    let local = gossip.local_member();
    tracing::info!(member = %local.name, address = %local.addr, "gossip agent started");

    if !is_seed {
        tracing::info!(peers = ?join_addrs, "joining gossip cluster");
        match gossip.join(&join_addrs, false).await {
            Ok(contacted) => tracing::info!(contacted, "joined gossip cluster"),
            Err(e) => tracing::warn!(error = %e, "could not join gossip cluster"),
        }
    }

    let stopped = gossip.shutdown_signal();
    tokio::select! {
        _ = stopped.cancelled() => {
            tracing::info!("gossip agent stopped, shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}

async fn serve_http(
    listen: Listen,
    router: Arc<RequestRouter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = match listen {
        Listen::Bound(listener) => listener,
        Listen::Addr(addr) => TcpListener::bind(addr).await?,
    };
    tracing::info!("Starting http server on {}", listener.local_addr()?);

    let app = create_router(router);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    tracing::info!("http server stopped");
    Ok(())
}
