//! Orchestrator lifecycle against scripted engines: teardown order, error
//! propagation and clean interrupts.

use async_trait::async_trait;
use quorumkv::common::{Error, NodeConfig, Result};
use quorumkv::engine::{
    ConsensusEngine, EventHandler, GossipEngine, GossipEvent, LeaderNotify, Member,
    MemberEventKind,
};
use quorumkv::node::{KvStateMachine, Node, RAFT_ADDR_TAG};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type Journal = Arc<Mutex<Vec<&'static str>>>;

struct ScriptedConsensus {
    journal: Journal,
    notify: Mutex<Option<LeaderNotify>>,
    _notify_tx: mpsc::UnboundedSender<bool>,
    fail_shutdown: bool,
}

impl ScriptedConsensus {
    fn new(journal: Journal) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            journal,
            notify: Mutex::new(Some(rx)),
            _notify_tx: tx,
            fail_shutdown: false,
        }
    }
}

#[async_trait]
impl ConsensusEngine for ScriptedConsensus {
    fn take_leader_notify(&self) -> Option<LeaderNotify> {
        self.notify.lock().unwrap().take()
    }

    async fn add_voter(&self, _id: &str, _address: &str, _prev: u64, _t: Duration) -> Result<()> {
        Ok(())
    }

    async fn apply(&self, _entry: Vec<u8>, _timeout: Duration) -> Result<u64> {
        Err(Error::NotLeader("unknown".into()))
    }

    fn is_leader(&self) -> bool {
        false
    }

    fn leader_address(&self) -> Option<String> {
        None
    }

    async fn shutdown(&self) -> Result<()> {
        // make an out-of-order teardown observable
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.journal.lock().unwrap().push("consensus");
        if self.fail_shutdown {
            return Err(Error::Consensus("shutdown failed".into()));
        }
        Ok(())
    }
}

struct ScriptedGossip {
    journal: Journal,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    stopped: CancellationToken,
    fail_start: bool,
}

impl ScriptedGossip {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            handler: Mutex::new(None),
            stopped: CancellationToken::new(),
            fail_start: false,
        }
    }

    fn local() -> Member {
        Member::new("n1", "127.0.0.1:7946").with_tag(RAFT_ADDR_TAG, "127.0.0.1:9000")
    }
}

#[async_trait]
impl GossipEngine for ScriptedGossip {
    fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(Error::Gossip("bind failed".into()));
        }
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler
                .handle_event(GossipEvent::member(MemberEventKind::Join, vec![Self::local()]))
                .await;
        }
        Ok(())
    }

    async fn join(&self, _addresses: &[String], _ignore_old: bool) -> Result<usize> {
        Ok(1)
    }

    fn shutdown_signal(&self) -> CancellationToken {
        self.stopped.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.journal.lock().unwrap().push("gossip");
        self.stopped.cancel();
        Ok(())
    }

    fn local_member(&self) -> Member {
        Self::local()
    }
}

fn config(data: &tempfile::TempDir) -> NodeConfig {
    NodeConfig {
        node_id: "n1".into(),
        is_seed: true,
        gossip_data_dir: data.path().join("gossip"),
        raft_data_dir: data.path().join("raft"),
        ..Default::default()
    }
}

async fn run(
    node: Node,
    interrupt: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        node.run_with_listener(listener, interrupt),
    )
    .await
    .expect("node did not stop")
}

#[tokio::test]
async fn test_interrupt_tears_down_gossip_before_consensus() {
    let data = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let node = Node::new(
        config(&data),
        Arc::new(ScriptedConsensus::new(journal.clone())),
        Arc::new(ScriptedGossip::new(journal.clone())),
        Arc::new(KvStateMachine::new()),
    );
    let metadata = node.metadata();

    let (tx, rx) = oneshot::channel::<()>();
    let running = tokio::spawn(run(node, async move {
        let _ = rx.await;
    }));

    // the self join from start() has been recorded
    while metadata.lookup("n1").is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(journal.lock().unwrap().is_empty());

    tx.send(()).unwrap();
    let result = running.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(*journal.lock().unwrap(), vec!["gossip", "consensus"]);
    assert!(data.path().join("gossip").is_dir());
    assert!(data.path().join("raft").is_dir());
}

#[tokio::test]
async fn test_gossip_start_failure_shuts_down_with_error() {
    let data = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let mut gossip = ScriptedGossip::new(journal.clone());
    gossip.fail_start = true;
    let node = Node::new(
        config(&data),
        Arc::new(ScriptedConsensus::new(journal.clone())),
        Arc::new(gossip),
        Arc::new(KvStateMachine::new()),
    );

    let err = run(node, std::future::pending()).await.unwrap_err();
    assert!(matches!(err, Error::Gossip(_)));
    assert_eq!(*journal.lock().unwrap(), vec!["gossip", "consensus"]);
}

#[tokio::test]
async fn test_consensus_shutdown_error_is_reported_after_gossip_stops() {
    let data = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let mut consensus = ScriptedConsensus::new(journal.clone());
    consensus.fail_shutdown = true;
    let node = Node::new(
        config(&data),
        Arc::new(consensus),
        Arc::new(ScriptedGossip::new(journal.clone())),
        Arc::new(KvStateMachine::new()),
    );

    let err = run(node, async {}).await.unwrap_err();
    assert!(matches!(err, Error::Consensus(_)));
    assert_eq!(*journal.lock().unwrap(), vec!["gossip", "consensus"]);
}

#[tokio::test]
async fn test_gossip_stopping_on_its_own_ends_the_run() {
    let data = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let gossip = Arc::new(ScriptedGossip::new(journal.clone()));
    let stopped = gossip.shutdown_signal();
    let node = Node::new(
        config(&data),
        Arc::new(ScriptedConsensus::new(journal.clone())),
        gossip,
        Arc::new(KvStateMachine::new()),
    );

    let running = tokio::spawn(run(node, std::future::pending()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    stopped.cancel();

    assert!(running.await.unwrap().is_ok());
    assert_eq!(*journal.lock().unwrap(), vec!["gossip", "consensus"]);
}

#[tokio::test]
async fn test_taken_leader_channel_fails_startup() {
    let data = tempfile::tempdir().unwrap();
    let journal = Journal::default();
    let consensus = Arc::new(ScriptedConsensus::new(journal.clone()));
    let _stolen = consensus.take_leader_notify();
    let node = Node::new(
        config(&data),
        consensus,
        Arc::new(ScriptedGossip::new(journal.clone())),
        Arc::new(KvStateMachine::new()),
    );

    let err = run(node, std::future::pending()).await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(*journal.lock().unwrap(), vec!["gossip", "consensus"]);
}
