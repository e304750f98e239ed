//! Node binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use quorumkv::engine::{GossipNetwork, RaftNetwork};
use quorumkv::{Node, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumkv-node")]
#[command(about = "quorumkv node: gossip membership and Raft replication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// TOML config file (QUORUMKV_* environment variables also apply)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for the HTTP API
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Gossip address
        #[arg(long)]
        gossip: Option<String>,

        /// Raft address
        #[arg(long)]
        raft: Option<String>,

        /// Gossip data directory
        #[arg(long)]
        gossip_data: Option<PathBuf>,

        /// Raft data directory
        #[arg(long)]
        raft_data: Option<PathBuf>,

        /// Bootstrap a new cluster instead of joining one
        #[arg(long)]
        seed: bool,

        /// Gossip addresses to join (comma-separated)
        #[arg(long, value_delimiter = ',')]
        join: Vec<String>,
    },

    /// Run a local cluster in one process
    Dev {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: u16,

        /// HTTP port of the first node, the others follow
        #[arg(long, default_value = "8080")]
        http_port: u16,

        /// Gossip port of the first node
        #[arg(long, default_value = "7946")]
        gossip_port: u16,

        /// Raft port of the first node
        #[arg(long, default_value = "9000")]
        raft_port: u16,

        /// Root of the per-node data directories
        #[arg(long, default_value = "./data/dev")]
        data: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            http,
            gossip,
            raft,
            gossip_data,
            raft_data,
            seed,
            join,
        } => {
            // File and environment first, CLI flags have priority
            let mut conf = NodeConfig::load(config.as_deref())?;
            if let Some(id) = id {
                conf.node_id = id;
            }
            if let Some(http) = http {
                conf.http_addr = http;
            }
            if let Some(gossip) = gossip {
                conf.gossip_addr = gossip;
            }
            if let Some(raft) = raft {
                conf.raft_addr = raft;
            }
            if let Some(dir) = gossip_data {
                conf.gossip_data_dir = dir;
            }
            if let Some(dir) = raft_data {
                conf.raft_data_dir = dir;
            }
            if seed {
                conf.is_seed = true;
            }
            if !join.is_empty() {
                conf.join_addrs = join;
            }
            conf.validate()?;

            let node = Node::in_memory(conf, RaftNetwork::new(), GossipNetwork::new())?;
            node.serve().await?;
        }

        Commands::Dev {
            nodes,
            http_port,
            gossip_port,
            raft_port,
            data,
        } => {
            anyhow::ensure!(nodes > 0, "--nodes must be at least 1");

            let raft_network = RaftNetwork::new();
            let gossip_network = GossipNetwork::new();
            let seed_gossip = format!("127.0.0.1:{}", gossip_port);

            let shutdown = CancellationToken::new();
            let mut runs = Vec::new();
            for i in 0..nodes {
                let id = format!("n{}", i + 1);
                let conf = NodeConfig {
                    node_id: id.clone(),
                    http_addr: SocketAddr::from((
                        [127, 0, 0, 1],
                        nth_port("--http-port", http_port, i)?,
                    )),
                    gossip_addr: format!("127.0.0.1:{}", nth_port("--gossip-port", gossip_port, i)?),
                    raft_addr: format!("127.0.0.1:{}", nth_port("--raft-port", raft_port, i)?),
                    gossip_data_dir: data.join(&id).join("gossip"),
                    raft_data_dir: data.join(&id).join("raft"),
                    is_seed: i == 0,
                    join_addrs: if i == 0 {
                        Vec::new()
                    } else {
                        vec![seed_gossip.clone()]
                    },
                    ..Default::default()
                };
                tracing::info!("  {} -> http://{}", id, conf.http_addr);
                let node = Node::in_memory(conf, raft_network.clone(), gossip_network.clone())?;
                let leadership = node.leadership();
                runs.push(tokio::spawn(
                    node.run_until(shutdown.clone().cancelled_owned()),
                ));

                // The others can only join once the seed gossips and leads
                if i == 0 {
                    while !(leadership.is_leader() && gossip_network.member_names().contains(&id)) {
                        if runs[0].is_finished() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }

            let interrupt = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });

            let mut failed = 0;
            for joined in join_all(runs).await {
                let result = joined.map_err(|e| anyhow::anyhow!("node task panicked: {}", e))?;
                if let Err(e) = result {
                    tracing::error!(error = %e, "node stopped with an error");
                    failed += 1;
                }
            }
            anyhow::ensure!(failed == 0, "{} node(s) stopped with an error", failed);
        }
    }

    Ok(())
}

/// Port of the `i`th dev node, counting up from `base`.
fn nth_port(flag: &str, base: u16, i: u16) -> anyhow::Result<u16> {
    base.checked_add(i).with_context(|| {
        format!(
            "{} {} leaves no room for node {}",
            flag,
            base,
            u32::from(i) + 1
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nth_port_rejects_overflow() {
        assert_eq!(nth_port("--http-port", 8080, 2).unwrap(), 8082);
        assert_eq!(nth_port("--raft-port", 65534, 1).unwrap(), 65535);
        let err = nth_port("--raft-port", 65535, 1).unwrap_err();
        assert!(err.to_string().contains("--raft-port"));
    }
}
