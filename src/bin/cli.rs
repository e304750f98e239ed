//! CLI for talking to a quorumkv node over HTTP

use anyhow::Context;
use clap::{Parser, Subcommand};
use quorumkv::common::key_path;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "quorumkv")]
#[command(about = "quorumkv key-value store CLI")]
#[command(version)]
struct Cli {
    /// Node URL
    #[arg(long, default_value = "http://localhost:8080")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write one cell (must be sent to the leader)
    Put {
        table: String,
        row: String,
        column: String,
        value: String,
    },

    /// Read a row, or a single cell when a column is given
    Get {
        table: String,
        row: String,
        column: Option<String>,
    },

    /// Ask the node to add a voter
    Join {
        /// Raft address of the new voter
        #[arg(long)]
        address: String,

        /// Voter ID (defaults to the address)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show node status
    Status,

    /// List known cluster members
    Members,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.node.trim_end_matches('/');

    match cli.command {
        Commands::Put {
            table,
            row,
            column,
            value,
        } => {
            let url = format!("{}{}", base, key_path(&table, &row, Some(&column)));
            let resp = client
                .post(&url)
                .json(&serde_json::json!({ "value": value }))
                .send()
                .await
                .with_context(|| format!("POST {}", url))?;
            check(resp).await?;
            println!("OK");
        }

        Commands::Get { table, row, column } => {
            let url = format!("{}{}", base, key_path(&table, &row, column.as_deref()));
            let resp = client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {}", url))?;
            let body: Value = check(resp).await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&body["value"])?);
            if let Some(leader) = body["leader"].as_str().filter(|l| !l.is_empty()) {
                println!("leader: {}", leader);
            }
        }

        Commands::Join { address, id } => {
            let url = format!("{}/join", base);
            let mut req = client.post(&url).header("Peer-Address", &address);
            if let Some(id) = &id {
                req = req.header("Peer-Id", id);
            }
            let resp = req.send().await.with_context(|| format!("POST {}", url))?;
            check(resp).await?;
            println!("Joined {} ({})", id.as_deref().unwrap_or(&address), address);
        }

        Commands::Status => {
            let body: Value = check(client.get(format!("{}/health", base)).send().await?)
                .await?
                .json()
                .await?;
            println!("Node status:");
            println!("  ID: {}", body["node_id"].as_str().unwrap_or("-"));
            println!("  Role: {}", body["role"].as_str().unwrap_or("-"));
            println!("  Leader: {}", body["leader"].as_str().unwrap_or("unknown"));
            println!("  Last applied: {}", body["last_applied"]);
            println!("  Members: {}", body["members"]);
        }

        Commands::Members => {
            let members: Vec<Value> = check(client.get(format!("{}/members", base)).send().await?)
                .await?
                .json()
                .await?;
            for m in members {
                println!(
                    "{}\t{}\t{}\t{}",
                    m["id"].as_str().unwrap_or("-"),
                    m["gossip_address"].as_str().unwrap_or("-"),
                    m["consensus_address"].as_str().unwrap_or("-"),
                    m["status"].as_str().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}

async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("request failed ({}): {}", status, body)
}
