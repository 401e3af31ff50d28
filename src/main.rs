use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use raft_node::config::{NodeConfig, TimingConfig};
use raft_node::raft::{ApplyMsg, NodeId, RaftNode};
use raft_node::shutdown::install_shutdown_handler;
use raft_node::transport::LocalNetwork;

const MAX_NODES: u64 = 1000;

#[derive(Parser, Debug)]
#[command(name = "raft-node")]
#[command(version)]
#[command(about = "Run an in-process Raft cluster and replicate a batch of commands")]
struct Args {
    /// Number of nodes in the cluster
    #[arg(
        long,
        default_value = "3",
        value_parser = clap::value_parser!(u64).range(1..=MAX_NODES)
    )]
    nodes: u64,

    /// Number of commands to submit through the leader
    #[arg(long, default_value = "5")]
    commands: u64,

    /// Give up after this many seconds
    #[arg(long, default_value = "10")]
    run_secs: u64,

    /// Probability that any single message is dropped
    #[arg(long, default_value = "0.0")]
    loss_rate: f64,

    /// Nominal port of node 0; node `i` gets `base_port + i`
    #[arg(long, default_value = "50051")]
    base_port: u16,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Cluster Driver
// =============================================================================

/// Nominal port of `node_id`, or `None` past the end of the port range.
fn node_port(base_port: u16, node_id: NodeId) -> Option<u16> {
    u16::try_from(node_id)
        .ok()
        .and_then(|offset| base_port.checked_add(offset))
}

async fn run_demo(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let timing = TimingConfig::default();
    let network = LocalNetwork::new(timing.rpc_timeout());
    network.set_loss_rate(args.loss_rate).await;

    let (apply_tx, mut apply_rx) = mpsc::unbounded_channel::<ApplyMsg>();
    let apply_tx = Arc::new(apply_tx);

    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for node_id in 0..args.nodes {
        let port = node_port(args.base_port, node_id).ok_or_else(|| {
            format!("node {node_id} has no port above base port {}", args.base_port)
        })?;
        let config = NodeConfig::new(node_id, port, args.nodes).with_timing(timing.clone());
        let node = RaftNode::new(config, network.clone(), apply_tx.clone())?;
        network.register(node_id, Arc::new(node.clone())).await;

        let runner = node.clone();
        let cancel = shutdown.clone();
        handles.push(tokio::spawn(async move { runner.run(cancel).await }));
        nodes.push(node);
    }
    tracing::info!(nodes = args.nodes, loss_rate = args.loss_rate, "Cluster started");

    let completed = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!("Interrupted");
            false
        }
        _ = tokio::time::sleep(Duration::from_secs(args.run_secs)) => {
            tracing::warn!(
                run_secs = args.run_secs,
                "Run time elapsed before all commands were applied"
            );
            false
        }
        result = drive(&nodes, args.commands, &mut apply_rx, &args.output) => {
            result?;
            true
        }
    };

    let mut statuses = Vec::new();
    for node in &nodes {
        statuses.push(node.status().await);
    }
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
        OutputFormat::Table => {
            println!();
            println!("Cluster Status");
            println!("{}", "=".repeat(60));
            println!(
                "{:<6} {:<10} {:<6} {:<8} {:<8} LAST LOG",
                "ID", "ROLE", "TERM", "LEADER", "COMMIT"
            );
            println!("{}", "-".repeat(60));
            for status in &statuses {
                let leader = status
                    .leader_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<6} {:<10} {:<6} {:<8} {:<8} {}",
                    status.node_id,
                    status.role,
                    status.term,
                    leader,
                    status.commit_index,
                    status.last_log_index
                );
            }
        }
    }

    shutdown.cancel();
    for handle in handles {
        handle.await?;
    }
    // Nodes and the network hold each other; break the cycle
    network.clear().await;

    if completed {
        tracing::info!(commands = args.commands, "All commands applied on every node");
    }
    Ok(())
}

/// Submit `commands` through whichever node leads, then wait until every
/// node has applied that many entries.
async fn drive(
    nodes: &[RaftNode],
    commands: u64,
    apply_rx: &mut mpsc::UnboundedReceiver<ApplyMsg>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut submitted = 0;
    while submitted < commands {
        let leader = wait_for_leader(nodes).await;
        let command = format!("cmd-{submitted}").into_bytes();
        match leader.propose(command).await {
            Ok(index) => {
                tracing::info!(leader_id = leader.id, index, "Submitted command");
                submitted += 1;
            }
            Err(e) => tracing::debug!(error = %e, "Submission refused, retrying"),
        }
    }

    let mut applied: HashMap<NodeId, u64> = HashMap::new();
    while applied.len() < nodes.len() || applied.values().any(|&count| count < commands) {
        let Some(msg) = apply_rx.recv().await else {
            return Err("apply channel closed".into());
        };
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string(&msg)?),
            OutputFormat::Table => println!(
                "node {:<3} applied {:<4} {}",
                msg.node_id,
                msg.index,
                String::from_utf8_lossy(&msg.command)
            ),
        }
        *applied.entry(msg.node_id).or_default() += 1;
    }
    Ok(())
}

async fn wait_for_leader(nodes: &[RaftNode]) -> &RaftNode {
    loop {
        for node in nodes {
            if node.get_state().await.1 {
                return node;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run_demo(args).await
}
