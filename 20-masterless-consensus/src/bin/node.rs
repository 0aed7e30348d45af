//! Runs one replica with a line-oriented console on stdin.
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1
//! cargo run --bin node -- --id 0 \
//!   --peer 0=127.0.0.1:7201,1=127.0.0.1:7202,2=127.0.0.1:7203
//!
//! # Terminals 2 and 3: same peer list, --id 1 and --id 2
//! ```
//!
//! Then type `p hello` on any node; every node prints the commit.

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::warn;

use masterless_consensus::protocol::{parse_peers, ConsoleCommand, USAGE};
use masterless_consensus::{spawn_node, NodeConfig, NodeHandle, NodeId};

/// Run a masterless consensus replica.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// This node's id; must appear in --peer.
    #[arg(long)]
    id: u32,

    /// Full membership as id=addr pairs, comma separated, self included.
    #[arg(long, value_delimiter = ',', required = true)]
    peer: Vec<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let id = NodeId(args.id);
    let peers = parse_peers(&args.peer)?;
    let (handle, mut commits) = spawn_node(NodeConfig { id, peers }).await?;

    println!("node {id} ready, {USAGE}");

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut entry = 0u64;
    loop {
        input.clear();
        select! {
            commit = commits.recv() => match commit {
                Some(carry) => {
                    println!("[{entry}] committed {carry}");
                    entry += 1;
                }
                None => break,
            },
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 || !execute(&handle, &input).await {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(error = ?err, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    handle.shutdown()?;
    Ok(())
}

/// Runs one console line. Returns `false` on EXIT.
async fn execute(handle: &NodeHandle, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }

    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            println!("error: {err}");
            return true;
        }
    };

    let outcome = match command {
        ConsoleCommand::Propose { carry } => handle
            .propose(carry.clone())
            .await
            .map(|()| format!("proposed {carry}")),
        ConsoleCommand::Disconnect { peer } => handle
            .disconnect(peer)
            .await
            .map(|()| format!("marked node {peer} unreachable")),
        ConsoleCommand::Status => handle.status().await.map(|status| {
            let reachable: Vec<String> = status.reachable.iter().map(ToString::to_string).collect();
            format!(
                "node {} step {} phase {:?} reachable [{}] running {}",
                status.node_id,
                status.step,
                status.phase,
                reachable.join(", "),
                status.running
            )
        }),
        ConsoleCommand::Help => Ok(USAGE.to_string()),
        ConsoleCommand::Exit => return false,
    };

    match outcome {
        Ok(message) => println!("{message}"),
        Err(err) => println!("error: {err:#}"),
    }
    true
}
