use std::net::SocketAddr;

use ringstore::node::{stabilization, Node, REPLICATION_DEGREE};
use ringstore::ring::NodeInfo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [--peer <addr:port>]", args[0]);
        eprintln!("Example: {} --bind 127.0.0.1:4000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:4001 --peer 127.0.0.1:4000",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut peer: Option<SocketAddr> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--peer" => {
                peer = Some(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");

    let replication_degree = std::env::var("REPLICATION_DEGREE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(REPLICATION_DEGREE);

    tracing::info!("Starting node on {}", bind_addr);

    let node = Node::start(bind_addr, replication_degree).await?;
    tracing::info!("Node id: {}", node.info().id);

    match peer {
        Some(peer) => {
            tracing::info!("Joining ring via {}", peer);
            node.bootstrap(NodeInfo::new(peer)).await?;
        }
        None => {
            tracing::info!("Starting a new ring (founder)");
        }
    }

    let stabilizer = stabilization::spawn(node.clone());

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    stabilizer.abort();
    tracing::info!("Node {} exiting; in-memory state discarded", node.info().id);

    Ok(())
}
