//! Client Harness
//!
//! Small operator tool speaking the node protocol over a single framed TCP
//! connection: `ringstore-cli <peer> STATE|PUT|GET|DELETE [args...]`.
//!
//! The client presents an ephemeral identity derived from its own socket
//! address; nodes answer it directly and never treat it as a ring peer.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ringstore::ring::{Id, NodeInfo};
use ringstore::rpc::transport::{recv_frame, send_frame};
use ringstore::rpc::{Envelope, Message};
use tokio::net::TcpStream;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <peer-addr> STATE|PUT|GET|DELETE [args...]", args[0]);
        eprintln!("  {} 127.0.0.1:4000 STATE", args[0]);
        eprintln!("  {} 127.0.0.1:4000 PUT <key> <value>", args[0]);
        eprintln!("  {} 127.0.0.1:4000 GET <key>", args[0]);
        eprintln!("  {} 127.0.0.1:4000 DELETE <key>", args[0]);
        eprintln!("Keys: a bare integer is used as a ring id, anything else is hashed.");
        std::process::exit(1);
    }

    let peer: SocketAddr = args[1]
        .parse()
        .with_context(|| format!("invalid peer address {}", args[1]))?;

    let request = match args[2].to_uppercase().as_str() {
        "STATE" => Message::State,
        "PUT" => {
            let key = key_arg(&args, 3)?;
            let value = args
                .get(4)
                .ok_or_else(|| anyhow!("PUT needs <key> <value>"))?;
            Message::Put {
                key,
                value: value.clone().into_bytes(),
            }
        }
        "GET" => Message::Retrieve {
            key: key_arg(&args, 3)?,
        },
        "DELETE" => Message::Remove {
            key: key_arg(&args, 3)?,
        },
        other => bail!("unknown command {other}"),
    };

    let mut stream = TcpStream::connect(peer)
        .await
        .with_context(|| format!("connecting to {peer}"))?;
    stream.set_nodelay(true)?;
    let identity = NodeInfo::new(stream.local_addr()?);

    send_frame(
        &mut stream,
        &Envelope {
            origin: identity,
            payload: request,
        },
    )
    .await?;

    let reply = tokio::time::timeout(REPLY_TIMEOUT, await_result(&mut stream))
        .await
        .map_err(|_| anyhow!("no reply from {peer} within {REPLY_TIMEOUT:?}"))??;

    match reply {
        Message::StateResult { summary } => print!("{summary}"),
        Message::PutResult { key, success } => match success {
            true => println!("stored {key}"),
            false => bail!("store of {key} failed"),
        },
        Message::RetrieveResult { key, value } => match value {
            Some(bytes) => match String::from_utf8(bytes.clone()) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{} bytes (binary)", bytes.len()),
            },
            None => bail!("{key} not found"),
        },
        Message::RemoveResult { key, success } => match success {
            true => println!("deleted {key}"),
            false => bail!("{key} not found"),
        },
        other => bail!("unexpected reply {}", other.kind()),
    }

    Ok(())
}

/// Reads frames until one carries a client result; nodes occasionally share
/// a connection with ring chatter that a client simply skips.
async fn await_result(stream: &mut TcpStream) -> Result<Message> {
    loop {
        let env: Envelope = recv_frame(stream).await?;
        if env.payload.is_client_surface() {
            return Ok(env.payload);
        }
    }
}

fn key_arg(args: &[String], index: usize) -> Result<Id> {
    let raw = args
        .get(index)
        .ok_or_else(|| anyhow!("missing <key> argument"))?;
    Ok(match raw.parse::<u64>() {
        Ok(numeric) => Id::new(numeric),
        Err(_) => Id::hash(raw.as_bytes()),
    })
}
