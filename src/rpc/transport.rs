//! Framed TCP Transport
//!
//! Plain TCP with `TCP_NODELAY`, carrying u32-length-prefixed bincode frames.
//! Connections are pooled per destination id and shared by both directions:
//! an accepted socket is registered under the identity carried by its first
//! envelope, so later sends to that peer reuse it.
//!
//! One reader task per connection pushes every inbound envelope onto the
//! node's dispatch queue; writes go through a per-connection mutex so frames
//! from concurrent senders never interleave. A decode error closes only the
//! offending connection.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use super::protocol::{Envelope, Message};
use crate::error::{Error, Result};
use crate::ring::{Id, NodeInfo, PeerState};

/// Cap on simultaneously open connections.
pub const MAX_CONNECTIONS: usize = 128;

/// Upper bound on a single frame.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

const INBOUND_QUEUE: usize = 256;

/// Write half of a pooled connection; the per-connection mutex keeps frames
/// from concurrent senders whole.
type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

pub struct Transport {
    local: NodeInfo,
    connections: DashMap<Id, SharedWriter>,
    peer_states: DashMap<Id, PeerState>,
    inbound: mpsc::Sender<Envelope>,
}

impl Transport {
    /// Binds the listener and starts accepting. Returns the transport and
    /// the stream of inbound envelopes for the node to dispatch.
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>)> {
        Self::bind_as(addr, None).await
    }

    /// Like [`Transport::bind`] but pins the local id instead of deriving it
    /// from the bound address. Used by tests to place nodes on chosen ring
    /// positions.
    pub async fn bind_as(
        addr: SocketAddr,
        id: Option<Id>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>)> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let local = match id {
            Some(id) => NodeInfo::with_id(id, bound),
            None => NodeInfo::new(bound),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let transport = Arc::new(Self {
            local,
            connections: DashMap::new(),
            peer_states: DashMap::new(),
            inbound: inbound_tx,
        });

        tokio::spawn(accept_loop(transport.clone(), listener));
        Ok((transport, inbound_rx))
    }

    pub fn local(&self) -> NodeInfo {
        self.local
    }

    /// Sends `payload` as this node. See [`Transport::send_envelope`].
    pub async fn send(self: &Arc<Self>, dest: &NodeInfo, payload: Message) -> Result<()> {
        self.send_envelope(
            dest,
            Envelope {
                origin: self.local,
                payload,
            },
        )
        .await
    }

    /// Sends a full envelope, preserving its origin (used when forwarding a
    /// LOOKUP on behalf of the original requester).
    pub async fn send_envelope(self: &Arc<Self>, dest: &NodeInfo, env: Envelope) -> Result<()> {
        if dest.id == self.local.id {
            // programmer error; logged, never propagated into ring state
            error!("attempted to open a connection to self");
            return Err(Error::SelfReference);
        }

        let writer = self.get_or_connect(dest).await?;
        let mut guard = writer.lock().await;
        if let Err(e) = send_frame(&mut *guard, &env).await {
            drop(guard);
            debug!(peer = %dest, "send failed: {e}");
            self.connections.remove(&dest.id);
            return Err(e);
        }
        Ok(())
    }

    async fn get_or_connect(self: &Arc<Self>, dest: &NodeInfo) -> Result<SharedWriter> {
        if let Some(existing) = self.connections.get(&dest.id) {
            return Ok(existing.value().clone());
        }
        if self.connections.len() >= MAX_CONNECTIONS {
            return Err(Error::ConnectionLimit);
        }

        let stream = TcpStream::connect(dest.addr)
            .await
            .map_err(|e| Error::Transport(format!("connect {}: {e}", dest.addr)))?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let writer: SharedWriter = Arc::new(Mutex::new(write_half));
        self.connections.insert(dest.id, writer.clone());
        tokio::spawn(read_loop(self.clone(), *dest, read_half));
        debug!(peer = %dest, "connected");
        Ok(writer)
    }

    pub fn disconnect(&self, id: Id) {
        self.connections.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // -- peer lifecycle registry --

    /// Any inbound traffic or announcement revives a peer, including one
    /// previously declared dead: a new arrival at the same id starts over.
    pub fn mark_alive(&self, id: Id) {
        self.peer_states.insert(id, PeerState::Alive);
    }

    /// One failed send: the peer may still recover. Dead stays dead.
    pub fn mark_suspect(&self, id: Id) {
        if let Some(mut state) = self.peer_states.get_mut(&id) {
            if *state == PeerState::Alive {
                *state = PeerState::Suspect;
            }
        } else {
            self.peer_states.insert(id, PeerState::Suspect);
        }
    }

    /// Retries or a ping were exhausted; drop the connection too.
    pub fn mark_dead(&self, id: Id) {
        self.peer_states.insert(id, PeerState::Dead);
        self.connections.remove(&id);
    }

    pub fn peer_state(&self, id: Id) -> Option<PeerState> {
        self.peer_states.get(&id).map(|s| *s)
    }
}

async fn accept_loop(transport: Arc<Transport>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if transport.connections.len() >= MAX_CONNECTIONS {
                    warn!("connection limit reached, rejecting {remote}");
                    continue;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("set_nodelay failed for {remote}: {e}");
                }
                tokio::spawn(register_inbound(transport.clone(), stream, remote));
            }
            Err(e) => {
                error!("accept failed: {e}");
            }
        }
    }
}

/// The first envelope on an accepted socket names the peer; only then does
/// the connection enter the pool.
async fn register_inbound(transport: Arc<Transport>, stream: TcpStream, remote: SocketAddr) {
    let (mut read_half, write_half) = stream.into_split();

    let first = match recv_frame::<_, Envelope>(&mut read_half).await {
        Ok(env) => env,
        Err(e) => {
            warn!("dropping connection from {remote}: {e}");
            return;
        }
    };

    let peer = first.origin;
    transport
        .connections
        .insert(peer.id, Arc::new(Mutex::new(write_half)));
    transport.mark_alive(peer.id);
    debug!(peer = %peer, "accepted connection from {remote}");

    if transport.inbound.send(first).await.is_err() {
        return;
    }
    read_loop(transport, peer, read_half).await;
}

async fn read_loop(transport: Arc<Transport>, peer: NodeInfo, mut read_half: OwnedReadHalf) {
    loop {
        match recv_frame::<_, Envelope>(&mut read_half).await {
            Ok(env) => {
                transport.mark_alive(env.origin.id);
                if transport.inbound.send(env).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(peer = %peer, "connection closed: {e}");
                transport.connections.remove(&peer.id);
                break;
            }
        }
    }
}

/// Writes one length-prefixed bincode frame.
pub async fn send_frame<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let encoded = bincode::serialize(value)?;
    if encoded.len() > MAX_FRAME_BYTES {
        return Err(Error::Serialization(format!(
            "frame of {} bytes exceeds limit",
            encoded.len()
        )));
    }
    stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame.
pub async fn recv_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Serialization(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(bincode::deserialize(&buffer)?)
}
