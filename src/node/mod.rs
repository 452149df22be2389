//! Node Module
//!
//! Ties the subsystems together: one `Node` owns its finger table, its
//! stores and its operation managers, and holds exactly one transport
//! handle. Inbound envelopes are dispatched as independent tasks; every
//! outbound RPC is preceded by a liveness ping.
//!
//! ## Core Mechanisms
//! - **Routed operations**: insert/get/delete resolve the owner through the
//!   finger table and complete when the owner's `*Result` message arrives.
//! - **Replication**: each primary key is copied to the first R-1
//!   successors; shortfall on a small ring is recorded and retried by the
//!   stabilization task rather than treated as an error.
//! - **Failure propagation**: a dead peer is purged from every pointer, and
//!   the ring heals by promoting replicas and re-replicating.

pub mod handlers;
pub mod stabilization;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ring::{FingerTable, Id, NodeInfo};
use crate::rpc::{await_outcome, Envelope, Message, OperationManager, Ticket, Transport};
use crate::store::{LocalStore, ReplicaStore};

/// Copies of every key, primary included.
pub const REPLICATION_DEGREE: usize = 3;

/// Window for resolving a key's owner, per attempt.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Window for a routed operation to produce its result.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Window for the liveness probe preceding an outbound RPC.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Attempts before a failing lookup or send is declared unrecoverable.
pub const OPERATION_MAX_FAILED_ATTEMPTS: usize = 3;

pub struct Node {
    info: NodeInfo,
    table: FingerTable,
    local: LocalStore,
    replicas: ReplicaStore,
    /// key -> copies actually placed, for keys short of the replication
    /// degree; drained by stabilization once the ring has grown
    unfinished_replications: DashMap<Id, usize>,
    transport: Arc<Transport>,
    replication_degree: usize,

    lookups: OperationManager<Id, NodeInfo>,
    inserts: OperationManager<Id, bool>,
    gets: OperationManager<Id, Option<Vec<u8>>>,
    deletes: OperationManager<Id, bool>,
    /// keyed by destination id: one key transfer per admitted predecessor
    key_sends: OperationManager<Id, bool>,
    pings: OperationManager<Id, ()>,
    /// singleton: one predecessor request at a time per node
    predecessor_request: OperationManager<(), NodeInfo>,
}

impl Node {
    /// Binds the transport and starts dispatching inbound messages.
    pub async fn start(bind: SocketAddr, replication_degree: usize) -> Result<Arc<Self>> {
        Self::start_with_id(bind, None, replication_degree).await
    }

    /// Like [`Node::start`] but pins the ring id. Tests use this to build
    /// rings with chosen geometry.
    pub async fn start_with_id(
        bind: SocketAddr,
        id: Option<Id>,
        replication_degree: usize,
    ) -> Result<Arc<Self>> {
        let (transport, inbound) = Transport::bind_as(bind, id).await?;
        let info = transport.local();

        let node = Arc::new(Self {
            info,
            table: FingerTable::new(info, replication_degree),
            local: LocalStore::new(),
            replicas: ReplicaStore::new(),
            unfinished_replications: DashMap::new(),
            transport,
            replication_degree,
            lookups: OperationManager::new(),
            inserts: OperationManager::new(),
            gets: OperationManager::new(),
            deletes: OperationManager::new(),
            key_sends: OperationManager::new(),
            pings: OperationManager::new(),
            predecessor_request: OperationManager::new(),
        });

        tokio::spawn(pump_inbound(node.clone(), inbound));
        info!(node = %info, "node started");
        Ok(node)
    }

    pub fn info(&self) -> NodeInfo {
        self.info
    }

    pub fn table(&self) -> &FingerTable {
        &self.table
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn replica_store(&self) -> &ReplicaStore {
        &self.replicas
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn unfinished_replication_of(&self, key: Id) -> Option<usize> {
        self.unfinished_replications.get(&key).map(|e| *e.value())
    }

    pub fn in_flight_operations(&self) -> usize {
        self.lookups.in_flight()
            + self.inserts.in_flight()
            + self.gets.in_flight()
            + self.deletes.in_flight()
    }

    // ============================================================
    // BOOTSTRAP
    // ============================================================

    /// Joins the ring known to `contact`: resolve this node's own id to
    /// find its successor, adopt the successor's predecessor, then announce
    /// itself. An existing node at the same id is fatal.
    pub async fn bootstrap(self: &Arc<Self>, contact: NodeInfo) -> Result<()> {
        if contact.id == self.info.id {
            return Err(Error::IdCollision(self.info.id));
        }

        let successor = self.remote_lookup(contact, self.info.id).await?;
        if successor.id == self.info.id {
            return Err(Error::IdCollision(self.info.id));
        }

        self.inform_about_existence(&contact);
        self.inform_about_existence(&successor);

        match self.request_predecessor(successor).await {
            Ok(candidate) => {
                // the successor's predecessor is this node's predecessor;
                // adoption runs the same handover path as NOTIFY
                if self.update_predecessor(candidate).await {
                    debug!(node = %self.info, pred = %candidate, "adopted bootstrap predecessor");
                }
            }
            Err(e) => warn!("bootstrap predecessor request failed: {e}"),
        }

        self.send_operation(&successor, Message::Notify).await?;
        info!(node = %self.info, successor = %successor, "joined ring");
        Ok(())
    }

    // ============================================================
    // LOOKUP
    // ============================================================

    /// Resolves the owner of `key`. Immediate when the answer is local
    /// knowledge; otherwise one shared LOOKUP per key travels the ring,
    /// bounded by [`LOOKUP_TIMEOUT`] with up to three attempts.
    pub async fn lookup(self: &Arc<Self>, key: Id) -> Result<NodeInfo> {
        if self.table.owns(key) {
            return Ok(self.info);
        }
        if let Some(successor) = self.table.successor() {
            if Id::between(self.info.id, successor.id, key) {
                return Ok(successor);
            }
        }

        let mut attempts = 0;
        loop {
            let rx = match self.lookups.subscribe(key) {
                Ticket::Attached(rx) => rx,
                Ticket::New(rx) => {
                    let target = match self.route_target(key) {
                        Ok(target) => target,
                        Err(e) => {
                            self.lookups.fail(&key, e.clone());
                            return Err(e);
                        }
                    };
                    if let Err(e) = self
                        .send_operation(&target, Message::Lookup { key })
                        .await
                    {
                        self.lookups.fail(&key, e.clone());
                        return Err(e);
                    }
                    rx
                }
            };

            match await_outcome(rx, LOOKUP_TIMEOUT).await {
                Some(outcome) => return outcome,
                None => {
                    attempts += 1;
                    self.lookups.fail(&key, Error::LookupTimeout(key));
                    if attempts >= OPERATION_MAX_FAILED_ATTEMPTS {
                        return Err(Error::LookupTimeout(key));
                    }
                    debug!(key = %key, attempts, "lookup timed out, retrying");
                }
            }
        }
    }

    /// First hop for a key this node cannot place: the closest preceding
    /// finger, or the successor when the table knows nothing better.
    fn route_target(&self, key: Id) -> Result<NodeInfo> {
        let target = self.table.next_best(key);
        if target.id != self.info.id {
            return Ok(target);
        }
        self.table.successor().ok_or(Error::KeyNotFound(key))
    }

    /// Lookup addressed to a specific peer, used at bootstrap before the
    /// finger table knows anyone.
    async fn remote_lookup(self: &Arc<Self>, peer: NodeInfo, key: Id) -> Result<NodeInfo> {
        let rx = match self.lookups.subscribe(key) {
            Ticket::Attached(rx) => rx,
            Ticket::New(rx) => {
                if let Err(e) = self.send_operation(&peer, Message::Lookup { key }).await {
                    self.lookups.fail(&key, e.clone());
                    return Err(e);
                }
                rx
            }
        };
        match await_outcome(rx, LOOKUP_TIMEOUT).await {
            Some(outcome) => outcome,
            None => {
                self.lookups.fail(&key, Error::LookupTimeout(key));
                Err(Error::LookupTimeout(key))
            }
        }
    }

    // ============================================================
    // KEY-VALUE OPERATIONS
    // ============================================================

    pub async fn insert(self: &Arc<Self>, key: Id, value: Vec<u8>) -> Result<bool> {
        self.operation(&self.inserts, key, Message::Insert { key, value })
            .await
    }

    pub async fn get(self: &Arc<Self>, key: Id) -> Result<Option<Vec<u8>>> {
        self.operation(&self.gets, key, Message::Get { key }).await
    }

    pub async fn delete(self: &Arc<Self>, key: Id) -> Result<bool> {
        self.operation(&self.deletes, key, Message::Delete { key })
            .await
    }

    /// The shared pipeline: deduplicate, resolve the owner, send with
    /// bounded retries, then wait for the result message. Unrecoverable
    /// failure completes the shared future with `KeyNotFound`.
    async fn operation<R: Clone>(
        self: &Arc<Self>,
        manager: &OperationManager<Id, R>,
        key: Id,
        message: Message,
    ) -> Result<R> {
        let rx = match manager.subscribe(key) {
            Ticket::Attached(rx) => rx,
            Ticket::New(rx) => {
                let destination = match self.lookup(key).await {
                    Ok(owner) => owner,
                    Err(e) => {
                        debug!(key = %key, "owner lookup failed: {e}");
                        manager.fail(&key, Error::KeyNotFound(key));
                        return Err(Error::KeyNotFound(key));
                    }
                };

                let mut attempt = 0;
                loop {
                    match self.send_operation(&destination, message.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            attempt += 1;
                            if attempt >= OPERATION_MAX_FAILED_ATTEMPTS {
                                warn!(key = %key, dest = %destination, "send failed: {e}");
                                self.inform_about_failure(&destination).await;
                                manager.fail(&key, Error::KeyNotFound(key));
                                return Err(Error::KeyNotFound(key));
                            }
                            retry_pause(attempt).await;
                        }
                    }
                }
                rx
            }
        };

        match await_outcome(rx, OPERATION_TIMEOUT).await {
            Some(outcome) => outcome,
            None => {
                manager.fail(&key, Error::OperationTimeout(key));
                Err(Error::OperationTimeout(key))
            }
        }
    }

    // ============================================================
    // SENDING
    // ============================================================

    /// Sends `payload` to `dest` as this node. A destination equal to the
    /// local node short-circuits into the local handler; everyone else is
    /// pinged first.
    pub(crate) async fn send_operation(
        self: &Arc<Self>,
        dest: &NodeInfo,
        payload: Message,
    ) -> Result<()> {
        self.forward_envelope(
            dest,
            Envelope {
                origin: self.info,
                payload,
            },
        )
        .await
    }

    /// Sends a pre-built envelope, preserving its origin (LOOKUP hops).
    pub(crate) async fn forward_envelope(
        self: &Arc<Self>,
        dest: &NodeInfo,
        env: Envelope,
    ) -> Result<()> {
        if dest.id == self.info.id {
            self.dispatch(env);
            return Ok(());
        }

        self.ping(dest).await?;
        match self.transport.send_envelope(dest, env).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transport.mark_suspect(dest.id);
                Err(e)
            }
        }
    }

    /// Liveness probe preceding every outbound RPC. Concurrent probes to the
    /// same peer share one PING. A timed-out probe declares the peer failed.
    async fn ping(self: &Arc<Self>, dest: &NodeInfo) -> Result<()> {
        let rx = match self.pings.subscribe(dest.id) {
            Ticket::Attached(rx) => rx,
            Ticket::New(rx) => {
                if let Err(e) = self.transport.send(dest, Message::Ping).await {
                    self.pings.fail(&dest.id, e.clone());
                    self.transport.mark_suspect(dest.id);
                    return Err(e);
                }
                rx
            }
        };

        match await_outcome(rx, PING_TIMEOUT).await {
            Some(outcome) => outcome,
            None => {
                let error = Error::Transport(format!("ping to {dest} timed out"));
                self.pings.fail(&dest.id, error.clone());
                self.inform_about_failure(dest).await;
                Err(error)
            }
        }
    }

    /// Replies that go to clients bypass the liveness probe: a client is not
    /// a ring peer and never answers PING.
    pub(crate) async fn reply_to_client(&self, dest: &NodeInfo, payload: Message) {
        if let Err(e) = self.transport.send(dest, payload).await {
            debug!(client = %dest, "client reply failed: {e}");
        }
    }

    /// Runs an envelope through the local handler on its own task. The
    /// handler future is boxed: dispatch sits inside the send path, and a
    /// handler may send again.
    pub(crate) fn dispatch(self: &Arc<Self>, env: Envelope) {
        tokio::spawn(handlers::handle_message_boxed(self.clone(), env));
    }

    // ============================================================
    // MEMBERSHIP EVENTS
    // ============================================================

    /// Opportunistic topology update from any ring traffic: the peer is
    /// alive and may improve successor or finger entries. The predecessor
    /// pointer is deliberately excluded; it moves only through
    /// [`Node::update_predecessor`] (NOTIFY and bootstrap adoption) so that
    /// every predecessor change goes through the key handover.
    pub(crate) fn inform_about_existence(&self, node: &NodeInfo) {
        if node.id == self.info.id {
            return;
        }
        self.transport.mark_alive(node.id);
        self.table.update_successors(*node);
        self.table.update_fingers(*node);
    }

    /// Accepts `candidate` as the new predecessor and hands over the keys it
    /// now owns. The handed keys are deleted locally only once the transfer
    /// is acknowledged.
    pub(crate) async fn update_predecessor(self: &Arc<Self>, candidate: NodeInfo) -> bool {
        let Some(previous) = self.table.try_update_predecessor(candidate) else {
            return false;
        };
        info!(node = %self.info, pred = %candidate, "new predecessor");

        let lower = previous.map(|p| p.id).unwrap_or(self.info.id);
        let handover = self.local.range(lower, candidate.id);
        if handover.is_empty() {
            return true;
        }
        self.send_keys(candidate, handover).await
    }

    /// One key transfer per destination at a time; concurrent admissions of
    /// the same predecessor share the transfer.
    async fn send_keys(self: &Arc<Self>, dest: NodeInfo, entries: HashMap<Id, Vec<u8>>) -> bool {
        let count = entries.len();
        let rx = match self.key_sends.subscribe(dest.id) {
            Ticket::Attached(rx) => rx,
            Ticket::New(rx) => {
                debug!(dest = %dest, count, "transferring keys");
                match self
                    .send_operation(&dest, Message::SendKeys { entries })
                    .await
                {
                    Ok(()) => rx,
                    Err(e) => {
                        self.key_sends.fail(&dest.id, e);
                        self.inform_about_failure(&dest).await;
                        return false;
                    }
                }
            }
        };

        match await_outcome(rx, OPERATION_TIMEOUT).await {
            Some(Ok(success)) => success,
            Some(Err(e)) => {
                debug!(dest = %dest, "key transfer failed: {e}");
                self.inform_about_failure(&dest).await;
                false
            }
            None => {
                self.key_sends
                    .fail(&dest.id, Error::OperationTimeout(dest.id));
                self.inform_about_failure(&dest).await;
                false
            }
        }
    }

    /// Singleton predecessor request towards `peer`.
    pub(crate) async fn request_predecessor(self: &Arc<Self>, peer: NodeInfo) -> Result<NodeInfo> {
        let rx = match self.predecessor_request.subscribe(()) {
            Ticket::Attached(rx) => rx,
            Ticket::New(rx) => {
                if let Err(e) = self
                    .send_operation(&peer, Message::RequestPredecessor)
                    .await
                {
                    self.predecessor_request.fail(&(), e.clone());
                    return Err(e);
                }
                rx
            }
        };
        match await_outcome(rx, LOOKUP_TIMEOUT).await {
            Some(outcome) => outcome,
            None => {
                self.predecessor_request
                    .fail(&(), Error::LookupTimeout(peer.id));
                Err(Error::LookupTimeout(peer.id))
            }
        }
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    /// Pushes `key` to the first R-1 successors. A missing successor means
    /// the ring is too small: the copies placed so far are recorded and the
    /// stabilization task finishes the job once the ring grows. A failed
    /// send declares that successor dead and retries the same slot against
    /// the shrunk list.
    pub(crate) async fn ensure_replication(self: &Arc<Self>, key: Id, value: &[u8]) {
        let mut placed = self
            .unfinished_replications
            .get(&key)
            .map(|e| *e.value())
            .unwrap_or(1);

        while placed < self.replication_degree {
            let Some(target) = self.table.nth_successor(placed - 1) else {
                debug!(key = %key, placed, "replication shortfall recorded");
                self.unfinished_replications.insert(key, placed);
                return;
            };
            match self
                .send_operation(
                    &target,
                    Message::Replicate {
                        key,
                        value: value.to_vec(),
                    },
                )
                .await
            {
                Ok(()) => placed += 1,
                Err(e) => {
                    debug!(key = %key, target = %target, "replicate failed: {e}");
                    self.inform_about_failure(&target).await;
                }
            }
        }
        self.unfinished_replications.remove(&key);
    }

    /// Owner side of the periodic reconciliation. `claimer` says it holds
    /// replicas of this node's keys; compute what it must drop, answer, and
    /// push it whatever it is missing.
    pub(crate) async fn synchronize_replicas(
        self: &Arc<Self>,
        claimer: NodeInfo,
        claimed: std::collections::HashSet<Id>,
    ) {
        let still_replica_holder = self.table.successors_contain(&claimer);

        let keys_to_delete: std::collections::HashSet<Id> = if still_replica_holder {
            // drop only the keys this owner has since lost
            claimed
                .iter()
                .filter(|key| !self.local.contains(key))
                .copied()
                .collect()
        } else {
            // no longer in the replica set: its whole claim is invalid
            claimed.clone()
        };

        if self
            .send_operation(&claimer, Message::ReplicaSyncResult { keys_to_delete })
            .await
            .is_err()
        {
            return;
        }

        if !still_replica_holder {
            return;
        }
        let missing: Vec<(Id, Vec<u8>)> = self
            .local
            .snapshot()
            .into_iter()
            .filter(|(key, _)| !claimed.contains(key))
            .collect();
        replicate_entries(self.clone(), claimer, missing).await;
    }

    // ============================================================
    // FAILURE HANDLING
    // ============================================================

    /// Purges a failed peer from every pointer and repairs replication.
    /// Informing about the local node is a programmer error: logged, no
    /// effect on ring state.
    pub(crate) async fn inform_about_failure(self: &Arc<Self>, failed: &NodeInfo) {
        if failed.id == self.info.id {
            warn!("asked to declare the local node failed, ignoring");
            return;
        }
        warn!(node = %self.info, failed = %failed, "peer declared failed");
        self.transport.mark_dead(failed.id);

        let predecessor = self.table.predecessor();
        let removed_slot = self.table.inform_successors_of_failure(failed);
        self.table.inform_fingers_of_failure(failed);
        self.table.inform_predecessor_of_failure(failed);

        // a replica holder vanished: push everything to the promoted tail
        let tail_slot = self.replication_degree.checked_sub(2);
        if let (Some(slot), Some(tail_slot)) = (removed_slot, tail_slot) {
            if slot + 1 < self.replication_degree {
                if let Some(tail) = self.table.nth_successor(tail_slot) {
                    let entries = self.local.snapshot();
                    tokio::spawn(replicate_entries_boxed(self.clone(), tail, entries));
                }
            }
        }

        // the predecessor vanished: its keys are ours now
        if predecessor.map(|p| p.id) == Some(failed.id) {
            if let Some(promoted) = self.replicas.remove_origin(failed.id) {
                info!(
                    node = %self.info,
                    count = promoted.len(),
                    "promoting replicas of failed predecessor"
                );
                self.local.store_all(promoted.clone());
                if let Some(tail) = tail_slot.and_then(|slot| self.table.nth_successor(slot)) {
                    tokio::spawn(replicate_entries_boxed(self.clone(), tail, promoted));
                }
            }
        }
    }

    // ============================================================
    // INTROSPECTION
    // ============================================================

    /// Topology and storage dump for the STATE command.
    pub fn describe(&self) -> String {
        let mut out = self.table.describe();
        out.push_str(&format!("local keys {}\n", self.local.len()));
        for (origin, keys) in self.replicas.claims() {
            out.push_str(&format!("replicas of {origin}: {} keys\n", keys.len()));
        }
        out
    }
}

/// Sends a batch of REPLICATE messages; the first failure declares the
/// target dead and stops, stabilization will repair the rest later.
async fn replicate_entries(node: Arc<Node>, dest: NodeInfo, entries: Vec<(Id, Vec<u8>)>) {
    for (key, value) in entries {
        if let Err(e) = node
            .send_operation(&dest, Message::Replicate { key, value })
            .await
        {
            debug!(dest = %dest, "replication batch aborted: {e}");
            node.inform_about_failure(&dest).await;
            return;
        }
    }
}

/// Boxed form for spawning out of `inform_about_failure`, which the batch
/// itself may re-enter.
fn replicate_entries_boxed(
    node: Arc<Node>,
    dest: NodeInfo,
    entries: Vec<(Id, Vec<u8>)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(replicate_entries(node, dest, entries))
}

/// Feeds inbound envelopes to the handler, one task per message.
async fn pump_inbound(node: Arc<Node>, mut inbound: mpsc::Receiver<Envelope>) {
    while let Some(env) = inbound.recv().await {
        node.dispatch(env);
    }
}

/// Backoff between send attempts, with jitter so colliding retries spread.
async fn retry_pause(attempt: usize) {
    let base = (150u64 << attempt.min(3)).min(1200);
    let jitter = rand::random::<u64>() % 50;
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests;
