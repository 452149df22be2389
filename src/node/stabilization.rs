//! Stabilization Task
//!
//! The periodic repair loop. Each tick verifies the successor against its
//! own predecessor pointer, announces this node to its successor, refreshes
//! one finger, finishes replication that ran short of successors, and
//! reconciles every replica bucket with the current owner of its origin.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Node, OPERATION_MAX_FAILED_ATTEMPTS};
use crate::ring::Id;
use crate::rpc::Message;

/// Fixed period between stabilization rounds.
pub const STABILIZATION_PERIOD: Duration = Duration::from_secs(5);

/// Spawns the repair loop. The first round runs one period after start,
/// giving bootstrap traffic time to settle.
pub fn spawn(node: Arc<Node>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STABILIZATION_PERIOD);
        interval.tick().await;
        loop {
            interval.tick().await;
            node.stabilization_round().await;
        }
    })
}

impl Node {
    /// One full repair round. Public so tests can drive stabilization
    /// without waiting out the period.
    pub async fn stabilization_round(self: &Arc<Self>) {
        self.stabilize_ring().await;
        self.retry_unfinished_replications().await;
        self.reconcile_replica_buckets().await;
    }

    /// The Chord stabilization step: adopt the successor's predecessor when
    /// it sits between us, notify the successor, refresh one finger.
    async fn stabilize_ring(self: &Arc<Self>) {
        let Some(successor) = self.table.successor() else {
            return;
        };

        match self.request_predecessor(successor).await {
            Ok(candidate) => {
                if candidate.id != self.info.id
                    && Id::between(self.info.id, successor.id, candidate.id)
                {
                    debug!(node = %self.info, new = %candidate, "closer successor discovered");
                    self.table.update_successors(candidate);
                    self.table.update_fingers(candidate);
                }
            }
            Err(e) => {
                warn!(successor = %successor, "stabilization probe failed: {e}");
                self.inform_about_failure(&successor).await;
                return;
            }
        }

        if let Some(successor) = self.table.successor() {
            if let Err(e) = self.send_operation(&successor, Message::Notify).await {
                debug!(successor = %successor, "notify failed: {e}");
            }
        }

        let index = self.table.next_finger_to_refresh();
        let ideal = self.info.id.add_mod(1 << index);
        if let Ok(owner) = self.lookup(ideal).await {
            self.table.set_finger(index, owner);
        }
    }

    /// Finishes replication for keys recorded short of the degree, now that
    /// the ring may have grown.
    async fn retry_unfinished_replications(self: &Arc<Self>) {
        let pending: Vec<Id> = self
            .unfinished_replications
            .iter()
            .map(|e| *e.key())
            .collect();

        for key in pending {
            match self.local.get(&key) {
                Some(value) => self.ensure_replication(key, &value).await,
                // key was deleted meanwhile; nothing left to replicate
                None => {
                    self.unfinished_replications.remove(&key);
                }
            }
        }
    }

    /// For every replica bucket, find who owns the origin's id today and
    /// offer the claimed key set for reconciliation. When the owner cannot
    /// be reached at all, the values are re-inserted into the ring so they
    /// are not stranded here.
    async fn reconcile_replica_buckets(self: &Arc<Self>) {
        for (origin, keys) in self.replicas.claims() {
            let mut attempts = 0;
            loop {
                match self.lookup(origin).await {
                    Ok(owner) if owner.id == self.info.id => {
                        // the origin's arc is ours now; its replicas are
                        // primary data
                        if let Some(promoted) = self.replicas.remove_origin(origin) {
                            info!(
                                node = %self.info,
                                count = promoted.len(),
                                "absorbing replicas of vanished origin {origin}"
                            );
                            for (key, value) in promoted {
                                self.local.insert(key, value.clone());
                                self.ensure_replication(key, &value).await;
                            }
                        }
                        break;
                    }
                    Ok(owner) => {
                        match self
                            .send_operation(&owner, Message::ReplicaSync { keys: keys.clone() })
                            .await
                        {
                            Ok(()) => break,
                            Err(e) => {
                                attempts += 1;
                                debug!(owner = %owner, "replica sync failed: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        attempts += 1;
                        debug!(origin = %origin, "replica owner lookup failed: {e}");
                    }
                }

                if attempts >= OPERATION_MAX_FAILED_ATTEMPTS {
                    self.reinsert_bucket(origin).await;
                    break;
                }
            }
        }
    }

    /// Last resort when a bucket's owner is unreachable: push the values
    /// back through the normal insert path so the current ring places them.
    async fn reinsert_bucket(self: &Arc<Self>, origin: Id) {
        let values = self.replicas.values_of(origin);
        if values.is_empty() {
            return;
        }
        warn!(
            node = %self.info,
            origin = %origin,
            count = values.len(),
            "re-inserting stranded replicas"
        );
        for (key, value) in values {
            if let Err(e) = self.insert(key, value).await {
                debug!(key = %key, "re-insert failed: {e}");
            }
        }
    }
}
