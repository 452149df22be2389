//! In-Flight Operation Multiplexing
//!
//! One [`OperationManager`] exists per operation kind. It guarantees that at
//! most one instance of an operation is in flight per key: the first caller
//! gets a [`Ticket::New`] and must dispatch the RPC, every concurrent caller
//! for the same key attaches to the same pending outcome.
//!
//! Completion is keyed by the remote reply. An outcome that arrives after
//! its entry was removed (a late reply past a timeout) finds no waiter and
//! is dropped silently.

use std::hash::Hash;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::{Error, Result};

type Outcome<R> = Option<Result<R>>;

/// Handed to a caller by [`OperationManager::subscribe`].
pub enum Ticket<R> {
    /// First caller for this key: the RPC still has to be sent.
    New(watch::Receiver<Outcome<R>>),
    /// The same operation is already pending; share its outcome.
    Attached(watch::Receiver<Outcome<R>>),
}

impl<R> Ticket<R> {
    pub fn receiver(self) -> watch::Receiver<Outcome<R>> {
        match self {
            Ticket::New(rx) | Ticket::Attached(rx) => rx,
        }
    }
}

pub struct OperationManager<K, R> {
    ongoing: DashMap<K, watch::Sender<Outcome<R>>>,
}

impl<K, R> OperationManager<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    pub fn new() -> Self {
        Self {
            ongoing: DashMap::new(),
        }
    }

    /// Atomically joins or opens the in-flight slot for `key`.
    pub fn subscribe(&self, key: K) -> Ticket<R> {
        match self.ongoing.entry(key) {
            Entry::Occupied(entry) => Ticket::Attached(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(tx);
                Ticket::New(rx)
            }
        }
    }

    /// Completes the operation; wakes every attached waiter.
    /// Returns false when no operation was pending (late reply).
    pub fn finish(&self, key: &K, value: R) -> bool {
        match self.ongoing.remove(key) {
            Some((_, tx)) => {
                let _ = tx.send(Some(Ok(value)));
                true
            }
            None => false,
        }
    }

    /// Completes the operation exceptionally and frees the slot so a retry
    /// may open a fresh one.
    pub fn fail(&self, key: &K, error: Error) -> bool {
        match self.ongoing.remove(key) {
            Some((_, tx)) => {
                let _ = tx.send(Some(Err(error)));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.ongoing.contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.ongoing.len()
    }
}

impl<K, R> Default for OperationManager<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for a shared outcome, bounded by `timeout`.
///
/// `None` means the window expired with the operation still pending; the
/// caller decides whether to fail the slot and retry.
pub async fn await_outcome<R: Clone>(
    mut rx: watch::Receiver<Outcome<R>>,
    timeout: Duration,
) -> Option<Result<R>> {
    match tokio::time::timeout(timeout, rx.wait_for(|outcome| outcome.is_some())).await {
        Ok(Ok(outcome)) => outcome.clone(),
        // sender dropped without a verdict; treat as a transport failure
        Ok(Err(_)) => Some(Err(Error::Transport("operation abandoned".into()))),
        Err(_) => None,
    }
}
