//! Finger Table
//!
//! Per-node routing state: log2(M) finger slots, the ordered successor list
//! and the predecessor pointer. Entry `i` ideally points at the node that
//! owns `self.id + 2^i`, which is what makes lookups logarithmic.
//!
//! Every sub-structure sits behind its own lock so that readers never see a
//! torn entry; any entry may still be stale between stabilization ticks,
//! which the protocol tolerates.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::id::{Id, ID_BITS};
use super::types::NodeInfo;

pub struct FingerTable {
    own: NodeInfo,
    fingers: Vec<RwLock<Option<NodeInfo>>>,
    successors: RwLock<Vec<NodeInfo>>,
    predecessor: RwLock<Option<NodeInfo>>,
    next_refresh: AtomicUsize,
    max_successors: usize,
}

impl FingerTable {
    pub fn new(own: NodeInfo, max_successors: usize) -> Self {
        Self {
            own,
            fingers: (0..ID_BITS).map(|_| RwLock::new(None)).collect(),
            successors: RwLock::new(Vec::new()),
            predecessor: RwLock::new(None),
            next_refresh: AtomicUsize::new(0),
            max_successors,
        }
    }

    pub fn own(&self) -> NodeInfo {
        self.own
    }

    /// First entry of the successor list, if any.
    pub fn successor(&self) -> Option<NodeInfo> {
        self.successors.read().first().copied()
    }

    /// The `n`-th entry of the successor list (0 is the immediate successor).
    pub fn nth_successor(&self, n: usize) -> Option<NodeInfo> {
        self.successors.read().get(n).copied()
    }

    pub fn successors(&self) -> Vec<NodeInfo> {
        self.successors.read().clone()
    }

    pub fn successors_contain(&self, node: &NodeInfo) -> bool {
        self.successors.read().iter().any(|s| s.id == node.id)
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        *self.predecessor.read()
    }

    /// Whether this node owns `key`: key in (predecessor, self].
    /// With no predecessor the node owns the whole ring.
    pub fn owns(&self, key: Id) -> bool {
        match *self.predecessor.read() {
            Some(pred) => Id::between(pred.id, self.own.id, key),
            None => true,
        }
    }

    /// Closest known node preceding `key` in ring order; self if none beats it.
    pub fn next_best(&self, key: Id) -> NodeInfo {
        for slot in self.fingers.iter().rev() {
            if let Some(finger) = *slot.read() {
                if Id::between(self.own.id, key, finger.id) {
                    return finger;
                }
            }
        }
        self.own
    }

    /// Inserts `node` into the successor list at its clockwise position.
    /// The local node never enters its own successor list, and the list is
    /// capped at `max_successors`.
    pub fn update_successors(&self, node: NodeInfo) {
        if node.id == self.own.id {
            return;
        }
        let mut list = self.successors.write();
        if list.iter().any(|s| s.id == node.id) {
            return;
        }
        let d = self.own.id.distance_to(node.id);
        let pos = list
            .iter()
            .position(|s| self.own.id.distance_to(s.id) > d)
            .unwrap_or(list.len());
        list.insert(pos, node);
        list.truncate(self.max_successors);
    }

    /// Offers `node` to every finger slot it can serve; a slot changes only
    /// when the candidate is strictly closer to the slot's ideal id, so an
    /// equally-close incumbent stays.
    pub fn update_fingers(&self, node: NodeInfo) {
        if node.id == self.own.id {
            return;
        }
        let d = self.own.id.distance_to(node.id);
        for (i, slot) in self.fingers.iter().enumerate() {
            let span = 1u64 << i;
            if span > d {
                // node precedes this slot's ideal id; it cannot serve it,
                // nor any wider slot
                break;
            }
            let ideal = self.own.id.add_mod(span);
            let mut entry = slot.write();
            let replace = match *entry {
                Some(incumbent) => {
                    ideal.distance_to(node.id) < ideal.distance_to(incumbent.id)
                }
                None => true,
            };
            if replace {
                *entry = Some(node);
            }
        }
    }

    /// Overwrites one slot with a freshly looked-up owner. A result equal to
    /// the local node empties the slot.
    pub fn set_finger(&self, index: usize, node: NodeInfo) {
        if let Some(slot) = self.fingers.get(index) {
            *slot.write() = (node.id != self.own.id).then_some(node);
        }
    }

    pub fn finger(&self, index: usize) -> Option<NodeInfo> {
        self.fingers.get(index).and_then(|slot| *slot.read())
    }

    /// Round-robin index for the periodic finger refresh.
    pub fn next_finger_to_refresh(&self) -> usize {
        self.next_refresh.fetch_add(1, Ordering::Relaxed) % ID_BITS as usize
    }

    /// Accepts `candidate` as the new predecessor when it is strictly closer:
    /// candidate in (predecessor, self). Returns the previous pointer on
    /// acceptance, `None` when rejected. A candidate at the current
    /// predecessor's id is equality and changes nothing.
    pub fn try_update_predecessor(&self, candidate: NodeInfo) -> Option<Option<NodeInfo>> {
        if candidate.id == self.own.id {
            return None;
        }
        let mut pred = self.predecessor.write();
        let accepted = match *pred {
            Some(current) => Id::between(current.id, self.own.id, candidate.id),
            None => true,
        };
        if !accepted {
            return None;
        }
        let previous = pred.replace(candidate);
        Some(previous)
    }

    /// Drops a failed node from the successor list; returns the slot it held.
    pub fn inform_successors_of_failure(&self, node: &NodeInfo) -> Option<usize> {
        let mut list = self.successors.write();
        let pos = list.iter().position(|s| s.id == node.id)?;
        list.remove(pos);
        Some(pos)
    }

    /// Replaces every finger slot pointing at a failed node with the next
    /// live successor (or empties it when there is none).
    pub fn inform_fingers_of_failure(&self, node: &NodeInfo) {
        let replacement = self
            .successors
            .read()
            .iter()
            .find(|s| s.id != node.id)
            .copied();
        for slot in &self.fingers {
            let mut entry = slot.write();
            if entry.map(|f| f.id) == Some(node.id) {
                *entry = replacement;
            }
        }
    }

    /// Clears the predecessor if it is the failed node.
    pub fn inform_predecessor_of_failure(&self, node: &NodeInfo) -> bool {
        let mut pred = self.predecessor.write();
        if pred.map(|p| p.id) == Some(node.id) {
            *pred = None;
            true
        } else {
            false
        }
    }

    /// Human-readable topology dump for the STATE command.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("node       {}\n", self.own));
        match *self.predecessor.read() {
            Some(p) => out.push_str(&format!("pred       {p}\n")),
            None => out.push_str("pred       -\n"),
        }
        for (i, s) in self.successors.read().iter().enumerate() {
            out.push_str(&format!("succ[{i}]    {s}\n"));
        }
        for (i, slot) in self.fingers.iter().enumerate() {
            let ideal = self.own.id.add_mod(1 << i);
            match *slot.read() {
                Some(f) => out.push_str(&format!("finger[{i}] ideal {ideal} -> {f}\n")),
                None => out.push_str(&format!("finger[{i}] ideal {ideal} -> -\n")),
            }
        }
        out
    }
}
