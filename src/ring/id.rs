//! Ring Identifier Arithmetic
//!
//! Nodes and keys share one identifier space: the integers modulo
//! 2^[`ID_BITS`]. Every comparison on the ring is a clockwise walk, so the
//! primitives here are modular addition, clockwise distance, and the
//! half-open interval test `(lower, upper]` with wrap-around.
//!
//! Identifiers are derived by hashing with SHA-1 and folding the digest into
//! the ring. All arithmetic stays in `u64`; a 160-bit production space would
//! swap the scalar for a big unsigned integer without touching callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width of the identifier space. M = 2^ID_BITS.
pub const ID_BITS: u32 = 7;

/// Number of points on the ring.
pub const RING_SIZE: u64 = 1 << ID_BITS;

/// A point on the ring, always reduced modulo [`RING_SIZE`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(u64);

impl Id {
    /// Wraps a raw integer onto the ring.
    pub fn new(raw: u64) -> Self {
        Self(raw & (RING_SIZE - 1))
    }

    /// Hashes arbitrary bytes onto the ring (SHA-1, truncated).
    pub fn hash(bytes: &[u8]) -> Self {
        let digest = Sha1::digest(bytes);
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        Self::new(u64::from_be_bytes(word))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// `(self + delta) mod M`.
    pub fn add_mod(self, delta: u64) -> Self {
        Self::new(self.0.wrapping_add(delta))
    }

    /// Clockwise steps from `self` to `other`.
    pub fn distance_to(self, other: Id) -> u64 {
        other.0.wrapping_sub(self.0) & (RING_SIZE - 1)
    }

    /// Whether `x` lies in `(lower, upper]` walking clockwise.
    ///
    /// When `lower == upper` the interval covers the whole ring, which is
    /// exactly the single-node case: that node owns every key.
    pub fn between(lower: Id, upper: Id, x: Id) -> bool {
        if lower < upper {
            x > lower && x <= upper
        } else {
            x > lower || x <= upper
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}
