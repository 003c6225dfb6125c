use std::fmt::{Display, Formatter};

use rand::Rng;

/// A 32-bit byte-stream sequence number, interpreted modulo 2^32.
///
/// Ordering is *not* total: `a` precedes `b` iff the signed difference `a - b`
/// is negative, which makes comparison meaningful within half the sequence
/// space and lets streams run past the signed-integer boundary. `SeqNr`
/// therefore deliberately does not implement `Ord`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNr(i32);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl SeqNr {
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    /// `self < other` under wrap-around semantics
    pub fn precedes(&self, other: SeqNr) -> bool {
        self.0.wrapping_sub(other.0) < 0
    }

    /// `self + delta`, truncated to 32 bits
    pub fn plus(&self, delta: usize) -> SeqNr {
        SeqNr(self.0.wrapping_add(delta as i32))
    }

    /// A fresh stream origin, drawn uniformly from `[0, 2^31)` so that sequence
    /// starts are not predictable across sessions.
    pub fn random_initial() -> SeqNr {
        SeqNr(rand::thread_rng().gen_range(0..=i32::MAX))
    }
}
