//! Primitive identifier types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic integer timestamp in a configured [`crate::config::Timescale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn checked_add(self, delta: u64) -> Self {
        Timestamp(self.0.saturating_add(delta))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! monotonic_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                $name(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

monotonic_id!(OrderId);
monotonic_id!(TradeId);
monotonic_id!(EventId);

/// Local index of a book within a simulation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookId(pub u32);

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique book id: `blockIdx * blockDim + bookId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookIdCanon(pub u64);

impl BookIdCanon {
    pub fn canonicalize(block_idx: u32, block_dim: u32, book_id: BookId) -> Self {
        BookIdCanon(block_idx as u64 * block_dim as u64 + book_id.0 as u64)
    }

    /// Inverse of [`Self::canonicalize`]: recovers `(blockIdx, localBookId)`.
    pub fn decanonicalize(self, block_dim: u32) -> (u32, BookId) {
        let block_dim = block_dim as u64;
        let block_idx = (self.0 / block_dim) as u32;
        let book_id = BookId((self.0 % block_dim) as u32);
        (block_idx, book_id)
    }
}

/// Signed agent identity: negative ids are local agents, non-negative ids
/// are remote (distributed) agents routed through a validator proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub i64);

impl AgentId {
    pub fn is_local(self) -> bool {
        self.0 < 0
    }

    pub fn is_remote(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canon_roundtrip() {
        let canon = BookIdCanon::canonicalize(2, 4, BookId(1));
        assert_eq!(canon, BookIdCanon(9));
        assert_eq!(canon.decanonicalize(4), (2, BookId(1)));
    }

    #[test]
    fn agent_locality() {
        assert!(AgentId(-1).is_local());
        assert!(AgentId(0).is_remote());
    }
}
