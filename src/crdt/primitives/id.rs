//! Identifier types for blocks.
//!
//! # Identifier Hierarchy
//!
//! - `ClientId`: identifies a replica, picked at random when a document opens
//! - `Id`: identifies one clock tick of one client, `(client, clock)`
//!
//! A block spanning `len` ticks owns the ids `clock..clock + len` of its
//! client. Links between blocks always name the *first* id of the target
//! block; origins name any id, usually the last one of a block.

use std::cmp::Ordering;
use std::fmt;

use rand_core::OsRng;
use rand_core::RngCore;

/// A replica identifier.
pub type ClientId = u64;

/// Pick a fresh random client id.
pub fn random_client_id() -> ClientId {
    return OsRng.next_u64();
}

/// A globally unique identifier for one clock tick of one client.
///
/// Ids are totally ordered by `(client, clock)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Id {
    /// The replica that produced this id.
    pub client: ClientId,
    /// Monotonic per-client sequence number.
    pub clock: u32,
}

impl Id {
    /// Create a new id.
    pub fn new(client: ClientId, clock: u32) -> Id {
        return Id { client, clock };
    }

    /// The id `offset` ticks further along the same client.
    #[inline]
    pub fn offset(&self, offset: u32) -> Id {
        return Id {
            client: self.client,
            clock: self.clock + offset,
        };
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.client.cmp(&other.client) {
            Ordering::Equal => self.clock.cmp(&other.clock),
            other => other,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}:{}", self.client, self.clock);
    }
}
