//! State vectors: a compact summary of causal history.
//!
//! A state vector maps each client to the next clock it expects from that
//! client (an exclusive upper bound). Because every client's blocks are
//! integrated in clock order with no gaps, this single number per client
//! answers "have you seen id X?" exactly.
//!
//! Complexity:
//! - get / set: O(1)
//! - merge: O(n) where n is number of clients
//! - compare: O(n)

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::id::ClientId;
use super::id::Id;
use crate::error::DecodeError;
use crate::update::encoding::Decoder;
use crate::update::encoding::Encoder;

/// Per-client highest-seen clock, exclusive.
#[derive(Clone, Debug, Default)]
pub struct StateVector {
    /// Map from client to the next expected clock.
    entries: FxHashMap<ClientId, u32>,
}

impl StateVector {
    /// Create an empty state vector.
    pub fn new() -> StateVector {
        return StateVector {
            entries: FxHashMap::default(),
        };
    }

    /// Get the next expected clock for a client (0 if never seen).
    #[inline]
    pub fn get(&self, client: ClientId) -> u32 {
        return self.entries.get(&client).copied().unwrap_or(0);
    }

    /// Raise the entry for `client` to at least `clock`.
    ///
    /// Entries never decrease.
    pub fn set_max(&mut self, client: ClientId, clock: u32) {
        let entry = self.entries.entry(client).or_insert(0);
        *entry = (*entry).max(clock);
    }

    /// Whether this vector has seen the given id.
    #[inline]
    pub fn contains(&self, id: &Id) -> bool {
        return id.clock < self.get(id.client);
    }

    /// Merge with another state vector, taking the pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (client, clock) in &other.entries {
            self.set_max(*client, *clock);
        }
    }

    /// Check if every entry of `self` is covered by `other`.
    pub fn is_covered_by(&self, other: &StateVector) -> bool {
        return self.entries.iter().all(|(client, clock)| *clock <= other.get(*client));
    }

    /// Number of clients with a non-zero entry.
    pub fn len(&self) -> usize {
        return self.entries.values().filter(|c| **c > 0).count();
    }

    /// Check if no client has been seen.
    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Iterate over `(client, clock)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u32)> + '_ {
        return self.entries.iter().map(|(client, clock)| (*client, *clock));
    }

    /// Entries sorted by client, skipping zeros.
    pub fn to_sorted(&self) -> BTreeMap<ClientId, u32> {
        return self
            .entries
            .iter()
            .filter(|(_, clock)| **clock > 0)
            .map(|(client, clock)| (*client, *clock))
            .collect();
    }

    /// Encode to bytes, for shipping to a peer.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.write(&mut encoder);
        return encoder.into_bytes();
    }

    /// Decode from bytes produced by [`StateVector::encode`].
    pub fn decode(bytes: &[u8]) -> Result<StateVector, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let sv = StateVector::read(&mut decoder)?;
        decoder.finish()?;
        return Ok(sv);
    }

    pub(crate) fn write(&self, encoder: &mut Encoder) {
        let sorted = self.to_sorted();
        encoder.write_var(sorted.len() as u64);
        for (client, clock) in sorted {
            encoder.write_var(client);
            encoder.write_var(clock as u64);
        }
    }

    pub(crate) fn read(decoder: &mut Decoder<'_>) -> Result<StateVector, DecodeError> {
        let count = decoder.read_var()?;
        let mut sv = StateVector::new();
        for _ in 0..count {
            let client = decoder.read_var()?;
            let clock = decoder.read_var_u32()?;
            sv.set_max(client, clock);
        }
        return Ok(sv);
    }
}

impl PartialEq for StateVector {
    fn eq(&self, other: &Self) -> bool {
        // Missing entries and zero entries mean the same thing
        return self.to_sorted() == other.to_sorted();
    }
}

impl Eq for StateVector {}

impl FromIterator<(ClientId, u32)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u32)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.set_max(client, clock);
        }
        return sv;
    }
}
