//! Delete sets: compact `(client, clock, len)` range sets.
//!
//! A delete set names tombstoned ids without carrying any content. It is
//! used in two places:
//! - on the wire, after the blocks of an update, so a peer can mark
//!   content it already has as deleted
//! - inside a transaction, to remember what this transaction deleted

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::primitives::ClientId;
use super::primitives::Id;
use super::store::BlockStore;
use crate::error::DecodeError;
use crate::update::encoding::Decoder;
use crate::update::encoding::Encoder;

/// A half-open clock range `clock..clock + len` of one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    pub clock: u32,
    pub len: u32,
}

impl IdRange {
    #[inline]
    pub fn end(&self) -> u32 {
        return self.clock + self.len;
    }

    #[inline]
    pub fn contains(&self, clock: u32) -> bool {
        return clock >= self.clock && clock < self.end();
    }
}

/// Per-client lists of deleted ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteSet {
    clients: FxHashMap<ClientId, Vec<IdRange>>,
}

impl DeleteSet {
    pub fn new() -> DeleteSet {
        return DeleteSet {
            clients: FxHashMap::default(),
        };
    }

    /// Build the delete set of everything tombstoned in a store.
    pub fn from_store(store: &BlockStore) -> DeleteSet {
        let mut ds = DeleteSet::new();
        for client in store.clients() {
            for block in store.blocks(client) {
                if block.deleted {
                    ds.insert(block.id, block.len);
                }
            }
        }
        return ds;
    }

    /// Record `len` deleted ticks starting at `id`.
    ///
    /// Extends the previous range of the client when contiguous.
    pub fn insert(&mut self, id: Id, len: u32) {
        if len == 0 {
            return;
        }
        let ranges = self.clients.entry(id.client).or_default();
        if let Some(last) = ranges.last_mut() {
            if last.end() == id.clock {
                last.len += len;
                return;
            }
        }
        ranges.push(IdRange { clock: id.clock, len });
    }

    /// Check if the given id is covered by any range.
    pub fn contains(&self, id: &Id) -> bool {
        match self.clients.get(&id.client) {
            Some(ranges) => return ranges.iter().any(|r| r.contains(id.clock)),
            None => return false,
        }
    }

    /// Sort and merge overlapping or adjacent ranges.
    pub fn squash(&mut self) {
        for ranges in self.clients.values_mut() {
            ranges.sort_by_key(|r| r.clock);
            let mut merged: Vec<IdRange> = Vec::with_capacity(ranges.len());
            for range in ranges.drain(..) {
                match merged.last_mut() {
                    Some(last) if range.clock <= last.end() => {
                        let end = last.end().max(range.end());
                        last.len = end - last.clock;
                    }
                    _ => merged.push(range),
                }
            }
            *ranges = merged;
        }
        self.clients.retain(|_, ranges| !ranges.is_empty());
    }

    /// Merge all ranges of `other` into this set.
    pub fn merge(&mut self, other: DeleteSet) {
        for (client, ranges) in other.clients {
            self.clients.entry(client).or_default().extend(ranges);
        }
        self.squash();
    }

    pub fn is_empty(&self) -> bool {
        return self.clients.values().all(|r| r.is_empty());
    }

    /// Iterate `(client, range)` pairs, clients in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, IdRange)> + '_ {
        let sorted: BTreeMap<_, _> = self.clients.iter().collect();
        return sorted
            .into_iter()
            .flat_map(|(client, ranges)| ranges.iter().map(move |r| (*client, *r)));
    }

    /// Total number of deleted ticks.
    pub fn tick_count(&self) -> u64 {
        return self
            .clients
            .values()
            .flat_map(|r| r.iter())
            .map(|r| r.len as u64)
            .sum();
    }

    pub(crate) fn write(&self, encoder: &mut Encoder) {
        let sorted: BTreeMap<_, _> = self.clients.iter().filter(|(_, r)| !r.is_empty()).collect();
        encoder.write_var(sorted.len() as u64);
        for (client, ranges) in sorted {
            encoder.write_var(*client);
            encoder.write_var(ranges.len() as u64);
            for range in ranges {
                encoder.write_var(range.clock as u64);
                encoder.write_var(range.len as u64);
            }
        }
    }

    pub(crate) fn read(decoder: &mut Decoder<'_>) -> Result<DeleteSet, DecodeError> {
        let mut ds = DeleteSet::new();
        let clients = decoder.read_var()?;
        for _ in 0..clients {
            let client = decoder.read_var()?;
            let count = decoder.read_var()?;
            for _ in 0..count {
                let clock = decoder.read_var_u32()?;
                let len = decoder.read_var_u32()?;
                if clock.checked_add(len).is_none() {
                    return Err(DecodeError::InvalidBlock("delete range overflows clock"));
                }
                ds.insert(Id::new(client, clock), len);
            }
        }
        ds.squash();
        return Ok(ds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_extends_contiguous_ranges() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(1, 0), 2);
        ds.insert(Id::new(1, 2), 3);
        let ranges: Vec<_> = ds.iter().collect();
        assert_eq!(ranges, vec![(1, IdRange { clock: 0, len: 5 })]);
    }

    #[test]
    fn contains() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(1, 4), 2);
        assert!(!ds.contains(&Id::new(1, 3)));
        assert!(ds.contains(&Id::new(1, 4)));
        assert!(ds.contains(&Id::new(1, 5)));
        assert!(!ds.contains(&Id::new(1, 6)));
        assert!(!ds.contains(&Id::new(2, 4)));
    }

    #[test]
    fn squash_merges_overlaps() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(1, 10), 2);
        ds.insert(Id::new(1, 0), 3);
        ds.insert(Id::new(1, 2), 4);
        ds.squash();

        let ranges: Vec<_> = ds.iter().map(|(_, r)| r).collect();
        assert_eq!(ranges, vec![IdRange { clock: 0, len: 6 }, IdRange { clock: 10, len: 2 }]);
        assert_eq!(ds.tick_count(), 8);
    }

    #[test]
    fn zero_length_is_ignored() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(1, 0), 0);
        assert!(ds.is_empty());
    }

    #[test]
    fn wire_format_is_sorted_by_client() {
        let mut a = DeleteSet::new();
        a.insert(Id::new(9, 0), 1);
        a.insert(Id::new(2, 5), 1);

        let mut b = DeleteSet::new();
        b.insert(Id::new(2, 5), 1);
        b.insert(Id::new(9, 0), 1);

        let mut ea = Encoder::new();
        a.write(&mut ea);
        let mut eb = Encoder::new();
        b.write(&mut eb);
        assert_eq!(ea.into_bytes(), eb.into_bytes());
    }

    #[test]
    fn read_rejects_overflowing_range() {
        let mut enc = Encoder::new();
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(u32::MAX as u64);
        enc.write_var(2);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(DeleteSet::read(&mut dec).is_err());
    }
}
