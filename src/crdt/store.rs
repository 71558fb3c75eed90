//! The block store: an arena of blocks addressed by id.
//!
//! Blocks are kept per client in a `Vec` sorted by clock. Because a client's
//! blocks are only ever integrated in clock order, each vec covers the clocks
//! `0..state` with no gaps, so finding the block that holds an id is a
//! binary search.
//!
//! Each root is a doubly-linked sequence threaded through the arena by the
//! blocks' `left` / `right` links. The root only remembers its first block.
//!
//! # Splitting
//!
//! Positions and origins can fall in the middle of a run. Splitting a block
//! creates two adjacent blocks covering the same ids, so the visible order
//! never changes. Commit squashes the halves back together where possible.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::block::Block;
use super::block::Content;
use super::delete_set::DeleteSet;
use super::primitives::ClientId;
use super::primitives::Id;
use super::primitives::StateVector;
use super::yata;
use super::yata::Candidate;
use super::yata::Placement;
use crate::error::Error;
use crate::error::Result;

// =============================================================================
// Lookup
// =============================================================================

/// Index of the block containing `clock`, if any.
///
/// O(log n) in the number of blocks of the client.
pub(crate) fn find_pivot(blocks: &[Block], clock: u32) -> Option<usize> {
    let idx = blocks.partition_point(|b| b.id.clock + b.len <= clock);
    if idx < blocks.len() && blocks[idx].contains(clock) {
        return Some(idx);
    }
    return None;
}

/// Where a new block goes: between two adjacent blocks of a root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    /// First id of the block to the left (None = start of root).
    pub left: Option<Id>,
    /// First id of the block to the right (None = end of root).
    pub right: Option<Id>,
}

// =============================================================================
// Block store
// =============================================================================

/// All blocks of a document, plus the entry point of every root.
#[derive(Clone, Debug, Default)]
pub struct BlockStore {
    clients: FxHashMap<ClientId, Vec<Block>>,
    /// Root name to the first block of its sequence.
    roots: FxHashMap<Arc<str>, Option<Id>>,
}

impl BlockStore {
    pub fn new() -> BlockStore {
        return BlockStore::default();
    }

    /// Every client with at least one block.
    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        return self.clients.keys().copied();
    }

    /// Blocks of one client, sorted by clock.
    pub fn blocks(&self, client: ClientId) -> &[Block] {
        match self.clients.get(&client) {
            Some(blocks) => return blocks,
            None => return &[],
        }
    }

    pub fn contains_client(&self, client: ClientId) -> bool {
        return self.clients.contains_key(&client);
    }

    /// Next clock expected from `client`.
    pub fn state(&self, client: ClientId) -> u32 {
        match self.clients.get(&client).and_then(|blocks| blocks.last()) {
            Some(last) => return last.id.clock + last.len,
            None => return 0,
        }
    }

    pub fn state_vector(&self) -> StateVector {
        return self
            .clients
            .keys()
            .map(|client| (*client, self.state(*client)))
            .collect();
    }

    /// Whether the id has been integrated.
    #[inline]
    pub fn contains(&self, id: &Id) -> bool {
        return id.clock < self.state(id.client);
    }

    /// The block containing `id`.
    pub fn get(&self, id: Id) -> Option<&Block> {
        let blocks = self.clients.get(&id.client)?;
        let idx = find_pivot(blocks, id.clock)?;
        return Some(&blocks[idx]);
    }

    pub(crate) fn get_mut(&mut self, id: Id) -> Option<&mut Block> {
        let blocks = self.clients.get_mut(&id.client)?;
        let idx = find_pivot(blocks, id.clock)?;
        return Some(&mut blocks[idx]);
    }

    /// The shared name of a root, creating the root if needed.
    pub fn root(&mut self, name: &str) -> Arc<str> {
        if let Some((key, _)) = self.roots.get_key_value(name) {
            return key.clone();
        }
        let key: Arc<str> = Arc::from(name);
        self.roots.insert(key.clone(), None);
        return key;
    }

    /// First block of a root.
    pub fn root_start(&self, name: &str) -> Option<Id> {
        return self.roots.get(name).copied().flatten();
    }

    /// Iterate every block of a root in document order, tombstones included.
    pub fn iter_root(&self, name: &str) -> BlockIter<'_> {
        return BlockIter {
            store: self,
            next: self.root_start(name),
        };
    }

    /// Number of visible positions in a root.
    pub fn root_len(&self, name: &str) -> u32 {
        return self.iter_root(name).map(|b| b.visible_len()).sum();
    }

    // =========================================================================
    // Splitting
    // =========================================================================

    /// Make `id` the first id of its block, splitting if it falls inside one.
    pub(crate) fn split_before(&mut self, id: Id) {
        let Some(blocks) = self.clients.get_mut(&id.client) else {
            return;
        };
        let Some(idx) = find_pivot(blocks, id.clock) else {
            return;
        };
        let offset = id.clock - blocks[idx].id.clock;
        if offset == 0 {
            return;
        }

        let right = blocks[idx].split(offset);
        let right_id = right.id;
        let next = right.right;
        blocks.insert(idx + 1, right);

        if let Some(next) = next {
            if let Some(block) = self.get_mut(next) {
                block.left = Some(right_id);
            }
        }
    }

    /// Make `id` the last id of its block.
    pub(crate) fn split_after(&mut self, id: Id) {
        self.split_before(id.offset(1));
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Resolve a visible index into the pair of blocks around it.
    ///
    /// Splits a run when `index` falls inside it. With `skip_zero_width`
    /// the position moves past any tombstones and markers that follow,
    /// otherwise it stops right after the `index`-th visible position.
    pub fn find_position(&mut self, root: &str, index: u32, skip_zero_width: bool) -> Result<Position> {
        let mut remaining = index;
        let mut left: Option<Id> = None;
        let mut cursor = self.root_start(root);

        while let Some(id) = cursor {
            let Some(block) = self.get(id) else {
                break;
            };
            let visible = block.visible_len();
            let next = block.right;

            if remaining == 0 {
                if skip_zero_width && visible == 0 {
                    left = Some(id);
                    cursor = next;
                    continue;
                }
                break;
            }

            if visible > remaining {
                let split_at = id.offset(remaining);
                self.split_before(split_at);
                left = Some(id);
                cursor = Some(split_at);
                remaining = 0;
                break;
            }

            remaining -= visible;
            left = Some(id);
            cursor = next;
        }

        if remaining > 0 {
            return Err(Error::OutOfBounds {
                index,
                len: index - remaining,
            });
        }

        return Ok(Position { left, right: cursor });
    }

    /// Create a local block between two adjacent blocks and integrate it.
    ///
    /// Returns the id of the new block.
    pub fn insert_between(&mut self, root: &Arc<str>, client: ClientId, at: Position, content: Content) -> Id {
        let origin = at.left.and_then(|left| self.get(left)).map(|b| b.last_id());
        let id = Id::new(client, self.state(client));
        let block = Block::new(id, origin, at.right, root.clone(), content);
        self.integrate(block);
        return id;
    }

    // =========================================================================
    // Integration
    // =========================================================================

    /// Place a block into its root, resolving concurrent inserts.
    ///
    /// The block's clock must be the next clock of its client and both of its
    /// origins must already be present. Returns false (and leaves the store
    /// untouched) if the block is a duplicate or cannot be placed.
    pub fn integrate(&mut self, mut block: Block) -> bool {
        let id = block.id;
        if block.len == 0 || id.clock != self.state(id.client) {
            return false;
        }
        if block.origin.is_some_and(|o| !self.contains(&o)) {
            return false;
        }
        if block.right_origin.is_some_and(|r| !self.contains(&r)) {
            return false;
        }
        block.parent = self.root(&block.parent);

        // Left neighbour: the block ending at the origin.
        let left = match block.origin {
            Some(origin) => {
                self.split_after(origin);
                self.get(origin).map(|b| b.id)
            }
            None => None,
        };

        // Right limit: the block starting at the right origin.
        if let Some(right_origin) = block.right_origin {
            self.split_before(right_origin);
        }

        let start = match left {
            Some(left) => self.get(left).and_then(|b| b.right),
            None => self.root_start(&block.parent),
        };

        let mut scan: SmallVec<[Candidate; 8]> = SmallVec::new();
        let mut cursor = start;
        while let Some(cid) = cursor {
            if Some(cid) == block.right_origin {
                break;
            }
            let Some(other) = self.get(cid) else {
                break;
            };
            scan.push(Candidate {
                id: other.id,
                origin: other.origin,
                origin_block: other.origin.and_then(|o| self.get(o)).map(|b| b.id),
                right_origin: other.right_origin,
            });
            cursor = other.right;
        }

        let placement = Placement {
            id,
            origin: block.origin,
            right_origin: block.right_origin,
        };
        let preceding = yata::resolve(&placement, &scan);

        let new_left = match preceding {
            0 => left,
            k => Some(scan[k - 1].id),
        };
        let new_right = match new_left {
            Some(l) => self.get(l).and_then(|b| b.right),
            None => self.root_start(&block.parent),
        };

        tracing::trace!(
            id = %id,
            root = %block.parent,
            len = block.len,
            conflicts = scan.len(),
            "integrate block"
        );

        block.left = new_left;
        block.right = new_right;

        match new_left {
            Some(l) => {
                if let Some(left_block) = self.get_mut(l) {
                    left_block.right = Some(id);
                }
            }
            None => {
                self.roots.insert(block.parent.clone(), Some(id));
            }
        }
        if let Some(r) = new_right {
            if let Some(right_block) = self.get_mut(r) {
                right_block.left = Some(id);
            }
        }

        self.clients.entry(id.client).or_default().push(block);
        return true;
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Tombstone `len` visible positions starting at `index`.
    ///
    /// Truncates at the end of the root. Returns the first id of every block
    /// that was deleted; their content is still in place.
    pub fn delete_range(&mut self, root: &str, index: u32, len: u32) -> Result<Vec<Id>> {
        if len == 0 {
            let total = self.root_len(root);
            if index > total {
                return Err(Error::OutOfBounds { index, len: total });
            }
            return Ok(Vec::new());
        }

        let position = self.find_position(root, index, false)?;
        let mut deleted = Vec::new();
        let mut remaining = len;
        let mut cursor = position.right;

        while remaining > 0 {
            let Some(id) = cursor else {
                break;
            };
            let Some(block) = self.get(id) else {
                break;
            };
            let visible = block.visible_len();
            if visible == 0 {
                cursor = block.right;
                continue;
            }
            if visible > remaining {
                self.split_before(id.offset(remaining));
            }
            let Some(block) = self.get_mut(id) else {
                break;
            };
            block.deleted = true;
            remaining -= block.len;
            cursor = block.right;
            deleted.push(id);
        }

        return Ok(deleted);
    }

    /// Tombstone every integrated id in `clock..clock + len` of a client.
    ///
    /// Returns the first id of every block newly deleted. Ids at or past the
    /// client's state are ignored.
    pub fn delete_id_range(&mut self, client: ClientId, clock: u32, len: u32) -> Vec<Id> {
        let end = clock.saturating_add(len).min(self.state(client));
        if end <= clock {
            return Vec::new();
        }
        self.split_before(Id::new(client, clock));
        self.split_before(Id::new(client, end));

        let Some(blocks) = self.clients.get_mut(&client) else {
            return Vec::new();
        };
        let start = blocks.partition_point(|b| b.id.clock + b.len <= clock);
        let mut deleted = Vec::new();
        for block in &mut blocks[start..] {
            if block.id.clock >= end {
                break;
            }
            if !block.deleted {
                block.deleted = true;
                deleted.push(block.id);
            }
        }
        return deleted;
    }

    // =========================================================================
    // Commit housekeeping
    // =========================================================================

    /// Drop the content of every deleted block covered by `ds`.
    pub fn gc(&mut self, ds: &DeleteSet) {
        for (client, range) in ds.iter() {
            let Some(blocks) = self.clients.get_mut(&client) else {
                continue;
            };
            let start = blocks.partition_point(|b| b.id.clock + b.len <= range.clock);
            for block in &mut blocks[start..] {
                if block.id.clock >= range.end() {
                    break;
                }
                block.gc();
            }
        }
    }

    /// Squash runs created or touched since `before`.
    ///
    /// Covers blocks at or past `before` for every client, and the blocks
    /// around every range of `ds`.
    pub fn squash(&mut self, before: &StateVector, ds: &DeleteSet) {
        let clients: SmallVec<[ClientId; 8]> = self.clients.keys().copied().collect();
        for client in clients {
            let from = before.get(client);
            let to = self.state(client);
            if from < to {
                self.squash_client(client, from, to);
            }
        }
        for (client, range) in ds.iter() {
            self.squash_client(client, range.clock, range.end());
        }
    }

    /// Squash blocks of one client overlapping `from..=to` into their left
    /// neighbours where possible.
    fn squash_client(&mut self, client: ClientId, from: u32, to: u32) {
        let Some(blocks) = self.clients.get_mut(&client) else {
            return;
        };
        if blocks.len() < 2 {
            return;
        }
        let first = blocks.partition_point(|b| b.id.clock + b.len <= from).max(1);
        let last = find_pivot(blocks, to).unwrap_or(blocks.len() - 1);

        let mut relink: SmallVec<[(Id, Id); 4]> = SmallVec::new();
        let mut i = last;
        while i >= first {
            if blocks[i - 1].can_squash(&blocks[i]) {
                let right = blocks.remove(i);
                let next = right.right;
                let left_id = blocks[i - 1].id;
                blocks[i - 1].squash(right);
                if let Some(next) = next {
                    relink.push((next, left_id));
                }
            }
            i -= 1;
        }

        for (next, left_id) in relink {
            if let Some(block) = self.get_mut(next) {
                block.left = Some(left_id);
            }
        }
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Iterator over a root's blocks in document order.
pub struct BlockIter<'a> {
    store: &'a BlockStore,
    next: Option<Id>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.store.get(self.next?)?;
        self.next = block.right;
        return Some(block);
    }
}
