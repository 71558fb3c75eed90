//! Conflict resolution for concurrent inserts, using the YATA rules.
//!
//! YATA (Yet Another Transformation Approach) is the algorithm used by yjs.
//! Each block stores both its left origin (what it was inserted after) and
//! its right origin (what was to its right when it was inserted). When a
//! block is integrated, every block found between its two origins is a
//! potential conflict; the rules below pick where among them it goes.
//!
//! The dual-origin approach prevents interleaving in concurrent edits: a run
//! typed by one replica stays contiguous no matter what other replicas
//! inserted at the same place.
//!
//! The resolver is a pure function over a snapshot of the conflict region,
//! so it can be tested without a live store. The store gathers the region,
//! calls [`resolve`] and splices the block in.

use std::cmp::Ordering;

use rustc_hash::FxHashSet;

use super::primitives::Id;

/// The block being integrated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub id: Id,
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
}

/// A block already present between the new block's origins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// First id of the block.
    pub id: Id,
    /// Raw left origin of the block.
    pub origin: Option<Id>,
    /// First id of the block that contains `origin`, if present.
    pub origin_block: Option<Id>,
    /// Raw right origin of the block.
    pub right_origin: Option<Id>,
}

/// Total order among siblings sharing an origin: `(client, clock)` ascending.
///
/// The sibling that sorts first is placed first.
#[inline]
pub fn sibling_order(a: &Id, b: &Id) -> Ordering {
    return a.cmp(b);
}

/// Decide how many blocks of `scan` precede the new block.
///
/// `scan` lists, in document order, the blocks strictly between the new
/// block's left neighbour (the block ending at its origin) and its right
/// origin. Returns `k` such that the new block goes right after `scan[k-1]`
/// (or right after the left neighbour when `k == 0`).
///
/// Rules, walking the region left to right with candidate `o`:
/// 1. Same origin as the new block: if `o` sorts before the new block it
///    precedes it; if instead both share the right origin, stop.
/// 2. `o`'s origin lies inside the region already walked: `o` belongs to a
///    subtree hanging off a block we already passed. It precedes the new
///    block unless its origin is in the current conflicting set.
/// 3. Otherwise `o` hangs off something left of our origin: stop.
pub fn resolve(new: &Placement, scan: &[Candidate]) -> usize {
    let mut preceding = 0;
    let mut before_origin: FxHashSet<Id> = FxHashSet::default();
    let mut conflicting: FxHashSet<Id> = FxHashSet::default();

    for (i, o) in scan.iter().enumerate() {
        before_origin.insert(o.id);
        conflicting.insert(o.id);

        if o.origin == new.origin {
            // Case 1: siblings
            if sibling_order(&o.id, &new.id) == Ordering::Less {
                preceding = i + 1;
                conflicting.clear();
            } else if o.right_origin == new.right_origin {
                // Same insertion context, and the new block sorts first
                break;
            }
        } else {
            // Case 2 / 3: different left origin
            match o.origin_block {
                Some(origin_block) if before_origin.contains(&origin_block) => {
                    if !conflicting.contains(&origin_block) {
                        preceding = i + 1;
                        conflicting.clear();
                    }
                }
                _ => break,
            }
        }
    }

    return preceding;
}
