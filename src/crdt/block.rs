//! Blocks: the atomic unit of content in the store.
//!
//! Each block represents a run of content inserted by one client with
//! consecutive clocks. Blocks form a doubly-linked list per root in
//! document order.
//!
//! The YATA insight is dual origins:
//! - `origin`: the id that was immediately left when this was inserted
//! - `right_origin`: the id that was immediately right when this was inserted
//!
//! Origins are immutable and capture the insertion context, which is what
//! lets every replica place concurrent inserts identically. The `left` /
//! `right` links are the *current* neighbours and change only when a
//! neighbour splits or squashes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::primitives::Id;

/// Formatting attributes carried by a text marker.
///
/// A `Value::Null` entry removes the attribute.
pub type Attrs = BTreeMap<String, Value>;

/// What a block holds.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    /// A tombstone whose original content was dropped; spans `n` clocks.
    Deleted(u32),
    /// A run of characters, one clock per `char`.
    String(String),
    /// An opaque value inside text: one position, no characters.
    Embed(Value),
    /// A single array element.
    Element(Value),
    /// A zero-width formatting marker.
    Format(Attrs),
}

impl Content {
    /// Number of clock ticks this content spans.
    pub fn len(&self) -> u32 {
        match self {
            Content::Deleted(len) => return *len,
            Content::String(s) => return s.chars().count() as u32,
            Content::Embed(_) | Content::Element(_) | Content::Format(_) => return 1,
        }
    }

    /// Whether the content has no clock ticks at all.
    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Whether this content occupies positions in the visible sequence.
    pub fn is_countable(&self) -> bool {
        return matches!(self, Content::String(_) | Content::Embed(_) | Content::Element(_));
    }

    /// Split at `offset` clock ticks, returning the right part.
    ///
    /// Only runs split; single-tick content never reaches here because no
    /// boundary can fall inside it.
    fn split(&mut self, offset: u32) -> Content {
        match self {
            Content::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                return Content::Deleted(right);
            }
            Content::String(s) => {
                let at = char_to_byte(s, offset);
                return Content::String(s.split_off(at));
            }
            _ => unreachable!("single-tick content cannot split"),
        }
    }

    /// The content with its first `offset` ticks removed.
    pub(crate) fn sliced(&self, offset: u32) -> Content {
        if offset == 0 {
            return self.clone();
        }
        match self {
            Content::Deleted(len) => return Content::Deleted(*len - offset),
            Content::String(s) => return Content::String(s[char_to_byte(s, offset)..].to_string()),
            other => return other.clone(),
        }
    }

    /// Small tag used on the wire.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Content::Deleted(_) => return TAG_DELETED,
            Content::String(_) => return TAG_STRING,
            Content::Embed(_) => return TAG_EMBED,
            Content::Element(_) => return TAG_ELEMENT,
            Content::Format(_) => return TAG_FORMAT,
        }
    }
}

pub(crate) const TAG_DELETED: u8 = 0;
pub(crate) const TAG_STRING: u8 = 1;
pub(crate) const TAG_EMBED: u8 = 2;
pub(crate) const TAG_ELEMENT: u8 = 3;
pub(crate) const TAG_FORMAT: u8 = 4;

/// Byte index of the `offset`-th char of `s`.
fn char_to_byte(s: &str, offset: u32) -> usize {
    return s
        .char_indices()
        .nth(offset as usize)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
}

/// A block in the store.
#[derive(Clone, Debug)]
pub struct Block {
    /// Id of the first clock tick.
    pub id: Id,
    /// Number of clock ticks.
    pub len: u32,
    /// Id immediately left at insertion time (None = start of root).
    pub origin: Option<Id>,
    /// Id immediately right at insertion time (None = end of root).
    pub right_origin: Option<Id>,
    /// Current left neighbour (first id of that block).
    pub left: Option<Id>,
    /// Current right neighbour (first id of that block).
    pub right: Option<Id>,
    /// Name of the root this block belongs to.
    pub parent: Arc<str>,
    /// Whether this block has been deleted (tombstone).
    pub deleted: bool,
    /// The content.
    pub content: Content,
}

impl Block {
    /// Create an unlinked block.
    pub fn new(
        id: Id,
        origin: Option<Id>,
        right_origin: Option<Id>,
        parent: Arc<str>,
        content: Content,
    ) -> Block {
        let deleted = matches!(content, Content::Deleted(_));
        return Block {
            id,
            len: content.len(),
            origin,
            right_origin,
            left: None,
            right: None,
            parent,
            deleted,
            content,
        };
    }

    /// Id of the last clock tick.
    #[inline]
    pub fn last_id(&self) -> Id {
        return self.id.offset(self.len - 1);
    }

    /// Check if this block contains the given clock of its client.
    #[inline]
    pub fn contains(&self, clock: u32) -> bool {
        return clock >= self.id.clock && clock < self.id.clock + self.len;
    }

    /// Whether this block occupies positions when not deleted.
    #[inline]
    pub fn is_countable(&self) -> bool {
        return self.content.is_countable();
    }

    /// Number of visible positions (0 if deleted or zero-width).
    #[inline]
    pub fn visible_len(&self) -> u32 {
        if self.deleted || !self.is_countable() {
            return 0;
        }
        return self.len;
    }

    /// Split this block at the given offset, returning the right part.
    ///
    /// After split:
    /// - self contains [0, offset)
    /// - returned block contains [offset, len)
    ///
    /// The right part's origin becomes the last tick of the left part. Both
    /// parts keep the original right origin. Links are wired between the
    /// halves; the caller fixes the back-link of the old right neighbour.
    pub fn split(&mut self, offset: u32) -> Block {
        debug_assert!(offset > 0 && offset < self.len);

        let right_id = self.id.offset(offset);
        let right = Block {
            id: right_id,
            len: self.len - offset,
            origin: Some(self.id.offset(offset - 1)),
            right_origin: self.right_origin,
            left: Some(self.id),
            right: self.right,
            parent: self.parent.clone(),
            deleted: self.deleted,
            content: self.content.split(offset),
        };

        self.len = offset;
        self.right = Some(right_id);

        return right;
    }

    /// Check if `right` can be folded back into this block.
    ///
    /// Blocks squash when they are direct neighbours from the same client
    /// with consecutive clocks, `right` was typed straight after `self`,
    /// both share a right origin and deletion state, and both hold runs of
    /// the same kind.
    pub fn can_squash(&self, right: &Block) -> bool {
        let same_kind = matches!(
            (&self.content, &right.content),
            (Content::String(_), Content::String(_)) | (Content::Deleted(_), Content::Deleted(_))
        );
        return same_kind
            && self.id.client == right.id.client
            && self.id.clock + self.len == right.id.clock
            && self.right == Some(right.id)
            && right.origin == Some(self.last_id())
            && self.right_origin == right.right_origin
            && self.deleted == right.deleted;
    }

    /// Fold `right` into this block. Assumes `can_squash` returned true.
    pub fn squash(&mut self, right: Block) {
        match (&mut self.content, right.content) {
            (Content::String(s), Content::String(r)) => s.push_str(&r),
            (Content::Deleted(len), Content::Deleted(r)) => *len += r,
            _ => unreachable!("squash of mismatched content"),
        }
        self.len += right.len;
        self.right = right.right;
    }

    /// Drop the content of a deleted block, keeping only the tombstone.
    pub fn gc(&mut self) {
        if self.deleted {
            self.content = Content::Deleted(self.len);
        }
    }
}
