//! Shared arrays: ordered sequences of JSON values.
//!
//! Every element is its own block, so inserting or removing is a walk to the
//! position plus an O(1) splice.

use std::ops::RangeBounds;
use std::sync::Arc;

use serde_json::Value;

use super::resolve_range;
use crate::crdt::block::Content;
use crate::crdt::store::BlockIter;
use crate::doc::Doc;
use crate::error::Error;
use crate::error::Result;
use crate::event::ArrayEvent;
use crate::event::Callback;
use crate::event::SubscriptionId;
use crate::transaction::ReadTxn;
use crate::transaction::WriteTxn;

/// Handle to an array root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArrayRef {
    name: Arc<str>,
}

impl ArrayRef {
    pub(crate) fn new(name: &str) -> ArrayRef {
        return ArrayRef { name: Arc::from(name) };
    }

    /// Name of the root.
    pub fn name(&self) -> &str {
        return &self.name;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        return txn.store().root_len(&self.name);
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        return self.len(txn) == 0;
    }

    /// Lazily iterate the visible elements, left to right.
    pub fn iter<'a, T: ReadTxn>(&self, txn: &'a T) -> ArrayIter<'a> {
        return ArrayIter {
            blocks: txn.store().iter_root(&self.name),
            chars: None,
        };
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<Value> {
        return self.iter(txn).nth(index as usize);
    }

    pub fn first<T: ReadTxn>(&self, txn: &T) -> Option<Value> {
        return self.iter(txn).next();
    }

    pub fn last<T: ReadTxn>(&self, txn: &T) -> Option<Value> {
        return self.iter(txn).last();
    }

    pub fn to_vec<T: ReadTxn>(&self, txn: &T) -> Vec<Value> {
        return self.iter(txn).collect();
    }

    /// Copy out a range of elements. The end is clamped to the length.
    pub fn slice<T: ReadTxn>(&self, txn: &T, range: impl RangeBounds<u32>) -> Result<Vec<Value>> {
        let len = self.len(txn);
        let (start, count) = resolve_range(range, len)?;
        return Ok(self.iter(txn).skip(start as usize).take(count as usize).collect());
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert values at `index`, in order.
    pub fn insert<T, V>(&self, txn: &mut T, index: u32, values: impl IntoIterator<Item = V>) -> Result<()>
    where
        T: WriteTxn,
        V: Into<Value>,
    {
        let contents: Vec<Content> = values.into_iter().map(|v| Content::Element(v.into())).collect();
        return txn.with_txn(|txn| txn.insert_contents(&self.name, index, contents, false));
    }

    /// Append values at the end.
    pub fn push<T, V>(&self, txn: &mut T, values: impl IntoIterator<Item = V>) -> Result<()>
    where
        T: WriteTxn,
        V: Into<Value>,
    {
        let contents: Vec<Content> = values.into_iter().map(|v| Content::Element(v.into())).collect();
        return txn.with_txn(|txn| {
            let len = txn.store().root_len(&self.name);
            return txn.insert_contents(&self.name, len, contents, false);
        });
    }

    /// Insert values at the front.
    pub fn unshift<T, V>(&self, txn: &mut T, values: impl IntoIterator<Item = V>) -> Result<()>
    where
        T: WriteTxn,
        V: Into<Value>,
    {
        return self.insert(txn, 0, values);
    }

    /// Remove and return the element at `index`.
    pub fn remove<T: WriteTxn>(&self, txn: &mut T, index: u32) -> Result<Value> {
        return txn.with_txn(|txn| {
            let len = txn.store().root_len(&self.name);
            if index >= len {
                return Err(Error::OutOfBounds { index, len });
            }
            let removed = txn.remove_range(&self.name, index, 1)?;
            return Ok(values(removed).into_iter().next().unwrap_or(Value::Null));
        });
    }

    /// Remove up to `len` elements starting at `index` and return them.
    pub fn remove_range<T: WriteTxn>(&self, txn: &mut T, index: u32, len: u32) -> Result<Vec<Value>> {
        return txn.with_txn(|txn| {
            let removed = txn.remove_range(&self.name, index, len)?;
            return Ok(values(removed));
        });
    }

    /// Remove up to `n` trailing elements and return them in order.
    pub fn pop<T: WriteTxn>(&self, txn: &mut T, n: u32) -> Result<Vec<Value>> {
        return txn.with_txn(|txn| {
            let len = txn.store().root_len(&self.name);
            let start = len.saturating_sub(n);
            let removed = txn.remove_range(&self.name, start, len - start)?;
            return Ok(values(removed));
        });
    }

    /// Remove a range of elements and return them. The end is clamped.
    pub fn slice_remove<T: WriteTxn>(&self, txn: &mut T, range: impl RangeBounds<u32>) -> Result<Vec<Value>> {
        return txn.with_txn(|txn| {
            let len = txn.store().root_len(&self.name);
            let (start, count) = resolve_range(range, len)?;
            let removed = txn.remove_range(&self.name, start, count)?;
            return Ok(values(removed));
        });
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Call `callback` with the delta of every committed transaction that
    /// changes this array.
    pub fn attach<F>(&self, doc: &mut Doc, callback: F) -> SubscriptionId
    where
        F: FnMut(&ArrayEvent<'_>) + Send + 'static,
    {
        return doc.observers.subscribe(self.name.clone(), Callback::Array(Box::new(callback)));
    }

    /// Stop notifications for a subscription. Returns false if it was not
    /// attached.
    pub fn detach(&self, doc: &mut Doc, id: SubscriptionId) -> bool {
        return doc.unobserve(id);
    }
}

fn values(contents: Vec<Content>) -> Vec<Value> {
    let mut out = Vec::with_capacity(contents.len());
    for content in contents {
        match content {
            Content::Element(value) | Content::Embed(value) => out.push(value),
            Content::String(s) => out.extend(s.chars().map(|c| Value::String(c.to_string()))),
            Content::Format(_) | Content::Deleted(_) => {}
        }
    }
    return out;
}

/// Iterator over the visible elements of an array.
pub struct ArrayIter<'a> {
    blocks: BlockIter<'a>,
    /// Remaining characters of a text run, if one ended up in this root.
    chars: Option<std::str::Chars<'a>>,
}

impl Iterator for ArrayIter<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chars) = &mut self.chars {
                if let Some(c) = chars.next() {
                    return Some(Value::String(c.to_string()));
                }
                self.chars = None;
            }
            let block = self.blocks.next()?;
            if block.deleted {
                continue;
            }
            match &block.content {
                Content::Element(value) | Content::Embed(value) => return Some(value.clone()),
                Content::String(s) => self.chars = Some(s.chars()),
                Content::Format(_) | Content::Deleted(_) => {}
            }
        }
    }
}
