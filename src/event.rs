//! Change events: per-commit deltas and the observer table.
//!
//! A delta describes one transaction's net visible effect on one root as a
//! list of positional operations, replayed left to right against the
//! sequence as it was before the transaction:
//!
//! - `Retain(n)`: keep the next `n` elements
//! - `Added(items)`: insert `items` at the cursor
//! - `Removed(n)`: drop the next `n` elements
//!
//! Deltas are computed in a single walk over the root: blocks created by the
//! transaction and still visible are additions, blocks that existed before
//! and were deleted by the transaction are removals, everything else that
//! is visible is retained.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::Value;

use crate::crdt::block::Content;
use crate::crdt::delete_set::DeleteSet;
use crate::crdt::primitives::StateVector;
use crate::crdt::store::BlockStore;

// =============================================================================
// Deltas
// =============================================================================

/// One positional operation of a delta.
///
/// Serializes as `{"retain": n}`, `{"added": [...]}` or `{"removed": n}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delta<T> {
    Retain(u32),
    Added(T),
    Removed(u32),
}

/// Delta of an array root.
pub type ArrayDelta = Delta<Vec<Value>>;

/// Delta of a text root.
pub type TextDelta = Delta<Vec<TextChunk>>;

/// A piece of inserted text content.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextChunk {
    Text(String),
    Embed(Value),
}

/// Items of an `Added` operation.
pub trait Insertion: Sized {
    /// Fold `next` into `self`, or hand it back if the two stay separate.
    fn absorb(&mut self, next: Self) -> Option<Self> {
        return Some(next);
    }
}

impl Insertion for Value {}

impl Insertion for TextChunk {
    fn absorb(&mut self, next: Self) -> Option<Self> {
        match (self, next) {
            (TextChunk::Text(left), TextChunk::Text(right)) => {
                left.push_str(&right);
                return None;
            }
            (_, next) => return Some(next),
        }
    }
}

/// Accumulates a delta, merging neighbours of the same kind.
#[derive(Debug)]
pub(crate) struct DeltaBuilder<T> {
    ops: Vec<Delta<Vec<T>>>,
}

impl<T: Insertion> DeltaBuilder<T> {
    pub(crate) fn new() -> DeltaBuilder<T> {
        return DeltaBuilder { ops: Vec::new() };
    }

    pub(crate) fn retain(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        if let Some(Delta::Retain(count)) = self.ops.last_mut() {
            *count += n;
            return;
        }
        self.ops.push(Delta::Retain(n));
    }

    pub(crate) fn remove(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        if let Some(Delta::Removed(count)) = self.ops.last_mut() {
            *count += n;
            return;
        }
        self.ops.push(Delta::Removed(n));
    }

    pub(crate) fn add(&mut self, item: T) {
        if let Some(Delta::Added(items)) = self.ops.last_mut() {
            let rest = match items.last_mut() {
                Some(last) => last.absorb(item),
                None => Some(item),
            };
            if let Some(item) = rest {
                items.push(item);
            }
            return;
        }
        self.ops.push(Delta::Added(vec![item]));
    }

    /// The finished delta, without trailing retains.
    pub(crate) fn finish(mut self) -> Vec<Delta<Vec<T>>> {
        while let Some(Delta::Retain(_)) = self.ops.last() {
            self.ops.pop();
        }
        return self.ops;
    }
}

/// Walk a root once and build its delta for the transaction described by
/// `before` (state at open) and `deleted` (ids deleted by it).
fn compute<T: Insertion>(
    store: &BlockStore,
    root: &str,
    before: &StateVector,
    deleted: &DeleteSet,
    mut emit: impl FnMut(&Content, &mut DeltaBuilder<T>),
) -> Vec<Delta<Vec<T>>> {
    let mut builder = DeltaBuilder::new();
    for block in store.iter_root(root) {
        if !block.is_countable() {
            continue;
        }
        let inserted = block.id.clock >= before.get(block.id.client);
        if block.deleted {
            if !inserted && deleted.contains(&block.id) {
                builder.remove(block.len);
            }
        } else if inserted {
            emit(&block.content, &mut builder);
        } else {
            builder.retain(block.len);
        }
    }
    return builder.finish();
}

pub(crate) fn array_delta(
    store: &BlockStore,
    root: &str,
    before: &StateVector,
    deleted: &DeleteSet,
) -> Vec<ArrayDelta> {
    return compute(store, root, before, deleted, |content, builder| match content {
        Content::Element(value) | Content::Embed(value) => builder.add(value.clone()),
        Content::String(s) => {
            for c in s.chars() {
                builder.add(Value::String(c.to_string()));
            }
        }
        Content::Format(_) | Content::Deleted(_) => {}
    });
}

pub(crate) fn text_delta(
    store: &BlockStore,
    root: &str,
    before: &StateVector,
    deleted: &DeleteSet,
) -> Vec<TextDelta> {
    return compute(store, root, before, deleted, |content, builder| match content {
        Content::String(s) => builder.add(TextChunk::Text(s.clone())),
        Content::Embed(value) | Content::Element(value) => builder.add(TextChunk::Embed(value.clone())),
        Content::Format(_) | Content::Deleted(_) => {}
    });
}

// =============================================================================
// Events
// =============================================================================

/// Handle returned by `attach`, used to detach an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "#{}", self.0);
    }
}

/// What an observer receives on commit.
pub struct Event<'a, T> {
    root: &'a str,
    delta: &'a [T],
    subscription: SubscriptionId,
    detached: &'a RefCell<Vec<SubscriptionId>>,
}

pub type ArrayEvent<'a> = Event<'a, ArrayDelta>;
pub type TextEvent<'a> = Event<'a, TextDelta>;

impl<'a, T> Event<'a, T> {
    /// Name of the root that changed.
    pub fn root(&self) -> &str {
        return self.root;
    }

    pub fn delta(&self) -> &[T] {
        return self.delta;
    }

    /// The subscription this event is delivered to.
    pub fn subscription(&self) -> SubscriptionId {
        return self.subscription;
    }

    /// Detach an observer. Takes effect once the current dispatch finishes.
    pub fn detach(&self, id: SubscriptionId) {
        self.detached.borrow_mut().push(id);
    }

    /// Detach the observer receiving this event.
    pub fn unsubscribe(&self) {
        self.detach(self.subscription);
    }
}

impl<T: fmt::Debug> fmt::Debug for Event<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Event")
            .field("root", &self.root)
            .field("delta", &self.delta)
            .field("subscription", &self.subscription)
            .finish();
    }
}

// =============================================================================
// Observers
// =============================================================================

pub(crate) type ArrayCallback = Box<dyn FnMut(&ArrayEvent<'_>) + Send>;
pub(crate) type TextCallback = Box<dyn FnMut(&TextEvent<'_>) + Send>;

pub(crate) enum Callback {
    Array(ArrayCallback),
    Text(TextCallback),
}

struct Observer {
    root: Arc<str>,
    callback: Callback,
}

/// Observer table of one document, in subscription order.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: u32,
    entries: BTreeMap<SubscriptionId, Observer>,
}

impl Observers {
    pub(crate) fn subscribe(&mut self, root: Arc<str>, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Observer { root, callback });
        return id;
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        return self.entries.remove(&id).is_some();
    }

    /// Deliver the deltas of a committing transaction.
    ///
    /// Each root's delta is computed at most once per kind, and only if
    /// someone is listening. Observers with an empty delta are not called.
    pub(crate) fn dispatch(
        &mut self,
        store: &BlockStore,
        before: &StateVector,
        deleted: &DeleteSet,
        changed: &FxHashSet<Arc<str>>,
    ) {
        if self.entries.is_empty() || changed.is_empty() {
            return;
        }

        let detached = RefCell::new(Vec::new());
        let mut array_cache: FxHashMap<Arc<str>, Vec<ArrayDelta>> = FxHashMap::default();
        let mut text_cache: FxHashMap<Arc<str>, Vec<TextDelta>> = FxHashMap::default();

        for (id, observer) in self.entries.iter_mut() {
            if !changed.contains(&observer.root) {
                continue;
            }
            let root = &observer.root;
            match &mut observer.callback {
                Callback::Array(callback) => {
                    let delta = array_cache
                        .entry(root.clone())
                        .or_insert_with(|| array_delta(store, root, before, deleted));
                    if delta.is_empty() {
                        continue;
                    }
                    callback(&Event {
                        root: root.as_ref(),
                        delta: delta.as_slice(),
                        subscription: *id,
                        detached: &detached,
                    });
                }
                Callback::Text(callback) => {
                    let delta = text_cache
                        .entry(root.clone())
                        .or_insert_with(|| text_delta(store, root, before, deleted));
                    if delta.is_empty() {
                        continue;
                    }
                    callback(&Event {
                        root: root.as_ref(),
                        delta: delta.as_slice(),
                        subscription: *id,
                        detached: &detached,
                    });
                }
            }
        }

        for id in detached.into_inner() {
            self.entries.remove(&id);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.debug_struct("Observers").field("count", &self.entries.len()).finish();
    }
}
