//! Transactions: the single mutation scope of a document.
//!
//! A [`Transaction`] exclusively borrows its [`Doc`], so there is never more
//! than one open at a time. It records what changed and, on commit:
//!
//! 1. dispatches deltas to observers of every touched root
//! 2. drops the content of deleted blocks (when gc is on)
//! 3. squashes runs split or created during the transaction
//!
//! Dropping an open transaction commits it, so early returns and `?` never
//! leave a half-finished transaction behind.
//!
//! Every mutation in the crate goes through [`WriteTxn::with_txn`]. `Doc`
//! implements it by opening and committing a transaction around the call;
//! `Transaction` implements it by joining the transaction.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::crdt::block::Content;
use crate::crdt::delete_set::DeleteSet;
use crate::crdt::primitives::ClientId;
use crate::crdt::primitives::Id;
use crate::crdt::primitives::StateVector;
use crate::crdt::store::BlockStore;
use crate::crdt::store::Position;
use crate::doc::Doc;
use crate::error::Error;
use crate::error::Result;
use crate::types::array::ArrayRef;
use crate::types::text::TextRef;
use crate::update::Integration;
use crate::update::Update;

// =============================================================================
// Access traits
// =============================================================================

/// Read access to a document.
pub trait ReadTxn {
    fn store(&self) -> &BlockStore;

    /// Current state vector.
    fn state_vector(&self) -> StateVector {
        return self.store().state_vector();
    }
}

/// Write access to a document.
pub trait WriteTxn: ReadTxn {
    /// Run `f` inside a transaction.
    fn with_txn<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R>;
}

impl ReadTxn for Doc {
    fn store(&self) -> &BlockStore {
        return &self.store;
    }
}

impl WriteTxn for Doc {
    fn with_txn<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut txn = self.transact();
        let result = f(&mut txn);
        txn.commit();
        return result;
    }
}

impl ReadTxn for Transaction<'_> {
    fn store(&self) -> &BlockStore {
        return &self.doc.store;
    }
}

impl WriteTxn for Transaction<'_> {
    fn with_txn<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        self.ensure_open()?;
        return f(self);
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Open,
    Committing,
    Closed,
}

/// An open mutation scope over a document.
pub struct Transaction<'doc> {
    doc: &'doc mut Doc,
    state: State,
    /// State vector when the transaction opened.
    before_state: StateVector,
    /// Ids deleted by this transaction.
    deleted: DeleteSet,
    /// Roots touched by this transaction.
    changed: FxHashSet<Arc<str>>,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(doc: &'doc mut Doc) -> Transaction<'doc> {
        let before_state = doc.store.state_vector();
        return Transaction {
            doc,
            state: State::Open,
            before_state,
            deleted: DeleteSet::new(),
            changed: FxHashSet::default(),
        };
    }

    pub fn is_open(&self) -> bool {
        return self.state == State::Open;
    }

    /// Client id stamped on blocks created by this transaction.
    pub fn client_id(&self) -> ClientId {
        return self.doc.client_id();
    }

    pub fn next_clock(&self) -> u32 {
        return self.doc.next_clock();
    }

    /// State vector as it was when the transaction opened.
    pub fn before_state(&self) -> &StateVector {
        return &self.before_state;
    }

    pub fn get_array(&self, name: &str) -> ArrayRef {
        return ArrayRef::new(name);
    }

    pub fn get_text(&self, name: &str) -> TextRef {
        return TextRef::new(name);
    }

    /// Encode everything a peer at `remote` is missing, including changes
    /// made so far in this transaction.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        return Update::diff(&self.doc.store, remote).encode();
    }

    /// Decode an update and integrate it.
    ///
    /// Nothing is modified if the bytes are malformed. Blocks that depend on
    /// history not seen yet are kept and retried on later applies.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let update = Update::decode(bytes)?;
        self.integrate_update(update);
        return Ok(());
    }

    /// Integrate a decoded update together with whatever was pending.
    pub(crate) fn integrate_update(&mut self, mut update: Update) {
        let blocks = update.block_count();
        if let Some(pending) = self.doc.pending.take() {
            update.merge(pending);
        }

        let local = self.doc.client_id();
        let local_state = self.doc.store.state(local);

        let Integration { rest, collision } = update.integrate(self);

        if !rest.is_empty() {
            tracing::warn!(
                pending_blocks = rest.block_count(),
                pending_deletes = rest.delete_set().tick_count(),
                "update depends on missing history"
            );
            self.doc.pending = Some(rest);
        }

        if collision {
            tracing::warn!(client = local, "update carries different blocks under the local client id");
        }
        if collision || self.doc.store.state(local) > local_state {
            // Someone else produced blocks under our client id
            self.doc.reselect_client_id();
        }

        tracing::debug!(
            blocks,
            roots = self.changed.len(),
            pending = self.doc.pending.is_some(),
            "applied update"
        );
    }

    // =========================================================================
    // Mutation primitives
    // =========================================================================

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Open => return Ok(()),
            State::Committing | State::Closed => return Err(Error::TransactionClosed),
        }
    }

    pub(crate) fn store_mut(&mut self) -> &mut BlockStore {
        return &mut self.doc.store;
    }

    pub(crate) fn touch(&mut self, root: Arc<str>) {
        self.changed.insert(root);
    }

    /// Record blocks newly tombstoned by this transaction.
    pub(crate) fn mark_deleted(&mut self, ids: &[Id]) {
        for id in ids {
            if let Some(block) = self.doc.store.get(*id) {
                self.deleted.insert(block.id, block.len);
                self.changed.insert(block.parent.clone());
            }
        }
    }

    /// Insert contents as consecutive blocks at a visible index of a root.
    pub(crate) fn insert_contents(
        &mut self,
        root: &str,
        index: u32,
        contents: Vec<Content>,
        skip_zero_width: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        if contents.iter().all(|c| c.is_empty()) {
            let len = self.doc.store.root_len(root);
            if index > len {
                return Err(Error::OutOfBounds { index, len });
            }
            return Ok(());
        }

        let mut at = self.doc.store.find_position(root, index, skip_zero_width)?;
        let root = self.doc.store.root(root);
        let client = self.doc.client_id();
        for content in contents {
            if content.is_empty() {
                continue;
            }
            let id = self.doc.store.insert_between(&root, client, at, content);
            at = Position {
                left: Some(id),
                right: at.right,
            };
        }
        self.changed.insert(root);
        return Ok(());
    }

    /// Insert one block right after the block starting at `left`.
    pub(crate) fn insert_after(&mut self, root: &str, left: Id, content: Content) -> Result<Id> {
        self.ensure_open()?;
        let right = self.doc.store.get(left).and_then(|b| b.right);
        let root = self.doc.store.root(root);
        let client = self.doc.client_id();
        let at = Position {
            left: Some(left),
            right,
        };
        let id = self.doc.store.insert_between(&root, client, at, content);
        self.changed.insert(root);
        return Ok(id);
    }

    /// Tombstone the whole block containing `id`, visible or not.
    pub(crate) fn delete_block(&mut self, id: Id) -> Result<()> {
        self.ensure_open()?;
        let Some(block) = self.doc.store.get(id) else {
            return Ok(());
        };
        let (start, len) = (block.id, block.len);
        let ids = self.doc.store.delete_id_range(start.client, start.clock, len);
        self.mark_deleted(&ids);
        return Ok(());
    }

    /// Delete up to `len` visible positions starting at `index`.
    ///
    /// Returns the content of the deleted blocks in document order.
    pub(crate) fn remove_range(&mut self, root: &str, index: u32, len: u32) -> Result<Vec<Content>> {
        self.ensure_open()?;
        let ids = self.doc.store.delete_range(root, index, len)?;
        let removed = ids
            .iter()
            .filter_map(|id| self.doc.store.get(*id))
            .map(|block| block.content.clone())
            .collect();
        self.mark_deleted(&ids);
        return Ok(removed);
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit the transaction. Calling it again is a no-op.
    pub fn commit(&mut self) {
        if self.state != State::Open {
            return;
        }
        self.state = State::Committing;
        self.deleted.squash();

        let doc = &mut *self.doc;
        doc.observers
            .dispatch(&doc.store, &self.before_state, &self.deleted, &self.changed);

        if doc.options.gc {
            doc.store.gc(&self.deleted);
        }
        doc.store.squash(&self.before_state, &self.deleted);

        self.state = State::Closed;
        tracing::debug!(
            client = doc.client_id(),
            roots = self.changed.len(),
            deleted = self.deleted.tick_count(),
            "committed transaction"
        );
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Transaction")
            .field("state", &self.state)
            .field("before_state", &self.before_state)
            .field("changed", &self.changed)
            .finish();
    }
}
