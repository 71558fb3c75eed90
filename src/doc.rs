//! Documents: the unit of replication.
//!
//! A [`Doc`] owns the block store of every root, the observer table and any
//! update still waiting on missing history. Replicas converge by exchanging
//! [`Doc::encode_diff`] output and feeding it to [`Doc::apply_update`].
//!
//! ```
//! use tandem::Doc;
//!
//! let mut local = Doc::new();
//! let mut remote = Doc::new();
//!
//! let array = remote.get_array("my array");
//! array.push(&mut remote, ["world"]).unwrap();
//!
//! let update = remote.encode_diff(&local.state_vector());
//! local.apply_update(&update).unwrap();
//! assert_eq!(local.get_array("my array").to_vec(&local), vec![serde_json::json!("world")]);
//! ```

use std::fmt;

use crate::crdt::Crdt;
use crate::crdt::primitives::ClientId;
use crate::crdt::primitives::StateVector;
use crate::crdt::primitives::random_client_id;
use crate::crdt::store::BlockStore;
use crate::error::Result;
use crate::event::Observers;
use crate::event::SubscriptionId;
use crate::transaction::Transaction;
use crate::types::array::ArrayRef;
use crate::types::text::TextRef;
use crate::update::Update;

// =============================================================================
// Options
// =============================================================================

/// Document configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Fixed client id. Picked at random when unset.
    pub client_id: Option<ClientId>,
    /// Drop the content of deleted blocks on commit.
    pub gc: bool,
}

impl Default for Options {
    fn default() -> Self {
        return Options {
            client_id: None,
            gc: true,
        };
    }
}

impl Options {
    pub fn new() -> Options {
        return Options::default();
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Options {
        self.client_id = Some(client_id);
        return self;
    }

    pub fn with_gc(mut self, gc: bool) -> Options {
        self.gc = gc;
        return self;
    }
}

// =============================================================================
// Document
// =============================================================================

/// A replicated document.
pub struct Doc {
    client_id: ClientId,
    pub(crate) options: Options,
    pub(crate) store: BlockStore,
    pub(crate) observers: Observers,
    /// Decoded blocks and deletes waiting on history not seen yet.
    pub(crate) pending: Option<Update>,
}

impl Doc {
    pub fn new() -> Doc {
        return Doc::with_options(Options::default());
    }

    pub fn with_options(options: Options) -> Doc {
        let client_id = options.client_id.unwrap_or_else(random_client_id);
        return Doc {
            client_id,
            options,
            store: BlockStore::new(),
            observers: Observers::default(),
            pending: None,
        };
    }

    /// Client id stamped on local changes.
    pub fn client_id(&self) -> ClientId {
        return self.client_id;
    }

    /// Clock the next local block will start at.
    pub fn next_clock(&self) -> u32 {
        return self.store.state(self.client_id);
    }

    pub fn options(&self) -> &Options {
        return &self.options;
    }

    /// Open a transaction. It commits on [`Transaction::commit`] or drop.
    pub fn transact(&mut self) -> Transaction<'_> {
        return Transaction::new(self);
    }

    /// Handle to the array root named `name`. The root is created on first
    /// write.
    pub fn get_array(&self, name: &str) -> ArrayRef {
        return ArrayRef::new(name);
    }

    /// Handle to the text root named `name`.
    pub fn get_text(&self, name: &str) -> TextRef {
        return TextRef::new(name);
    }

    pub fn state_vector(&self) -> StateVector {
        return self.store.state_vector();
    }

    /// Encode every block a peer at `remote` has not seen, plus all
    /// deletions.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        return Update::diff(&self.store, remote).encode();
    }

    /// Encode the whole document.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        return self.encode_diff(&StateVector::default());
    }

    /// Apply an update in its own transaction.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        let update = Update::decode(bytes)?;
        let mut txn = self.transact();
        txn.integrate_update(update);
        txn.commit();
        return Ok(());
    }

    /// Whether some received changes are still waiting on missing history.
    pub fn has_pending(&self) -> bool {
        return self.pending.as_ref().is_some_and(|p| !p.is_empty());
    }

    /// Detach an observer. Returns false if it was not attached.
    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        return self.observers.unsubscribe(id);
    }

    /// Pick a fresh client id after a remote update used ours.
    pub(crate) fn reselect_client_id(&mut self) {
        let previous = self.client_id;
        let mut next = random_client_id();
        while next == previous || self.store.contains_client(next) {
            next = random_client_id();
        }
        self.client_id = next;
        tracing::debug!(previous, next, "client id collision, reselected");
    }
}

impl Default for Doc {
    fn default() -> Self {
        return Doc::new();
    }
}

impl Crdt for Doc {
    /// Pull in everything `other` has that this document lacks.
    fn merge(&mut self, other: &Self) {
        let update = Update::diff(&other.store, &self.store.state_vector());
        let mut txn = self.transact();
        txn.integrate_update(update);
        txn.commit();
    }
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Doc")
            .field("client_id", &self.client_id)
            .field("options", &self.options)
            .field("state", &self.store.state_vector())
            .field("observers", &self.observers)
            .field("pending", &self.has_pending())
            .finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_defaults() {
        let options = Options::default();
        assert_eq!(options.client_id, None);
        assert!(options.gc);

        let doc = Doc::with_options(Options::new().with_client_id(42).with_gc(false));
        assert_eq!(doc.client_id(), 42);
        assert!(!doc.options().gc);
    }

    #[test]
    fn next_clock_counts_local_ticks() {
        let mut doc = Doc::with_options(Options::new().with_client_id(1));
        assert_eq!(doc.next_clock(), 0);
        doc.get_text("t").push(&mut doc, "abc").unwrap();
        assert_eq!(doc.next_clock(), 3);
        doc.get_array("a").push(&mut doc, [1, 2]).unwrap();
        assert_eq!(doc.next_clock(), 5);
        assert_eq!(doc.state_vector().get(1), 5);
    }

    #[test]
    fn same_name_same_root() {
        let mut doc = Doc::new();
        let a = doc.get_array("shared");
        a.push(&mut doc, [1]).unwrap();
        let b = doc.get_array("shared");
        assert_eq!(b.to_vec(&doc), vec![json!(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn sync_into_empty_document() {
        let mut local = Doc::new();
        let mut remote = Doc::new();
        remote.get_array("my array").push(&mut remote, ["world"]).unwrap();

        let update = remote.encode_diff(&local.state_vector());
        local.apply_update(&update).unwrap();
        assert_eq!(local.get_array("my array").to_vec(&local), vec![json!("world")]);
        assert_eq!(local.state_vector(), remote.state_vector());
    }

    #[test]
    fn malformed_update_leaves_document_untouched() {
        let mut doc = Doc::with_options(Options::new().with_client_id(1));
        doc.get_text("t").push(&mut doc, "keep").unwrap();
        let before = doc.encode_state_as_update();

        let err = doc.apply_update(&[0x05, 0x01]).unwrap_err();
        assert!(err.is_decode_error());
        assert_eq!(doc.encode_state_as_update(), before);
    }

    #[test]
    fn out_of_order_updates_wait_then_apply() {
        let mut source = Doc::with_options(Options::new().with_client_id(1));
        let text = source.get_text("t");
        text.push(&mut source, "ab").unwrap();
        let first = source.encode_state_as_update();
        let sv = source.state_vector();
        text.push(&mut source, "cd").unwrap();
        let second = source.encode_diff(&sv);

        let mut sink = Doc::with_options(Options::new().with_client_id(2));
        sink.apply_update(&second).unwrap();
        assert!(sink.has_pending());
        assert_eq!(sink.get_text("t").to_plain_text(&sink), "");

        sink.apply_update(&first).unwrap();
        assert!(!sink.has_pending());
        assert_eq!(sink.get_text("t").to_plain_text(&sink), "abcd");
    }

    #[test]
    fn client_id_collision_reselects() {
        let mut a = Doc::with_options(Options::new().with_client_id(7));
        a.get_array("a").push(&mut a, [1]).unwrap();

        let mut b = Doc::with_options(Options::new().with_client_id(7));
        b.apply_update(&a.encode_state_as_update()).unwrap();
        assert_ne!(b.client_id(), 7);

        // Local writes now use the fresh id and do not clash with a's blocks.
        b.get_array("a").push(&mut b, [2]).unwrap();
        a.apply_update(&b.encode_state_as_update()).unwrap();
        assert_eq!(a.get_array("a").to_vec(&a), vec![json!(1), json!(2)]);
    }

    #[test]
    fn both_writers_under_one_id_reselect() {
        let mut a = Doc::with_options(Options::new().with_client_id(7));
        let mut b = Doc::with_options(Options::new().with_client_id(7));
        a.get_array("a").push(&mut a, [1]).unwrap();
        b.get_array("a").push(&mut b, [2]).unwrap();

        let from_a = a.encode_state_as_update();
        let from_b = b.encode_state_as_update();
        a.apply_update(&from_b).unwrap();
        b.apply_update(&from_a).unwrap();
        assert_ne!(a.client_id(), 7);
        assert_ne!(b.client_id(), 7);
        assert_ne!(a.client_id(), b.client_id());

        // Writes after the collision reach the other side.
        a.get_array("a").push(&mut a, [3]).unwrap();
        b.apply_update(&a.encode_diff(&b.state_vector())).unwrap();
        b.get_array("a").push(&mut b, [4]).unwrap();
        a.apply_update(&b.encode_diff(&a.state_vector())).unwrap();
        assert!(a.get_array("a").to_vec(&a).ends_with(&[json!(3), json!(4)]));
        assert!(b.get_array("a").to_vec(&b).ends_with(&[json!(3), json!(4)]));
    }

    #[test]
    fn own_blocks_echoed_back_keep_the_id() {
        let mut a = Doc::with_options(Options::new().with_client_id(7));
        let mut b = Doc::with_options(Options::new().with_client_id(8));
        a.get_text("t").push(&mut a, "hello").unwrap();
        b.apply_update(&a.encode_state_as_update()).unwrap();
        b.get_text("t").insert(&mut b, 2, "-").unwrap();

        a.apply_update(&b.encode_state_as_update()).unwrap();
        assert_eq!(a.client_id(), 7);
        assert_eq!(a.get_text("t").to_plain_text(&a), "he-llo");
    }

    #[test]
    fn merge_pulls_missing_changes() {
        let mut a = Doc::with_options(Options::new().with_client_id(1));
        let mut b = Doc::with_options(Options::new().with_client_id(2));
        a.get_text("t").push(&mut a, "left").unwrap();
        b.get_text("t").push(&mut b, "right").unwrap();

        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.get_text("t").to_plain_text(&a), b.get_text("t").to_plain_text(&b));
        assert_eq!(a.get_text("t").to_plain_text(&a), "leftright");
    }
}
