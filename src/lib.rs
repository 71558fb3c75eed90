//! Tandem - a replicated document engine using the YATA CRDT.
//!
//! Replicas edit shared arrays and rich text independently and exchange
//! compact binary updates. Updates merge deterministically in any order, any
//! number of times, so every replica converges to the same state.
//!
//! # Quick Start
//!
//! ```
//! use tandem::Doc;
//!
//! let mut doc = Doc::new();
//! let text = doc.get_text("notes");
//!
//! text.push(&mut doc, "abd").unwrap();
//! text.insert(&mut doc, 2, "c").unwrap();
//! assert_eq!(text.to_plain_text(&doc), "abcd");
//!
//! // Several operations in one transaction, committed on drop.
//! let list = doc.get_array("list");
//! {
//!     let mut txn = doc.transact();
//!     list.push(&mut txn, [1, 2, 3]).unwrap();
//!     list.remove(&mut txn, 0).unwrap();
//! }
//! assert_eq!(list.len(&doc), 2);
//! ```

pub mod crdt;
pub mod doc;
pub mod error;
pub mod event;
pub mod transaction;
pub mod types;
pub mod update;

pub use crdt::Crdt;
pub use crdt::block::Attrs;
pub use crdt::primitives::ClientId;
pub use crdt::primitives::Id;
pub use crdt::primitives::StateVector;
pub use doc::Doc;
pub use doc::Options;
pub use error::DecodeError;
pub use error::Error;
pub use error::Result;
pub use event::ArrayDelta;
pub use event::ArrayEvent;
pub use event::Delta;
pub use event::Event;
pub use event::SubscriptionId;
pub use event::TextChunk;
pub use event::TextDelta;
pub use event::TextEvent;
pub use transaction::ReadTxn;
pub use transaction::Transaction;
pub use transaction::WriteTxn;
pub use types::array::ArrayRef;
pub use types::text::RichChunk;
pub use types::text::TextRef;
pub use update::Update;
