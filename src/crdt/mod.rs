//! The replicated block model.
//!
//! - [`primitives`]: ids, client ids and state vectors
//! - [`block`]: block and content types
//! - [`store`]: the block arena and per-root linked sequences
//! - [`yata`]: the pure conflict resolver used by integration
//! - [`delete_set`]: compact tombstone ranges

pub mod block;
pub mod delete_set;
pub mod primitives;
pub mod store;
pub mod yata;

/// A CRDT is a data type with a merge operator that is commutative,
/// associative, and idempotent.
pub trait Crdt {
    /// Merge another instance into this one.
    fn merge(&mut self, other: &Self);
}
