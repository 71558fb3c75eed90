//! Typed views over the roots of a document.
//!
//! A view is just a root name. Reads take any [`ReadTxn`](crate::ReadTxn),
//! writes any [`WriteTxn`](crate::WriteTxn), so the same call works on a bare
//! document (one transaction per call) or inside an explicit transaction.

pub mod array;
pub mod text;

use std::ops::Bound;
use std::ops::RangeBounds;

use crate::error::Error;
use crate::error::Result;

/// Resolve a range against a sequence of `len` positions into
/// `(start, count)`, clamping the end.
pub(crate) fn resolve_range(range: impl RangeBounds<u32>, len: u32) -> Result<(u32, u32)> {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    };
    if start > len {
        return Err(Error::OutOfBounds { index: start, len });
    }
    let end = end.min(len).max(start);
    return Ok((start, end - start));
}
