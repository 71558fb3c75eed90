//! Error types.
//!
//! Positional errors are validated before the block store is touched, and
//! update bytes are decoded completely before anything is integrated, so a
//! returned error never leaves a document half-modified.

use thiserror::Error;

/// Errors returned by document operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// A position or range lies outside the current visible sequence.
    #[error("index {index} is out of bounds for length {len}")]
    OutOfBounds { index: u32, len: u32 },

    /// Update bytes could not be decoded. The document is unchanged.
    #[error("failed to decode update: {0}")]
    Decode(#[from] DecodeError),

    /// A mutation was attempted through a transaction that already committed.
    #[error("transaction is already committed")]
    TransactionClosed,
}

impl Error {
    /// Check if this error is a bounds violation
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Error::OutOfBounds { .. })
    }

    /// Check if this error came from malformed update bytes
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Error::Decode(_))
    }
}

/// Ways update or state vector bytes can be malformed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// A variable-length integer does not fit its target type.
    #[error("variable-length integer overflows")]
    VarIntOverflow,

    /// A string payload is not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// A block carries a content tag this version does not know.
    #[error("unknown content tag {0}")]
    UnknownContent(u8),

    /// An embedded value payload is not valid JSON.
    #[error("invalid embedded value: {0}")]
    InvalidValue(String),

    /// A block is structurally impossible (empty, overflowing clock, ...).
    #[error("invalid block: {0}")]
    InvalidBlock(&'static str),

    /// Bytes remained after the last expected value.
    #[error("{0} trailing bytes after update")]
    TrailingBytes(usize),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
