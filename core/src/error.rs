//! Error types for the record codec

use thiserror::Error;

/// Error decoding an encoded record
///
/// Both variants mean the bytes do not hold a valid record. They are kept
/// apart because a storage layer treats them differently: a `Truncated`
/// record at the very end of a log is a torn append, anything else is
/// corruption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The header claims more bytes than are available
    #[error("truncated record: need {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the record claims to occupy (header included)
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// The record is internally inconsistent
    #[error("corrupt record: {reason}")]
    Corrupt {
        /// What was inconsistent
        reason: &'static str,
    },
}

impl CodecError {
    /// Returns true if more bytes could have made the record valid
    pub fn is_truncated(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }
}
