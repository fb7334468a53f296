//! Workspace error types.
//!
//! Provides the unified error type and the stable error codes every
//! component error maps onto.

use std::fmt;
use thiserror::Error;

use crate::types::{BlockId, BlockType, Lsn, TxnId};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Operation not supported.
    NotSupported = 0x0002,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Invalid configuration.
    InvalidConfig = 0x0004,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0101,
    /// Page checksum mismatch.
    ChecksumMismatch = 0x0102,

    // Storage errors (0x0200 - 0x02FF)
    /// Page has an unexpected block type.
    InvalidBlockType = 0x0200,
    /// Block freed twice or never allocated.
    DoubleFree = 0x0201,
    /// Row cannot fit into any block.
    RowTooLarge = 0x0202,
    /// Block is not present in the store.
    BlockNotFound = 0x0203,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction not found.
    TransactionNotFound = 0x0300,
    /// Transaction is not active.
    TransactionNotActive = 0x0301,
    /// Advisory lock unavailable.
    LockUnavailable = 0x0302,

    // WAL errors (0x0400 - 0x04FF)
    /// WAL is corrupted.
    WalCorrupted = 0x0400,
    /// WAL write failed.
    WalWriteFailed = 0x0401,

    // Engine errors (0x0500 - 0x05FF)
    /// Every TapeSet is busy.
    TapeSetBusy = 0x0500,
    /// A prerequisite transaction is not yet visible.
    NotYet = 0x0501,
    /// Illegal TapeSet state transition.
    InvalidState = 0x0502,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Storage",
            0x03 => "Transaction",
            0x04 => "WAL",
            0x05 => "Engine",
            _ => "Unknown",
        }
    }

    /// Returns true if an operation failing with this code may succeed when
    /// retried later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TapeSetBusy | Self::NotYet | Self::LockUnavailable)
    }

    /// Returns true if this code reports a structural problem that must
    /// abort the operation.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Internal
                | Self::Corruption
                | Self::ChecksumMismatch
                | Self::InvalidBlockType
                | Self::DoubleFree
                | Self::RowTooLarge
                | Self::WalCorrupted
                | Self::InvalidState
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for SortHeap.
///
/// Each variant includes relevant context for debugging.
///
/// # Example
///
/// ```rust
/// use sortheap_common::error::{SortHeapError, SortHeapResult};
///
/// fn update() -> SortHeapResult<()> {
///     Err(SortHeapError::not_supported("update"))
/// }
/// assert!(update().is_err());
/// ```
#[derive(Debug, Error)]
pub enum SortHeapError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Operation not supported.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Data corruption detected.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch.
    #[error("checksum mismatch on block {block}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Block whose checksum failed.
        block: BlockId,
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    /// A page was read as the wrong block type.
    #[error("block {block} has type {actual}, expected {expected}")]
    InvalidBlockType {
        /// The block.
        block: BlockId,
        /// Expected type.
        expected: BlockType,
        /// Type found on the page.
        actual: BlockType,
    },

    /// A block was freed that is not allocated.
    #[error("double free of block {block}")]
    DoubleFree {
        /// The block.
        block: BlockId,
    },

    /// A row cannot fit into a block.
    #[error("row of {size} bytes exceeds maximum tuple size {max_size}")]
    RowTooLarge {
        /// Encoded row size.
        size: usize,
        /// Maximum size.
        max_size: usize,
    },

    /// A block was requested that the store does not contain.
    #[error("block {block} not found")]
    BlockNotFound {
        /// The block.
        block: BlockId,
    },

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// Transaction not found.
    #[error("transaction {txn_id} not found")]
    TransactionNotFound {
        /// The missing transaction.
        txn_id: TxnId,
    },

    /// Transaction is not active.
    #[error("transaction {txn_id} is not active")]
    TransactionNotActive {
        /// The transaction.
        txn_id: TxnId,
    },

    /// Advisory lock unavailable.
    #[error("lock unavailable: {reason}")]
    LockUnavailable {
        /// Why the lock could not be taken.
        reason: String,
    },

    // ==========================================================================
    // WAL Errors
    // ==========================================================================
    /// WAL is corrupted.
    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted {
        /// The LSN where corruption was detected.
        lsn: Lsn,
        /// Reason for corruption.
        reason: String,
    },

    /// WAL write failed.
    #[error("WAL write failed: {reason}")]
    WalWriteFailed {
        /// Reason for failure.
        reason: String,
    },

    // ==========================================================================
    // Engine Errors
    // ==========================================================================
    /// No TapeSet could be locked.
    #[error("all TapeSets busy: {reason}")]
    TapeSetBusy {
        /// Context.
        reason: String,
    },

    /// Work cannot proceed until another transaction becomes visible.
    #[error("not yet: {reason}")]
    NotYet {
        /// Context.
        reason: String,
    },

    /// Illegal state transition.
    #[error("invalid state transition: {message}")]
    InvalidState {
        /// Context.
        message: String,
    },

    /// An error raised by a component, already classified.
    #[error("{message}")]
    Component {
        /// The stable code.
        code: ErrorCode,
        /// Rendered component error.
        message: String,
    },
}

impl SortHeapError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::InvalidBlockType { .. } => ErrorCode::InvalidBlockType,
            Self::DoubleFree { .. } => ErrorCode::DoubleFree,
            Self::RowTooLarge { .. } => ErrorCode::RowTooLarge,
            Self::BlockNotFound { .. } => ErrorCode::BlockNotFound,
            Self::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
            Self::TransactionNotActive { .. } => ErrorCode::TransactionNotActive,
            Self::LockUnavailable { .. } => ErrorCode::LockUnavailable,
            Self::WalCorrupted { .. } => ErrorCode::WalCorrupted,
            Self::WalWriteFailed { .. } => ErrorCode::WalWriteFailed,
            Self::TapeSetBusy { .. } => ErrorCode::TapeSetBusy,
            Self::NotYet { .. } => ErrorCode::NotYet,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::Component { code, .. } => *code,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Returns true if this error must abort the operation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a not-supported error.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Wraps an already classified component error.
    #[must_use]
    pub fn component(code: ErrorCode, error: &impl fmt::Display) -> Self {
        Self::Component {
            code,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = SortHeapError::DoubleFree {
            block: BlockId::new(42),
        };
        assert_eq!(err.code(), ErrorCode::DoubleFree);
        assert_eq!(err.code().category(), "Storage");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SortHeapError::InvalidBlockType {
            block: BlockId::new(3),
            expected: BlockType::Data,
            actual: BlockType::TapeAux,
        };
        assert_eq!(err.to_string(), "block 3 has type TapeAux, expected Data");
    }

    #[test]
    fn test_retryable() {
        let busy = SortHeapError::TapeSetBusy {
            reason: "merge".into(),
        };
        assert!(busy.is_retryable());
        assert!(!busy.is_fatal());
        assert_eq!(busy.code().category(), "Engine");
        assert!(!SortHeapError::not_supported("delete").is_retryable());
    }

    #[test]
    fn test_component() {
        let err = SortHeapError::component(ErrorCode::NotYet, &"insert xid 7 in progress");
        assert_eq!(err.code(), ErrorCode::NotYet);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "insert xid 7 in progress");
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SortHeapError = io_err.into();
        assert_eq!(err.code(), ErrorCode::Io);
        assert_eq!(err.code().category(), "I/O");
    }
}
